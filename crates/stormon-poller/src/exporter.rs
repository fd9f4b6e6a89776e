use async_trait::async_trait;
use stormon_common::matrix::Matrix;

/// Destination of polled matrices.
#[async_trait]
pub trait Exporter: Send + Sync {
    fn name(&self) -> &str;

    /// Exports `matrices` and returns how many rows were written.
    async fn export(&self, matrices: &[Matrix]) -> anyhow::Result<usize>;
}

/// Writes export rows to the log.
#[derive(Debug, Default)]
pub struct LogExporter;

#[async_trait]
impl Exporter for LogExporter {
    fn name(&self) -> &str {
        "log"
    }

    async fn export(&self, matrices: &[Matrix]) -> anyhow::Result<usize> {
        let mut total = 0;
        for matrix in matrices {
            let rows = matrix.export_rows();
            for row in &rows {
                tracing::debug!(
                    object = %row.object,
                    instance = %row.instance_key,
                    metric = %row.metric,
                    value = row.value,
                    labels = ?row.labels,
                    "row"
                );
            }
            total += rows.len();
        }
        tracing::info!(matrices = matrices.len(), rows = total, "exported");
        Ok(total)
    }
}
