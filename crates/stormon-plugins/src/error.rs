use stormon_common::error::PollError;
use stormon_common::matrix::MatrixError;

/// Errors raised while building or running a plugin.
///
/// Construction errors surface at collector init and are fatal there.
/// Run errors are contained by the pipeline: the failing plugin is logged
/// and contributes no derived matrices.
///
/// # Examples
///
/// ```rust
/// use stormon_plugins::error::PluginError;
///
/// let err = PluginError::UnknownPlugin("Histogram".to_string());
/// assert!(err.to_string().contains("Histogram"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The template names a plugin that is neither built in nor registered.
    #[error("Plugin: unknown plugin '{0}'")]
    UnknownPlugin(String),

    /// The plugin was declared without any usable rule.
    #[error("Plugin: missing parameter: {0}")]
    MissingParam(String),

    /// A rule line could not be parsed.
    #[error("Plugin: invalid rule [{rule}]: {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("Plugin: {0}")]
    Matrix(#[from] MatrixError),

    /// Failure reported by a user-defined plugin.
    #[error("Plugin: {0}")]
    Custom(String),
}

impl PluginError {
    pub(crate) fn invalid(rule: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRule {
            rule: rule.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<PluginError> for PollError {
    fn from(e: PluginError) -> Self {
        match e {
            PluginError::MissingParam(name) => PollError::MissingParam(name),
            PluginError::UnknownPlugin(_) | PluginError::InvalidRule { .. } => {
                PollError::InvalidParam(e.to_string())
            }
            PluginError::Matrix(m) => m.into(),
            PluginError::Custom(msg) => PollError::InvalidItem(msg),
        }
    }
}

/// Convenience type alias so callers can write `error::Result<T>`.
pub type Result<T> = std::result::Result<T, PluginError>;
