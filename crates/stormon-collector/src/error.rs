pub use stormon_common::error::{PollError, Recovery, Result};

/// Whether a legacy rejection asks for smaller batches.
pub(crate) fn is_resource_limit(err: &PollError) -> bool {
    matches!(err, PollError::ApiRequestRejected { reason, .. } if reason.contains("resource limit exceeded"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_detect_resource_limit_rejections() {
        let err = PollError::rejected("perf-object-get-instances", "13001", "resource limit exceeded");
        assert!(is_resource_limit(&err));
        assert!(!is_resource_limit(&PollError::Parse("resource limit exceeded".into())));
    }
}
