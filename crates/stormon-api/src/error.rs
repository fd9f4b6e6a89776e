pub use stormon_common::error::{PollError, Result};

/// Maps a transport failure to [`PollError::Connection`], keeping the API
/// path in the message.
pub(crate) fn transport_error(api: &str, err: reqwest::Error) -> PollError {
    if err.is_timeout() {
        PollError::Connection(format!("{api}: request timed out: {err}"))
    } else {
        PollError::Connection(format!("{api}: {err}"))
    }
}

/// Error for a non-2xx status other than 401.
pub(crate) fn status_error(
    api: &str,
    status: u16,
    code: String,
    message: String,
    target: String,
) -> PollError {
    if status == 403 {
        return PollError::PermissionDenied {
            api: api.to_string(),
            reason: message,
        };
    }
    PollError::ApiResponse {
        status,
        code,
        message,
        target,
        api: api.to_string(),
    }
}
