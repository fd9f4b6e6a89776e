/// Legacy API errno reported when the polling user lacks a privilege.
pub const ZAPI_PERMISSION_DENIED: &str = "13003";

/// Errors raised while talking to an appliance or interpreting its data.
///
/// Every variant maps to a [`Recovery`] policy through
/// [`PollError::recovery`], which the scheduler uses to decide whether a
/// failed poll is retried on the next tick, ends the collector, or is
/// only logged.
///
/// # Examples
///
/// ```rust
/// use stormon_common::error::{PollError, Recovery};
///
/// let err = PollError::NoInstance("no volume instances on cluster".to_string());
/// assert_eq!(err.recovery(), Recovery::Empty);
/// assert!(err.to_string().contains("volume"));
/// ```
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PollError {
    /// Transport-level failure: DNS, TCP, TLS, or a client timeout.
    #[error("connection error: {0}")]
    Connection(String),

    /// The appliance answered with a non-2xx status other than 401/403.
    #[error("API response error: status={status}, message={message}, code={code}, target={target}, api={api}")]
    ApiResponse {
        status: u16,
        code: String,
        message: String,
        target: String,
        api: String,
    },

    /// The appliance rejected the credentials (HTTP 401).
    #[error("authentication failed: api={api}")]
    AuthFailed { api: String },

    /// HTTP 403 or legacy errno 13003.
    #[error("permission denied: api={api}, reason={reason}")]
    PermissionDenied { api: String, reason: String },

    /// The query returned zero records.
    #[error("no instances: {0}")]
    NoInstance(String),

    /// None of the requested metrics could be collected.
    #[error("no metrics: {0}")]
    NoMetric(String),

    /// Malformed XML or JSON.
    #[error("parse error: {0}")]
    Parse(String),

    /// Legacy API answered `status != passed`.
    #[error("API request rejected: errno={errno}, reason={reason}")]
    ApiRequestRejected { errno: String, reason: String },

    /// A required template or config parameter is absent.
    #[error("missing parameter: {0}")]
    MissingParam(String),

    /// A template entry is malformed.
    #[error("invalid item: {0}")]
    InvalidItem(String),

    /// A parameter has an unusable value.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// An expected field is absent from a response.
    #[error("attribute not found: {0}")]
    AttributeNotFound(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),
}

/// What the polling loop does after a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Abort this poll and retry at the next tick.
    Retry,
    /// Warn and publish empty matrices.
    Empty,
    /// Stop polling with this collector.
    Fatal,
    /// Log and continue with partial data.
    Continue,
}

impl PollError {
    pub fn recovery(&self) -> Recovery {
        match self {
            PollError::Connection(_)
            | PollError::ApiResponse { .. }
            | PollError::Parse(_)
            | PollError::AuthFailed { .. } => Recovery::Retry,
            PollError::ApiRequestRejected { errno, .. } => {
                if errno == ZAPI_PERMISSION_DENIED {
                    Recovery::Fatal
                } else {
                    Recovery::Retry
                }
            }
            PollError::NoInstance(_) | PollError::NoMetric(_) => Recovery::Empty,
            PollError::PermissionDenied { .. }
            | PollError::MissingParam(_)
            | PollError::InvalidItem(_)
            | PollError::InvalidParam(_)
            | PollError::Config(_) => Recovery::Fatal,
            PollError::AttributeNotFound(_) => Recovery::Continue,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.recovery() == Recovery::Fatal
    }

    /// Short stable name used as the status label in the metadata matrix.
    pub fn kind(&self) -> &'static str {
        match self {
            PollError::Connection(_) => "connection_error",
            PollError::ApiResponse { .. } => "api_response",
            PollError::AuthFailed { .. } => "auth_failed",
            PollError::PermissionDenied { .. } => "permission_denied",
            PollError::NoInstance(_) => "no_instance",
            PollError::NoMetric(_) => "no_metric",
            PollError::Parse(_) => "parse_error",
            PollError::ApiRequestRejected { .. } => "api_request_rejected",
            PollError::MissingParam(_) => "missing_param",
            PollError::InvalidItem(_) => "invalid_item",
            PollError::InvalidParam(_) => "invalid_param",
            PollError::AttributeNotFound(_) => "attribute_not_found",
            PollError::Config(_) => "config_error",
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            PollError::ApiResponse { status, .. } => Some(*status),
            PollError::AuthFailed { .. } => Some(401),
            PollError::PermissionDenied { .. } => Some(403),
            _ => None,
        }
    }

    /// Builds the legacy rejection error, promoting errno 13003 to
    /// [`PollError::PermissionDenied`].
    pub fn rejected(api: &str, errno: &str, reason: &str) -> Self {
        if errno == ZAPI_PERMISSION_DENIED {
            PollError::PermissionDenied {
                api: api.to_string(),
                reason: reason.to_string(),
            }
        } else {
            PollError::ApiRequestRejected {
                errno: errno.to_string(),
                reason: reason.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for PollError {
    fn from(e: serde_json::Error) -> Self {
        PollError::Parse(e.to_string())
    }
}

impl From<quick_xml::Error> for PollError {
    fn from(e: quick_xml::Error) -> Self {
        PollError::Parse(e.to_string())
    }
}

impl From<serde_yaml::Error> for PollError {
    fn from(e: serde_yaml::Error) -> Self {
        PollError::Config(e.to_string())
    }
}

/// Convenience type alias so callers can write `error::Result<T>`.
pub type Result<T> = std::result::Result<T, PollError>;
