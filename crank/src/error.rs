use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Broad classification of where an error originated.
///
/// This mirrors the class hierarchy a dynamic-language version of this
/// service would use (`NetworkError`, `SettlementError`, ...) collapsed into
/// one tagged enum: catch-by-type becomes pattern matching on `kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Blockchain,
    Mpc,
    RateLimit,
    Validation,
    Settlement,
    PrivateTransfer,
    Order,
    Internal,
}

impl ErrorKind {
    /// Numeric code range for this kind, per spec Sec. 7.
    pub fn code_base(self) -> u32 {
        match self {
            ErrorKind::Network => 1000,
            ErrorKind::Blockchain => 2000,
            ErrorKind::Mpc => 3000,
            ErrorKind::RateLimit => 4000,
            ErrorKind::Validation => 5000,
            ErrorKind::Settlement => 6000,
            ErrorKind::PrivateTransfer => 7000,
            ErrorKind::Order => 8000,
            ErrorKind::Internal => 9000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

/// The single error type the CORE surfaces across every subsystem.
///
/// Carries everything spec Sec. 7 requires: a kind tag, a numeric code, a
/// human message, an optional cause, structured context, whether the
/// failure is retryable, a severity, and a timestamp.
#[derive(Debug, thiserror::Error)]
#[error("[{kind:?}:{code}] {message}")]
pub struct CrankError {
    pub kind: ErrorKind,
    pub code: u32,
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    pub context: BTreeMap<String, String>,
    pub retryable: bool,
    pub severity: Severity,
    pub timestamp: u64,
}

impl CrankError {
    pub fn new(kind: ErrorKind, offset: u32, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.code_base() + offset,
            message: message.into(),
            cause: None,
            context: BTreeMap::new(),
            retryable: false,
            severity: Severity::Error,
            timestamp: now_unix(),
        }
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn network(offset: u32, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, offset, message).retryable(true)
    }

    pub fn settlement(offset: u32, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Settlement, offset, message)
    }

    pub fn private_transfer(offset: u32, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PrivateTransfer, offset, message)
    }

    pub fn validation(offset: u32, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, offset, message).severity(Severity::Warning)
    }

    pub fn mpc(offset: u32, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Mpc, offset, message)
    }

    pub fn internal(offset: u32, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, offset, message).severity(Severity::Critical)
    }
}

impl From<sqlx::Error> for CrankError {
    fn from(err: sqlx::Error) -> Self {
        CrankError::new(ErrorKind::Internal, 1, "operational store error")
            .retryable(matches!(err, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)))
            .with_cause(err)
    }
}

impl From<reqwest::Error> for CrankError {
    fn from(err: reqwest::Error) -> Self {
        let retryable = err.is_timeout() || err.is_connect() || err.status().map(|s| {
            s.as_u16() == 429 || s.as_u16() == 503
        }).unwrap_or(true);
        CrankError::new(ErrorKind::Network, 1, "relayer request failed")
            .retryable(retryable)
            .with_cause(err)
    }
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub type CrankResult<T> = Result<T, CrankError>;
