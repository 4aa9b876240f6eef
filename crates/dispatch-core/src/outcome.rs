use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Why a task did not succeed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[default]
    None,
    /// Connection, DNS, TLS or timeout; no response was received
    Transport,
    /// A response arrived with a non-2xx status
    Status,
    /// A 2xx response whose body could not be decoded
    Decode,
    /// A decoded 2xx response that carries a failure marker
    UpstreamSemantic,
}

impl ErrorKind {
    /// Failure kinds in report order.
    pub const FAILURES: [ErrorKind; 4] = [
        ErrorKind::Transport,
        ErrorKind::Status,
        ErrorKind::Decode,
        ErrorKind::UpstreamSemantic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Transport => "transport",
            Self::Status => "status",
            Self::Decode => "decode",
            Self::UpstreamSemantic => "upstream_semantic",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The recorded result of executing one task. Built only through the
/// constructors below so `success` always agrees with `error_kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    task_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    status_code: Option<u16>,
    #[serde(rename = "elapsed_ms", with = "duration_ms")]
    elapsed: Duration,
    success: bool,
    error_kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    answer: Option<String>,
    /// Full response body of a failed call, when one was received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    raw_response: Option<String>,
}

impl Outcome {
    pub fn success(task_id: u64, status_code: u16, elapsed: Duration, answer: Option<String>) -> Self {
        Self {
            task_id,
            status_code: Some(status_code),
            elapsed,
            success: true,
            error_kind: ErrorKind::None,
            error_detail: None,
            answer,
            raw_response: None,
        }
    }

    pub fn transport(task_id: u64, elapsed: Duration, detail: impl Into<String>) -> Self {
        Self::failed(task_id, ErrorKind::Transport, None, elapsed, detail.into())
    }

    pub fn status(task_id: u64, status_code: u16, elapsed: Duration, detail: impl Into<String>) -> Self {
        Self::failed(task_id, ErrorKind::Status, Some(status_code), elapsed, detail.into())
    }

    pub fn decode(task_id: u64, status_code: u16, elapsed: Duration, detail: impl Into<String>) -> Self {
        Self::failed(task_id, ErrorKind::Decode, Some(status_code), elapsed, detail.into())
    }

    pub fn upstream(task_id: u64, status_code: u16, elapsed: Duration, detail: impl Into<String>) -> Self {
        Self::failed(
            task_id,
            ErrorKind::UpstreamSemantic,
            Some(status_code),
            elapsed,
            detail.into(),
        )
    }

    fn failed(
        task_id: u64,
        error_kind: ErrorKind,
        status_code: Option<u16>,
        elapsed: Duration,
        detail: String,
    ) -> Self {
        Self {
            task_id,
            status_code,
            elapsed,
            success: false,
            error_kind,
            error_detail: (!detail.is_empty()).then_some(detail),
            answer: None,
            raw_response: None,
        }
    }

    /// Attach the untruncated response body. Ignored on successes.
    pub fn with_raw_response(mut self, body: impl Into<String>) -> Self {
        if !self.success {
            self.raw_response = Some(body.into());
        }
        self
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn error_kind(&self) -> ErrorKind {
        self.error_kind
    }

    pub fn error_detail(&self) -> Option<&str> {
        self.error_detail.as_deref()
    }

    pub fn answer(&self) -> Option<&str> {
        self.answer.as_deref()
    }

    pub fn raw_response(&self) -> Option<&str> {
        self.raw_response.as_deref()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
