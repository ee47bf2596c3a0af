use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("unknown persona `{0}`")]
    UnknownPersona(String),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

/// Failure of a use case, classified by the layer that caused it.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("history store failure: {0}")]
    Persistence(String),
}

impl ApplicationError {
    /// Attaches the correlation id of the event being handled. The original
    /// message stays in the error for logs; chat users only ever see
    /// [`InterfaceError::user_message`].
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let kind = match &self {
            Self::Domain(_) => InterfaceErrorKind::BadRequest,
            Self::Persistence(_) => InterfaceErrorKind::ServiceUnavailable,
        };
        InterfaceError { kind, message: self.to_string(), correlation_id }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterfaceErrorKind {
    BadRequest,
    ServiceUnavailable,
    Internal,
}

impl InterfaceErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Internal => "internal",
        }
    }
}

/// An error on its way back to a chat user.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{} [{correlation_id}]: {message}", .kind.as_str())]
pub struct InterfaceError {
    pub kind: InterfaceErrorKind,
    pub message: String,
    pub correlation_id: String,
}

impl InterfaceError {
    pub fn new(
        kind: InterfaceErrorKind,
        message: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self { kind, message: message.into(), correlation_id: correlation_id.into() }
    }

    pub fn user_message(&self) -> &'static str {
        match self.kind {
            InterfaceErrorKind::BadRequest => "Yêu cầu không hợp lệ. Đại hiệp hãy kiểm tra lại.",
            InterfaceErrorKind::ServiceUnavailable => {
                "Hệ thống đang tạm gián đoạn. Xin hãy thử lại sau ít phút."
            }
            InterfaceErrorKind::Internal => "⚠️ Lỗi không xác định. Xin hãy thử lại sau.",
        }
    }
}
