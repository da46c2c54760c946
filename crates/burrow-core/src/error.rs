use serde::{Deserialize, Serialize};

/// Application-level error taxonomy shared by the control channel and the
/// plain HTTP endpoints. Every code carries a stable machine key (the field
/// of the offending message) and a human-readable message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MethodNotAllowed,
    NotFound,
    InvalidFormat,
    InvalidType,
    InvalidId,
    InvalidUrl,
    InvalidMethod,
    InvalidHeaders,
    BodyTooLarge,
    BodyTimeout,
    RequestNotFound,
    MissingPacket,
    FetchFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            Self::NotFound => "NOT_FOUND",
            Self::InvalidFormat => "INVALID_FORMAT",
            Self::InvalidType => "INVALID_TYPE",
            Self::InvalidId => "INVALID_ID",
            Self::InvalidUrl => "INVALID_URL",
            Self::InvalidMethod => "INVALID_METHOD",
            Self::InvalidHeaders => "INVALID_HEADERS",
            Self::BodyTooLarge => "BODY_TOO_LARGE",
            Self::BodyTimeout => "BODY_TIMEOUT",
            Self::RequestNotFound => "REQUEST_NOT_FOUND",
            Self::MissingPacket => "MISSING_PACKET",
            Self::FetchFailed => "FETCH_FAILED",
        }
    }

    /// Taxonomy key: which part of the offending request the code refers to.
    /// Deliberately a distinct field from the correlation id on the wire.
    pub fn key(&self) -> &'static str {
        match self {
            Self::MethodNotAllowed => "request.method",
            Self::NotFound => "request.url",
            Self::InvalidFormat => "message.data",
            Self::InvalidType => "message.data.type",
            Self::InvalidId => "message.data.id",
            Self::InvalidUrl => "message.data.url",
            Self::InvalidMethod => "message.data.method",
            Self::InvalidHeaders => "message.data.headers",
            Self::BodyTooLarge => "message.data.body",
            Self::BodyTimeout => "message.data.body",
            Self::RequestNotFound => "message.data.id",
            Self::MissingPacket => "message.data.body",
            Self::FetchFailed => "request.url",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::NotFound => "Not Found",
            Self::InvalidFormat => "Message provided an invalid format",
            Self::InvalidType => "Request provided an invalid type",
            Self::InvalidId => "Request provided an invalid id",
            Self::InvalidUrl => "Request provided an invalid URL",
            Self::InvalidMethod => "Request provided an invalid method",
            Self::InvalidHeaders => "Request provided an invalid headers object",
            Self::BodyTooLarge => "Request provided a body that was too large",
            Self::BodyTimeout => "Timed out waiting for the request body",
            Self::RequestNotFound => "No pending request matches the provided id",
            Self::MissingPacket => "Request body is missing one or more packets",
            Self::FetchFailed => "Fetching the requested resource failed",
        }
    }

    /// Body shape used by the plain HTTP endpoints (405/404 responses).
    pub fn http_body(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.as_str(),
            "key": self.key(),
            "message": self.message(),
        })
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
