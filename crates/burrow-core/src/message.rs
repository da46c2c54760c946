use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::ids::RequestId;

/// Control-channel message: a JSON object tagged by its `type` field.
///
/// `Request` travels client-to-server, `Response` and `Error` travel
/// server-to-client. A `body` field, where present, is the declared byte
/// length of a binary-framed payload that follows on the data channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Request {
        id: RequestId,
        method: String,
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<u64>,
    },
    Response {
        id: RequestId,
        /// Final URL after redirects, which may differ from the request URL.
        url: String,
        status: u16,
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<u64>,
    },
    Error {
        /// Omitted when the offending request could not be identified.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<RequestId>,
        code: ErrorCode,
        key: String,
        message: String,
    },
}

impl ControlMessage {
    /// Error message with the taxonomy's canonical key and message text.
    pub fn error(code: ErrorCode, id: Option<RequestId>) -> Self {
        Self::Error {
            id,
            code,
            key: code.key().to_string(),
            message: code.message().to_string(),
        }
    }

    /// Error message with a more specific message text.
    pub fn error_with_message(
        code: ErrorCode,
        id: Option<RequestId>,
        message: impl Into<String>,
    ) -> Self {
        Self::Error {
            id,
            code,
            key: code.key().to_string(),
            message: message.into(),
        }
    }
}
