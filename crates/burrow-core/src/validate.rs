use std::collections::HashMap;

use http::{HeaderName, HeaderValue, Method};
use serde_json::Value;
use url::Url;

use crate::error::ErrorCode;
use crate::ids::RequestId;
use crate::meta::ProtocolMeta;

/// Methods a tunneled request may carry, matched case-sensitively.
pub const ALLOWED_METHODS: [&str; 9] = [
    "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH",
];

/// A request that passed every validation rule.
#[derive(Clone, Debug)]
pub struct TunnelRequest {
    pub id: RequestId,
    pub method: Method,
    pub url: Url,
    pub headers: HashMap<String, String>,
    /// Declared byte length of the binary-framed body to follow, if any.
    pub body: Option<u64>,
}

/// Why a raw control message was refused, and the correlation id to address
/// the error to when one could be extracted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    pub code: ErrorCode,
    pub id: Option<RequestId>,
}

impl Rejection {
    fn new(code: ErrorCode, id: Option<RequestId>) -> Self {
        Self { code, id }
    }
}

/// Check raw control-channel text against the protocol rules, in fixed
/// order; the first failing rule names the error. Pure: sending the
/// resulting error message is the session's job.
pub fn validate_request(raw: &str, meta: &ProtocolMeta) -> Result<TunnelRequest, Rejection> {
    // 1. Shape: a JSON object whose `body`, if present, is a non-negative
    //    integer. No id is available at this point.
    let value: Value = serde_json::from_str(raw)
        .map_err(|_| Rejection::new(ErrorCode::InvalidFormat, None))?;
    let object = value
        .as_object()
        .ok_or_else(|| Rejection::new(ErrorCode::InvalidFormat, None))?;
    let body = match object.get("body") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            v.as_u64()
                .ok_or_else(|| Rejection::new(ErrorCode::InvalidFormat, None))?,
        ),
    };

    // 2. Correlation id: exactly 32 lowercase hex characters.
    let id = object
        .get("id")
        .and_then(Value::as_str)
        .and_then(|s| RequestId::parse(s).ok())
        .ok_or_else(|| Rejection::new(ErrorCode::InvalidId, None))?;

    // 3. Only server-bound requests are accepted on this side.
    match object.get("type").and_then(Value::as_str) {
        Some("request") => {}
        _ => return Err(Rejection::new(ErrorCode::InvalidType, Some(id))),
    }

    // 4. Absolute URL.
    let url = object
        .get("url")
        .and_then(Value::as_str)
        .and_then(|s| Url::parse(s).ok())
        .ok_or_else(|| Rejection::new(ErrorCode::InvalidUrl, Some(id)))?;

    // 5. Known HTTP method.
    let method = object
        .get("method")
        .and_then(Value::as_str)
        .filter(|m| ALLOWED_METHODS.contains(m))
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or_else(|| Rejection::new(ErrorCode::InvalidMethod, Some(id)))?;

    // 6. Headers: string-valued object forming legal HTTP names and values.
    //    A missing headers field means "no headers".
    let headers = match object.get("headers") {
        None | Some(Value::Null) => HashMap::new(),
        Some(v) => parse_headers(v).ok_or_else(|| {
            Rejection::new(ErrorCode::InvalidHeaders, Some(id))
        })?,
    };

    // 7. Declared body length within the server's cap.
    if let Some(declared) = body {
        if declared > meta.effective_body_cap() {
            return Err(Rejection::new(ErrorCode::BodyTooLarge, Some(id)));
        }
    }

    Ok(TunnelRequest {
        id,
        method,
        url,
        headers,
        body,
    })
}

fn parse_headers(value: &Value) -> Option<HashMap<String, String>> {
    let object = value.as_object()?;
    let mut headers = HashMap::with_capacity(object.len());
    for (name, val) in object {
        let val = val.as_str()?;
        HeaderName::from_bytes(name.as_bytes()).ok()?;
        HeaderValue::from_str(val).ok()?;
        headers.insert(name.clone(), val.to_string());
    }
    Some(headers)
}
