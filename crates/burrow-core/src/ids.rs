use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Correlation id linking a request, its response, its errors, and its data
/// frames. 16 raw bytes on the data channel, 32 lowercase hex characters on
/// the control channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId([u8; 16]);

/// Rejected textual id. The canonical form is exactly `^[0-9a-f]{32}$`;
/// uppercase hex is not accepted.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid request id: expected 32 lowercase hex characters")]
pub struct ParseRequestIdError;

impl RequestId {
    pub const LEN: usize = 16;

    /// Parse the canonical 32-character lowercase hex form.
    pub fn parse(s: &str) -> Result<Self, ParseRequestIdError> {
        let bytes = s.as_bytes();
        if bytes.len() != 2 * Self::LEN {
            return Err(ParseRequestIdError);
        }
        let mut out = [0u8; Self::LEN];
        for (i, pair) in bytes.chunks_exact(2).enumerate() {
            out[i] = (nibble(pair[0])? << 4) | nibble(pair[1])?;
        }
        Ok(Self(out))
    }

    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    /// Random id, for clients generating fresh correlation ids.
    pub fn random() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

fn nibble(c: u8) -> Result<u8, ParseRequestIdError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        _ => Err(ParseRequestIdError),
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({self})")
    }
}

impl FromStr for RequestId {
    type Err = ParseRequestIdError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
