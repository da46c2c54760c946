use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::frame::FRAME_HEADER_LEN;

/// Index is a 16-bit field, so a body can span at most this many frames.
pub const MAX_FRAMES_PER_BODY: u64 = 65_536;

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_BODY_SIZE: u64 = 68_718_297_088;
const DEFAULT_MAX_PACKET_SIZE: usize = 1_048_576;

/// Immutable capability descriptor, served as JSON from the metadata
/// endpoint and shared read-only across every session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMeta {
    /// Protocol versions this server negotiates.
    pub versions: Vec<u16>,
    /// Milliseconds a declared request body may take to arrive in full.
    pub request_timeout: u64,
    /// Upper bound in bytes for request and response bodies.
    pub max_body_size: u64,
    /// Upper bound in bytes for a single binary frame, header included.
    pub max_packet_size: usize,
    /// Contact for reporting problems with this deployment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintainer: Option<Maintainer>,
    /// Identity of the implementation behind this server.
    pub project: ProjectInfo,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Maintainer {
    pub email: String,
    pub website: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

impl ProjectInfo {
    /// Identity of this crate, for servers that don't override it.
    pub fn this_crate() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: Some(env!("CARGO_PKG_DESCRIPTION").to_string())
                .filter(|d| !d.is_empty()),
            repository: Some(env!("CARGO_PKG_REPOSITORY").to_string()).filter(|r| !r.is_empty()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MetaError {
    #[error("max packet size {0} cannot hold the {FRAME_HEADER_LEN}-byte frame header")]
    PacketSizeTooSmall(usize),
    #[error("at least one protocol version must be supported")]
    NoVersions,
}

impl ProtocolMeta {
    /// Build a descriptor, enforcing that a frame can carry at least one
    /// payload byte.
    pub fn new(
        versions: Vec<u16>,
        request_timeout: Duration,
        max_body_size: u64,
        max_packet_size: usize,
        maintainer: Option<Maintainer>,
        project: ProjectInfo,
    ) -> Result<Self, MetaError> {
        if max_packet_size <= FRAME_HEADER_LEN {
            return Err(MetaError::PacketSizeTooSmall(max_packet_size));
        }
        if versions.is_empty() {
            return Err(MetaError::NoVersions);
        }
        Ok(Self {
            versions,
            request_timeout: request_timeout.as_millis() as u64,
            max_body_size,
            max_packet_size,
            maintainer,
            project,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout)
    }

    /// Payload bytes a single frame can carry.
    pub fn usable_frame_payload(&self) -> usize {
        self.max_packet_size - FRAME_HEADER_LEN
    }

    /// Largest body this server accepts: the configured cap, or the most a
    /// 16-bit frame index can address, whichever is smaller.
    pub fn effective_body_cap(&self) -> u64 {
        let representable = MAX_FRAMES_PER_BODY * self.usable_frame_payload() as u64;
        self.max_body_size.min(representable)
    }
}

impl Default for ProtocolMeta {
    fn default() -> Self {
        Self {
            versions: vec![1],
            request_timeout: DEFAULT_REQUEST_TIMEOUT_MS,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            maintainer: None,
            project: ProjectInfo::this_crate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_wire_contract() {
        let meta = ProtocolMeta::default();
        assert_eq!(meta.versions, vec![1]);
        assert_eq!(meta.request_timeout(), Duration::from_secs(30));
        assert_eq!(meta.max_body_size, 68_718_297_088);
        assert_eq!(meta.max_packet_size, 1_048_576);
        assert_eq!(meta.usable_frame_payload(), 1_048_558);
    }

    #[test]
    fn serializes_camel_case() {
        let meta = ProtocolMeta::default();
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["requestTimeout"], 30_000);
        assert_eq!(json["maxBodySize"], 68_718_297_088u64);
        assert_eq!(json["maxPacketSize"], 1_048_576);
        assert!(json.get("maintainer").is_none());
        assert!(json["project"]["name"].is_string());
    }

    #[test]
    fn rejects_packet_size_below_header() {
        let err = ProtocolMeta::new(
            vec![1],
            Duration::from_secs(30),
            1024,
            18,
            None,
            ProjectInfo::this_crate(),
        )
        .unwrap_err();
        assert_eq!(err, MetaError::PacketSizeTooSmall(18));
    }

    #[test]
    fn rejects_empty_version_list() {
        let err = ProtocolMeta::new(
            vec![],
            Duration::from_secs(30),
            1024,
            64,
            None,
            ProjectInfo::this_crate(),
        )
        .unwrap_err();
        assert_eq!(err, MetaError::NoVersions);
    }

    #[test]
    fn effective_cap_takes_smaller_bound() {
        // Tiny packets: the 16-bit index runs out before the configured cap.
        let meta = ProtocolMeta {
            max_body_size: u64::MAX,
            max_packet_size: 20,
            ..ProtocolMeta::default()
        };
        assert_eq!(meta.effective_body_cap(), 65_536 * 2);

        // Generous packets: the configured cap binds first.
        let meta = ProtocolMeta {
            max_body_size: 1_000,
            ..ProtocolMeta::default()
        };
        assert_eq!(meta.effective_body_cap(), 1_000);
    }
}
