pub mod error;
pub mod frame;
pub mod ids;
pub mod message;
pub mod meta;
pub mod validate;

pub use error::ErrorCode;
pub use frame::{decode, encode, Frame, FrameError, FRAME_HEADER_LEN};
pub use ids::RequestId;
pub use message::ControlMessage;
pub use meta::{Maintainer, MetaError, ProjectInfo, ProtocolMeta};
pub use validate::{validate_request, Rejection, TunnelRequest};
