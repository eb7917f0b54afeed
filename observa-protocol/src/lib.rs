//! observa-protocol: wire definitions for the observatory line protocol
//!
//! Peers exchange newline terminated, positionally interpreted lines. The
//! first token is a single-letter tag or a command word; command returns
//! start with a signed status code.

pub mod codec;
pub mod messages;
pub mod params;
pub mod status;

// Re-export main types at crate root
pub use codec::{CodecError, Frame, FrameCodec};
pub use messages::{command_end, is_command_return, parse_command_return, Message};
pub use params::{ParamError, ParamResult, Params};
pub use status::{DeviceType, ServerState, StatusWord};
