//! # Coordinator Wire Library
//!
//! Shared wire-level definitions used by the game coordinator, game-server
//! tooling and the test suites. It covers:
//!
//! - **Frame codec** (`codec`): the chunked envelope format carried over
//!   both the datagram and TCP transports, including segmentation of large
//!   payloads and per-peer reassembly.
//! - **Message catalogue** (`messages`): the 32-bit message-type constants
//!   and the serde payload structs serialized with `bincode`.
//! - **Identity helpers** (`steamid`): the textual steam-id renderings and
//!   the synthetic 64-bit id used as a persistence key for accounts only
//!   known by their 32-bit account id.
//! - **Rank table** (`rank`): the fixed score→rank step function.
//!
//! Everything here is deliberately free of I/O so that the server, tools
//! and tests agree on the bytes without pulling in a runtime.

pub mod codec;
pub mod messages;
pub mod rank;
pub mod steamid;

pub use codec::{
    CodecError, Frame, FrameAssembler, FRAME_HEADER_LEN, MAX_CHUNK_SIZE, PROTO_MASK,
};
pub use messages::MsgType;

/// Platform application id the coordinator answers for.
pub const STEAM_APP_ID: u32 = 730;

/// Channel number the client protocol rides on (platform socket).
pub const NET_MESSAGE_CHANNEL: u32 = 7;

/// Send flag requesting reliable delivery on the platform socket.
pub const NET_MESSAGE_SEND_FLAGS: u32 = 8;
