//! Multiplexed TCP-over-WebSocket tunnel.
//!
//! Every accepted local connection becomes a stream on one WebSocket. Frames are
//! `[type u8][stream id u32 BE][payload]`, one frame per binary message. The remote opens
//! the target on `Open` and answers `Ack`; nothing is read from the local socket before
//! that. Client stream ids are even and start at 2.

pub mod listener;
pub mod multiplexer;
pub mod profile;
pub mod protocol;
pub mod session;
pub mod stream;
pub mod transport;
