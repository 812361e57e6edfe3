//! Client-side stack for the Bolt graph-database wire protocol

pub mod facades;
pub mod framing;
pub mod handshake;
pub mod message;
pub mod session;

pub use fulmen_codec::ProtocolVersion;
