//! Value model and binary codec for the PackStream wire format.
//!
//! PackStream is the self-describing serialization carried by the Bolt
//! graph-database protocol: a closed set of primitive, container and domain
//! values, each encoded as a marker byte plus payload, with the narrowest
//! legal form always chosen. Type support depends on the negotiated
//! protocol version, so every encode/decode entry point takes a
//! [`version::ProtocolVersion`].

/// Marker bytes shared by the encoder and the decoder
mod marker;

/// The closed set of wire values and their host-type conversions
pub mod value;

/// Serialization of values into wire bytes
pub mod encode;

/// Cursor-based parsing of wire bytes into values
pub mod decode;

/// Negotiated protocol versions and their capability table
pub mod version;

pub use value::{PairMap, Value};
pub use version::ProtocolVersion;
