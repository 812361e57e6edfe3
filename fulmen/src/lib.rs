//! Rust-native building blocks for the Bolt graph-database protocol
//!
//! Fulmen is a small collection of crates implementing the client-side core
//! of the Bolt wire protocol: the PackStream value codec and the framed,
//! version-negotiated session stack. This crate doesn't provide any
//! particular application; it is meant as a base layer for higher-level
//! use-cases such as drivers, pools and object mappers.

#[doc(inline)]
pub use fulmen_codec as codec;

#[doc(inline)]
pub use fulmen_network as network;
