//! Protocol version dispatch.
//!
//! A single version is negotiated during the connection handshake and never
//! changes afterwards. Encoders and decoders take the version as a parameter
//! and reject values that the negotiated version cannot carry.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    /// Baseline protocol: INIT auth, RUN/PULL/DISCARD, ACK_FAILURE recovery
    V1,
    /// Adds the temporal and spatial value types
    V2,
    /// HELLO auth, explicit transactions, GOODBYE; drops ACK_FAILURE
    V3,
}

impl ProtocolVersion {
    pub const LATEST: Self = ProtocolVersion::V3;

    /// Versions in preference order, newest first
    pub const ALL: [Self; 3] = [
        ProtocolVersion::V3,
        ProtocolVersion::V2,
        ProtocolVersion::V1,
    ];

    /// Maps a handshake word to a version, if the value is one we speak
    pub fn from_handshake(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(ProtocolVersion::V1),
            2 => Some(ProtocolVersion::V2),
            3 => Some(ProtocolVersion::V3),
            _ => None,
        }
    }

    pub fn to_handshake(self) -> u32 {
        match self {
            ProtocolVersion::V1 => 1,
            ProtocolVersion::V2 => 2,
            ProtocolVersion::V3 => 3,
        }
    }

    /// Temporal and spatial values exist from version 2 onwards
    pub fn supports_temporal(self) -> bool {
        self >= ProtocolVersion::V2
    }

    /// Explicit transactions (BEGIN/COMMIT/ROLLBACK) exist from version 3
    pub fn supports_transactions(self) -> bool {
        self >= ProtocolVersion::V3
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.to_handshake())
    }
}
