//! Version negotiation, run once per connection before any framed traffic.
//!
//! The client opens with a four-byte magic preamble followed by four
//! big-endian `u32` version proposals, preferred first and zero-padded. The
//! server answers with a single word: the selected version, or zero when no
//! common version exists. The exchange is raw bytes; chunked framing only
//! starts afterwards.

use byteorder::{ByteOrder, NetworkEndian};
use itertools::Itertools;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use fulmen_codec::ProtocolVersion;

/// Magic preamble opening every connection
pub const MAGIC: [u8; 4] = [0x60, 0x60, 0xB0, 0x17];

/// Number of version words in a proposal
pub const PROPOSAL_SLOTS: usize = 4;

#[derive(Debug, Error)]
pub enum Error {
    #[error("attempted to propose versions twice")]
    InvalidOutbound,

    #[error("attempted to receive confirmation before proposing")]
    InvalidInbound,

    #[error("no common protocol version with the server")]
    VersionMismatch,

    #[error("server selected version 0x{0:08X} which was not offered")]
    InvalidConfirmation(u32),

    #[error("bearer I/O error")]
    BearerIo(#[source] tokio::io::Error),
}

/// Up to four versions, preferred first, padded with zeros on the wire
#[derive(Debug, Clone)]
pub struct VersionOffer(Vec<ProtocolVersion>);

impl VersionOffer {
    pub fn new(preferred: impl IntoIterator<Item = ProtocolVersion>) -> Self {
        let versions = preferred
            .into_iter()
            .unique()
            .take(PROPOSAL_SLOTS)
            .collect();

        Self(versions)
    }

    pub fn contains(&self, version: ProtocolVersion) -> bool {
        self.0.contains(&version)
    }

    /// The 16-byte proposal block sent after the magic preamble
    pub fn wire_bytes(&self) -> [u8; PROPOSAL_SLOTS * 4] {
        let mut out = [0u8; PROPOSAL_SLOTS * 4];

        for (slot, version) in self.0.iter().enumerate() {
            NetworkEndian::write_u32(&mut out[slot * 4..][..4], version.to_handshake());
        }

        out
    }
}

impl Default for VersionOffer {
    fn default() -> Self {
        Self::new(ProtocolVersion::ALL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Propose,
    Confirm,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Accepted(ProtocolVersion),
    Rejected,
}

/// Client half of the negotiation
pub struct Client {
    state: State,
    offer: VersionOffer,
}

impl Client {
    pub fn new(offer: VersionOffer) -> Self {
        Self {
            state: State::Propose,
            offer,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    pub async fn send_propose<S>(&mut self, stream: &mut S) -> Result<(), Error>
    where
        S: AsyncWrite + Unpin,
    {
        if self.state != State::Propose {
            return Err(Error::InvalidOutbound);
        }

        stream.write_all(&MAGIC).await.map_err(Error::BearerIo)?;
        stream
            .write_all(&self.offer.wire_bytes())
            .await
            .map_err(Error::BearerIo)?;
        stream.flush().await.map_err(Error::BearerIo)?;

        self.state = State::Confirm;

        debug!(offer = ?self.offer, "versions proposed");

        Ok(())
    }

    pub async fn recv_confirm<S>(&mut self, stream: &mut S) -> Result<Confirmation, Error>
    where
        S: AsyncRead + Unpin,
    {
        if self.state != State::Confirm {
            return Err(Error::InvalidInbound);
        }

        let mut word = [0u8; 4];
        stream.read_exact(&mut word).await.map_err(Error::BearerIo)?;

        self.state = State::Done;

        let selected = NetworkEndian::read_u32(&word);

        if selected == 0 {
            debug!("no common version with server");
            return Ok(Confirmation::Rejected);
        }

        let version = ProtocolVersion::from_handshake(selected)
            .filter(|x| self.offer.contains(*x))
            .ok_or(Error::InvalidConfirmation(selected))?;

        debug!(%version, "version confirmed");

        Ok(Confirmation::Accepted(version))
    }

    /// Runs the full negotiation, erroring when the server rejects the offer
    pub async fn handshake<S>(&mut self, stream: &mut S) -> Result<ProtocolVersion, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.send_propose(stream).await?;

        match self.recv_confirm(stream).await? {
            Confirmation::Accepted(version) => Ok(version),
            Confirmation::Rejected => Err(Error::VersionMismatch),
        }
    }
}
