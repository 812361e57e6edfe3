//! High-level entry points composing a bearer, the handshake and a session.

use thiserror::Error;
use tokio::net::ToSocketAddrs;
use tracing::debug;

#[cfg(unix)]
use std::path::Path;

use fulmen_codec::value::{PairMap, Value};
use fulmen_codec::ProtocolVersion;

use crate::framing::Bearer;
use crate::handshake::VersionOffer;
use crate::message::{Auth, TxMetadata};
use crate::session::{self, RunHandle, Session, SessionConfig};

#[derive(Debug, Error)]
pub enum Error {
    #[error("error connecting bearer")]
    ConnectFailure(#[source] tokio::io::Error),

    #[error(transparent)]
    Session(#[from] session::Error),
}

/// Client of a Bolt graph database: one authenticated session over one
/// TCP (or Unix socket) bearer.
pub struct BoltClient {
    session: Session<Bearer>,
    server_agent: Option<String>,
}

impl BoltClient {
    /// Dials, negotiates the newest common version and authenticates
    pub async fn connect(addr: impl ToSocketAddrs, auth: Auth) -> Result<Self, Error> {
        Self::connect_with(addr, auth, SessionConfig::default(), VersionOffer::default()).await
    }

    pub async fn connect_with(
        addr: impl ToSocketAddrs,
        auth: Auth,
        config: SessionConfig,
        offer: VersionOffer,
    ) -> Result<Self, Error> {
        let bearer = Bearer::connect_tcp(addr)
            .await
            .map_err(Error::ConnectFailure)?;

        Self::start(bearer, auth, config, offer).await
    }

    #[cfg(unix)]
    pub async fn connect_unix(path: impl AsRef<Path>, auth: Auth) -> Result<Self, Error> {
        let bearer = Bearer::connect_unix(path)
            .await
            .map_err(Error::ConnectFailure)?;

        Self::start(bearer, auth, SessionConfig::default(), VersionOffer::default()).await
    }

    async fn start(
        bearer: Bearer,
        auth: Auth,
        config: SessionConfig,
        offer: VersionOffer,
    ) -> Result<Self, Error> {
        let mut session = Session::handshake(bearer, offer, config).await?;

        let metadata = session.auth(&auth).await?;

        let server_agent = metadata
            .get("server")
            .and_then(Value::as_str)
            .map(str::to_string);

        debug!(server = server_agent.as_deref(), "bolt client connected");

        Ok(Self {
            session,
            server_agent,
        })
    }

    pub fn version(&self) -> ProtocolVersion {
        self.session.version()
    }

    /// Product and version string reported by the server, when present
    pub fn server_agent(&self) -> Option<&str> {
        self.server_agent.as_deref()
    }

    /// The underlying session, for pipelined or lower-level use
    pub fn session(&mut self) -> &mut Session<Bearer> {
        &mut self.session
    }

    pub async fn run(
        &mut self,
        statement: impl Into<String>,
        parameters: PairMap,
    ) -> Result<RunHandle, Error> {
        Ok(self.session.run(statement, parameters, None).await?)
    }

    pub async fn pull_all(&mut self) -> Result<(Vec<Vec<Value>>, PairMap), Error> {
        Ok(self.session.pull_all().await?)
    }

    pub async fn discard_all(&mut self) -> Result<PairMap, Error> {
        Ok(self.session.discard_all().await?)
    }

    pub async fn begin(&mut self, metadata: TxMetadata) -> Result<(), Error> {
        Ok(self.session.begin(metadata).await?)
    }

    pub async fn commit(&mut self) -> Result<Option<String>, Error> {
        Ok(self.session.commit().await?)
    }

    pub async fn rollback(&mut self) -> Result<(), Error> {
        Ok(self.session.rollback().await?)
    }

    pub async fn reset(&mut self) -> Result<(), Error> {
        Ok(self.session.reset().await?)
    }

    pub async fn close(self) -> Result<(), Error> {
        Ok(self.session.close().await?)
    }
}
