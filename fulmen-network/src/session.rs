//! The session state machine: one protocol conversation over one bearer.
//!
//! A session enforces legal message sequences, pairs pipelined responses
//! with their originating requests in FIFO order, tracks the transaction
//! lifecycle, and recovers from server failures via `ACK_FAILURE` (v1/v2)
//! or `RESET`. The bearer is exclusively owned; the machine is not
//! re-entrant and suspends only at bearer reads and writes.

use std::collections::VecDeque;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace, warn};

use fulmen_codec::value::{PairMap, Value};
use fulmen_codec::ProtocolVersion;

use crate::framing::{self, FrameBuffer};
use crate::handshake::{self, VersionOffer};
use crate::message::{self, Auth, Request, Response, ServerFailure, TxMetadata};

#[derive(Debug, Error)]
pub enum Error {
    #[error("handshake failed")]
    Handshake(#[source] handshake::Error),

    #[error("message codec failure")]
    Message(#[source] message::Error),

    #[error("error while sending or receiving data through the bearer")]
    Framing(#[source] framing::Error),

    #[error("{name} is not a legal request while the session is {state:?}")]
    InvalidOutbound { name: &'static str, state: State },

    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("server failure: {0}")]
    Server(ServerFailure),

    #[error("authentication rejected: {0}")]
    Auth(ServerFailure),

    #[error("request was ignored; acknowledge or reset the session first")]
    Ignored,

    #[error("session is defunct and must be discarded")]
    Defunct,
}

/// Observable session states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No negotiated connection yet
    Disconnected,
    /// Handshake done, not authenticated
    Connected,
    /// Authenticated and idle
    Ready,
    /// A statement holds an open result stream
    Streaming,
    /// Inside an explicit transaction, idle
    TxReady,
    /// Inside an explicit transaction with an open result stream
    TxStreaming,
    /// The server reported a failure that has not been acknowledged
    Failed,
    /// Outstanding work is being discarded
    Interrupted,
    /// Terminal; the owner must discard the session
    Defunct,
}

/// Outstanding requests awaiting a response, in submission order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Init,
    Run,
    Pull,
    Discard,
    AckFailure,
    Reset,
    Begin,
    Commit,
    Rollback,
}

fn pending_kind(request: &Request) -> Option<Pending> {
    match request {
        Request::Init { .. } | Request::Hello { .. } => Some(Pending::Init),
        Request::Run { .. } => Some(Pending::Run),
        Request::PullAll => Some(Pending::Pull),
        Request::DiscardAll => Some(Pending::Discard),
        Request::AckFailure => Some(Pending::AckFailure),
        Request::Reset => Some(Pending::Reset),
        Request::Begin { .. } => Some(Pending::Begin),
        Request::Commit => Some(Pending::Commit),
        Request::Rollback => Some(Pending::Rollback),
        Request::Goodbye => None,
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Client identification reported during INIT/HELLO
    pub user_agent: String,
    /// Deadline covering one whole message read
    pub read_timeout: Option<Duration>,
    /// Deadline covering one whole message write
    pub write_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("fulmen/", env!("CARGO_PKG_VERSION")).to_string(),
            read_timeout: None,
            write_timeout: None,
        }
    }
}

/// Field names and metadata confirmed by the server for a running statement
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub fields: Vec<String>,
    pub metadata: PairMap,
}

impl RunHandle {
    fn from_metadata(metadata: PairMap) -> Self {
        let fields = metadata
            .get("fields")
            .and_then(Value::as_list)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Self { fields, metadata }
    }
}

/// One protocol conversation bound to one bearer.
///
/// Requests may be pipelined: several `send` calls are legal before the
/// first `recv`. Send-time legality is checked against the state the
/// session will be in once every outstanding request has succeeded.
pub struct Session<S> {
    frames: FrameBuffer<S>,
    version: ProtocolVersion,
    config: SessionConfig,
    state: State,
    projected: State,
    pending: VecDeque<Pending>,
    bookmark: Option<String>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Negotiates a version on a fresh bearer and wraps it in a session
    pub async fn handshake(
        mut stream: S,
        offer: VersionOffer,
        config: SessionConfig,
    ) -> Result<Self, Error> {
        let mut client = handshake::Client::new(offer);

        // on failure the stream is dropped here, closing the transport
        let version = client
            .handshake(&mut stream)
            .await
            .map_err(Error::Handshake)?;

        Ok(Self::new(stream, version, config))
    }

    /// Wraps an already-negotiated bearer
    pub fn new(stream: S, version: ProtocolVersion, config: SessionConfig) -> Self {
        let mut frames = FrameBuffer::new(stream);
        frames.set_read_timeout(config.read_timeout);
        frames.set_write_timeout(config.write_timeout);

        Self {
            frames,
            version,
            config,
            state: State::Connected,
            projected: State::Connected,
            pending: VecDeque::new(),
            bookmark: None,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_defunct(&self) -> bool {
        self.state == State::Defunct
    }

    /// Number of requests awaiting a response
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// The most recent bookmark confirmed by the server, if any
    pub fn last_bookmark(&self) -> Option<&str> {
        self.bookmark.as_deref()
    }

    /// Writes one request without waiting for its response.
    ///
    /// Encode failures are local: the request never reaches the wire and
    /// the session stays healthy. Bearer failures are fatal.
    pub async fn send(&mut self, request: Request) -> Result<(), Error> {
        if self.state == State::Defunct {
            return Err(Error::Defunct);
        }

        self.assert_outbound(&request)?;

        let payload = request.to_bytes(self.version).map_err(Error::Message)?;

        trace!(msg = request.name(), len = payload.len(), "sending request");

        self.frames
            .write_message(&payload)
            .await
            .map_err(|e| self.fail_transport(e))?;

        match pending_kind(&request) {
            None => {
                // GOODBYE has no response; the conversation is over
                self.state = State::Defunct;
                self.projected = State::Defunct;
            }
            Some(Pending::Reset) => {
                self.pending.push_back(Pending::Reset);
                self.state = State::Interrupted;
                self.projected = State::Ready;
            }
            Some(kind) => {
                self.pending.push_back(kind);
                self.project(kind);
            }
        }

        Ok(())
    }

    /// Reads the next response and pairs it with the oldest outstanding
    /// request. Records for streams discarded by `RESET` are dropped
    /// internally and never surface.
    pub async fn recv(&mut self) -> Result<Response, Error> {
        loop {
            if self.state == State::Defunct {
                return Err(Error::Defunct);
            }

            let raw = self
                .frames
                .read_message()
                .await
                .map_err(|e| self.fail_transport(e))?;

            let response = match Response::from_bytes(&raw, self.version) {
                Ok(x) => x,
                Err(e) => {
                    // malformed bytes mean we lost track of the stream
                    self.state = State::Defunct;
                    self.projected = State::Defunct;
                    return Err(Error::Message(e));
                }
            };

            trace!(msg = response.name(), "response received");

            if self.state == State::Interrupted {
                match self.apply_interrupted(response)? {
                    Some(response) => return Ok(response),
                    None => continue,
                }
            }

            return self.apply(response);
        }
    }

    /// Authenticates with INIT or HELLO depending on the version
    pub async fn auth(&mut self, auth: &Auth) -> Result<PairMap, Error> {
        let user_agent = self.config.user_agent.clone();

        let request = if self.version.supports_transactions() {
            Request::Hello {
                user_agent,
                auth: auth.clone(),
            }
        } else {
            Request::Init {
                user_agent,
                auth: auth.clone(),
            }
        };

        self.send(request).await?;

        match self.recv().await? {
            Response::Success(metadata) => {
                debug!(version = %self.version, "session authenticated");
                Ok(metadata)
            }
            Response::Failure(failure) => Err(Error::Auth(failure)),
            _ => Err(self.fail_protocol("unexpected response to authentication")),
        }
    }

    /// Submits a statement and waits for the server to confirm it
    pub async fn run(
        &mut self,
        statement: impl Into<String>,
        parameters: PairMap,
        metadata: Option<TxMetadata>,
    ) -> Result<RunHandle, Error> {
        self.send(Request::Run {
            statement: statement.into(),
            parameters,
            metadata,
        })
        .await?;

        match self.recv().await? {
            Response::Success(metadata) => Ok(RunHandle::from_metadata(metadata)),
            Response::Failure(failure) => Err(Error::Server(failure)),
            Response::Ignored => Err(Error::Ignored),
            _ => Err(self.fail_protocol("unexpected response to RUN")),
        }
    }

    /// Pulls every record of the open stream, returning them with the
    /// closing summary metadata
    pub async fn pull_all(&mut self) -> Result<(Vec<Vec<Value>>, PairMap), Error> {
        self.send(Request::PullAll).await?;

        let mut records = Vec::new();

        loop {
            match self.recv().await? {
                Response::Record(values) => records.push(values),
                Response::Success(summary) => return Ok((records, summary)),
                Response::Failure(failure) => return Err(Error::Server(failure)),
                Response::Ignored => return Err(Error::Ignored),
            }
        }
    }

    /// Drops the open stream, returning the summary metadata
    pub async fn discard_all(&mut self) -> Result<PairMap, Error> {
        self.send(Request::DiscardAll).await?;

        match self.recv().await? {
            Response::Success(summary) => Ok(summary),
            Response::Failure(failure) => Err(Error::Server(failure)),
            Response::Ignored => Err(Error::Ignored),
            _ => Err(self.fail_protocol("unexpected response to DISCARD_ALL")),
        }
    }

    /// Opens an explicit transaction (v3). When the caller supplies no
    /// bookmarks, the most recent one seen on this session is included so
    /// that causally related work stays ordered.
    pub async fn begin(&mut self, metadata: TxMetadata) -> Result<(), Error> {
        let mut metadata = metadata;

        if metadata.bookmarks.is_empty() {
            if let Some(bookmark) = &self.bookmark {
                metadata.bookmarks = vec![bookmark.clone()];
            }
        }

        self.send(Request::Begin { metadata }).await?;
        self.expect_summary("BEGIN").await.map(|_| ())
    }

    /// Commits the open transaction, returning the server's bookmark
    pub async fn commit(&mut self) -> Result<Option<String>, Error> {
        self.send(Request::Commit).await?;

        let summary = self.expect_summary("COMMIT").await?;

        Ok(summary
            .get("bookmark")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// Rolls the open transaction back
    pub async fn rollback(&mut self) -> Result<(), Error> {
        self.send(Request::Rollback).await?;
        self.expect_summary("ROLLBACK").await.map(|_| ())
    }

    /// Clears a failure so the session can be used again (v1/v2 only)
    pub async fn ack_failure(&mut self) -> Result<(), Error> {
        self.send(Request::AckFailure).await?;
        self.expect_summary("ACK_FAILURE").await.map(|_| ())
    }

    /// Discards all outstanding work server-side. Always legal; every
    /// outstanding request resolves as ignored.
    pub async fn reset(&mut self) -> Result<(), Error> {
        self.send(Request::Reset).await?;

        loop {
            match self.recv().await? {
                Response::Ignored => continue,
                Response::Success(_) => return Ok(()),
                _ => return Err(self.fail_protocol("unexpected response to RESET")),
            }
        }
    }

    /// Ends the conversation, sending GOODBYE first on v3
    pub async fn close(mut self) -> Result<(), Error> {
        if self.version.supports_transactions() && self.state != State::Defunct {
            // best effort; the transport goes away either way
            if let Err(error) = self.send(Request::Goodbye).await {
                debug!(%error, "goodbye not delivered");
            }
        }

        Ok(())
    }

    async fn expect_summary(&mut self, name: &'static str) -> Result<PairMap, Error> {
        match self.recv().await? {
            Response::Success(summary) => Ok(summary),
            Response::Failure(failure) => Err(Error::Server(failure)),
            Response::Ignored => Err(Error::Ignored),
            _ => {
                warn!(msg = name, "stream response to a summary-only request");
                Err(self.fail_protocol("unexpected stream response"))
            }
        }
    }

    /// Send-time legality, judged against the projected state so that
    /// pipelined submissions are accepted
    fn assert_outbound(&self, request: &Request) -> Result<(), Error> {
        use State::*;

        let legal = match request {
            Request::Init { .. } | Request::Hello { .. } => matches!(self.projected, Connected),
            Request::Run { .. } => {
                matches!(self.projected, Ready | TxReady | Failed | Interrupted)
            }
            Request::PullAll | Request::DiscardAll => {
                matches!(self.projected, Streaming | TxStreaming | Failed | Interrupted)
            }
            Request::Begin { .. } => matches!(self.projected, Ready | Failed | Interrupted),
            Request::Commit | Request::Rollback => {
                matches!(self.projected, TxReady | Failed | Interrupted)
            }
            Request::AckFailure => matches!(self.projected, Failed | Interrupted),
            Request::Reset | Request::Goodbye => true,
        };

        if !legal {
            return Err(Error::InvalidOutbound {
                name: request.name(),
                state: self.projected,
            });
        }

        Ok(())
    }

    /// Advances the projected state as if the request will succeed.
    /// Requests submitted on a failed session will be ignored instead,
    /// which the projection tracks as interrupted.
    fn project(&mut self, pending: Pending) {
        use State::*;

        self.projected = match (self.projected, pending) {
            (Failed | Interrupted, Pending::AckFailure) => Ready,
            (Failed | Interrupted, _) => Interrupted,
            (Connected, Pending::Init) => Ready,
            (Ready, Pending::Run) => Streaming,
            (TxReady, Pending::Run) => TxStreaming,
            (Streaming, Pending::Pull | Pending::Discard) => Ready,
            (TxStreaming, Pending::Pull | Pending::Discard) => TxReady,
            (Ready, Pending::Begin) => TxReady,
            (TxReady, Pending::Commit | Pending::Rollback) => Ready,
            (current, _) => current,
        };
    }

    fn apply(&mut self, response: Response) -> Result<Response, Error> {
        let Some(&head) = self.pending.front() else {
            return Err(self.fail_protocol("response with no outstanding request"));
        };

        match response {
            Response::Record(values) => {
                if head != Pending::Pull
                    || !matches!(self.state, State::Streaming | State::TxStreaming)
                {
                    return Err(self.fail_protocol("record outside of an open stream"));
                }

                Ok(Response::Record(values))
            }
            Response::Success(metadata) => {
                self.pending.pop_front();
                self.note_bookmark(&metadata);
                self.transition_success(head)?;

                if self.pending.is_empty() {
                    self.projected = self.state;
                }

                Ok(Response::Success(metadata))
            }
            Response::Ignored => {
                self.pending.pop_front();

                match self.state {
                    State::Failed => self.state = State::Interrupted,
                    State::Interrupted => {}
                    _ => return Err(self.fail_protocol("ignored response on a healthy session")),
                }

                if self.pending.is_empty() {
                    self.projected = self.state;
                }

                Ok(Response::Ignored)
            }
            Response::Failure(failure) => {
                self.pending.pop_front();

                match head {
                    Pending::Init => {
                        warn!(code = %failure.code, "authentication failed");
                        self.state = State::Defunct;
                        self.projected = State::Defunct;
                    }
                    Pending::AckFailure | Pending::Reset => {
                        // recovery itself was refused; nothing more we can do
                        warn!(code = %failure.code, "failure recovery rejected");
                        self.state = State::Defunct;
                        self.projected = State::Defunct;
                    }
                    _ => {
                        self.state = State::Failed;
                        self.projected = if self.pending.is_empty() {
                            State::Failed
                        } else {
                            State::Interrupted
                        };
                    }
                }

                Ok(Response::Failure(failure))
            }
        }
    }

    /// While interrupted, everything queued ahead of the recovery request
    /// was discarded by the server: records are dropped, ignores resolve
    /// their originators, and the next SUCCESS answers the recovery itself.
    fn apply_interrupted(&mut self, response: Response) -> Result<Option<Response>, Error> {
        match response {
            Response::Record(_) => {
                trace!("dropping record from a discarded stream");
                Ok(None)
            }
            Response::Ignored => match self.pending.front() {
                Some(Pending::Reset | Pending::AckFailure) | None => {
                    Err(self.fail_protocol("recovery request ignored"))
                }
                Some(_) => {
                    self.pending.pop_front();
                    Ok(Some(Response::Ignored))
                }
            },
            Response::Success(metadata) => {
                while let Some(head) = self.pending.pop_front() {
                    if matches!(head, Pending::Reset | Pending::AckFailure) {
                        self.note_bookmark(&metadata);
                        self.state = State::Ready;

                        if self.pending.is_empty() {
                            self.projected = State::Ready;
                        }

                        return Ok(Some(Response::Success(metadata)));
                    }

                    trace!("request discarded before its response arrived");
                }

                Err(self.fail_protocol("success with no recovery request outstanding"))
            }
            Response::Failure(_) => Err(self.fail_protocol("failure while interrupted")),
        }
    }

    fn transition_success(&mut self, head: Pending) -> Result<(), Error> {
        use State::*;

        self.state = match (self.state, head) {
            (Connected, Pending::Init) => Ready,
            (Ready, Pending::Run) => Streaming,
            (TxReady, Pending::Run) => TxStreaming,
            (Streaming, Pending::Pull | Pending::Discard) => Ready,
            (TxStreaming, Pending::Pull | Pending::Discard) => TxReady,
            (Ready, Pending::Begin) => TxReady,
            (TxReady, Pending::Commit | Pending::Rollback) => Ready,
            (Failed, Pending::AckFailure) => Ready,
            (_, Pending::Reset) => Ready,
            _ => return Err(self.fail_protocol("success in an unexpected state")),
        };

        Ok(())
    }

    fn note_bookmark(&mut self, metadata: &PairMap) {
        if let Some(bookmark) = metadata.get("bookmark").and_then(Value::as_str) {
            self.bookmark = Some(bookmark.to_string());
        }
    }

    fn fail_transport(&mut self, error: framing::Error) -> Error {
        self.state = State::Defunct;
        self.projected = State::Defunct;

        Error::Framing(error)
    }

    fn fail_protocol(&mut self, what: &'static str) -> Error {
        warn!(what, "protocol violation, session is defunct");

        self.state = State::Defunct;
        self.projected = State::Defunct;

        Error::Protocol(what)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn connected(version: ProtocolVersion) -> (Session<DuplexStream>, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(1 << 16);
        (
            Session::new(ours, version, SessionConfig::default()),
            theirs,
        )
    }

    #[tokio::test]
    async fn requests_are_rejected_before_authentication() {
        let (mut session, _server) = connected(ProtocolVersion::V3);

        let result = session
            .run("RETURN 1", PairMap::new(), None)
            .await;

        assert!(matches!(
            result,
            Err(Error::InvalidOutbound {
                name: "RUN",
                state: State::Connected
            })
        ));
        assert_eq!(session.state(), State::Connected);
    }

    #[tokio::test]
    async fn pull_is_rejected_without_an_open_stream() {
        let (mut session, _server) = connected(ProtocolVersion::V3);
        session.state = State::Ready;
        session.projected = State::Ready;

        assert!(matches!(
            session.send(Request::PullAll).await,
            Err(Error::InvalidOutbound { name: "PULL_ALL", .. })
        ));
    }

    #[tokio::test]
    async fn pipelined_pull_is_accepted_after_run() {
        let (mut session, _server) = connected(ProtocolVersion::V3);
        session.state = State::Ready;
        session.projected = State::Ready;

        session
            .send(Request::Run {
                statement: "RETURN 1".to_string(),
                parameters: PairMap::new(),
                metadata: None,
            })
            .await
            .unwrap();

        session.send(Request::PullAll).await.unwrap();
        assert_eq!(session.outstanding(), 2);
    }

    #[tokio::test]
    async fn ack_failure_is_gated_to_pre_v3() {
        let (mut session, _server) = connected(ProtocolVersion::V3);
        session.state = State::Failed;
        session.projected = State::Failed;

        // legal for the state machine but rejected by the message codec
        assert!(matches!(
            session.send(Request::AckFailure).await,
            Err(Error::Message(message::Error::UnsupportedRequest { .. }))
        ));

        // the encode failure is local; the session is still usable
        assert_eq!(session.state(), State::Failed);
    }

    #[tokio::test]
    async fn reset_interrupts_immediately() {
        let (mut session, _server) = connected(ProtocolVersion::V3);
        session.state = State::Ready;
        session.projected = State::Ready;

        session.send(Request::Reset).await.unwrap();
        assert_eq!(session.state(), State::Interrupted);
    }

    #[tokio::test]
    async fn goodbye_makes_the_session_defunct() {
        let (mut session, _server) = connected(ProtocolVersion::V3);
        session.state = State::Ready;
        session.projected = State::Ready;

        session.send(Request::Goodbye).await.unwrap();
        assert!(session.is_defunct());

        assert!(matches!(
            session.send(Request::Reset).await,
            Err(Error::Defunct)
        ));
    }
}
