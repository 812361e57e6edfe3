//! Typed protocol messages and their codec.
//!
//! Every message is a PackStream struct whose signature byte names the
//! message and whose fields are the message arguments. Requests flow client
//! to server; responses flow back. Both directions encode and decode so the
//! crate can drive either end of a connection.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fulmen_codec::decode::Decoder;
use fulmen_codec::encode::Encoder;
use fulmen_codec::value::{PairMap, Struct, Value};
use fulmen_codec::{decode, encode, ProtocolVersion};

/// Message signatures
pub mod signature {
    /// INIT on v1/v2, HELLO on v3; same byte for both
    pub const INIT: u8 = 0x01;
    pub const GOODBYE: u8 = 0x02;
    pub const ACK_FAILURE: u8 = 0x0E;
    pub const RESET: u8 = 0x0F;
    pub const RUN: u8 = 0x10;
    pub const BEGIN: u8 = 0x11;
    pub const COMMIT: u8 = 0x12;
    pub const ROLLBACK: u8 = 0x13;
    pub const DISCARD_ALL: u8 = 0x2F;
    pub const PULL_ALL: u8 = 0x3F;

    pub const SUCCESS: u8 = 0x70;
    pub const RECORD: u8 = 0x71;
    pub const IGNORED: u8 = 0x7E;
    pub const FAILURE: u8 = 0x7F;
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot encode message field")]
    Encode(#[from] encode::Error),

    #[error("cannot decode message field")]
    Decode(#[from] decode::Error),

    #[error("{name} requests are not available under protocol {version}")]
    UnsupportedRequest {
        name: &'static str,
        version: ProtocolVersion,
    },

    #[error("statement metadata requires protocol version 3, negotiated {0}")]
    MetadataUnsupported(ProtocolVersion),

    #[error("unknown message signature 0x{0:02X}")]
    UnknownSignature(u8),

    #[error("message 0x{signature:02X} carries {actual} fields, expected {expected}")]
    MessageArity {
        signature: u8,
        expected: usize,
        actual: usize,
    },

    #[error("message 0x{signature:02X} field `{field}` has the wrong type")]
    MessageField { signature: u8, field: &'static str },

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

/// Credentials presented during INIT/HELLO
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    None,
    Basic {
        principal: String,
        credentials: String,
    },
}

impl Auth {
    pub fn basic(principal: impl Into<String>, credentials: impl Into<String>) -> Self {
        Auth::Basic {
            principal: principal.into(),
            credentials: credentials.into(),
        }
    }

    /// The token map carried by INIT and HELLO
    fn token(&self, user_agent: &str) -> PairMap {
        let mut map = PairMap::new();

        if let Auth::Basic {
            principal,
            credentials,
        } = self
        {
            map.insert("scheme", "basic");
            map.insert("principal", principal.as_str());
            map.insert("credentials", credentials.as_str());
        }

        map.insert("user_agent", user_agent);

        map
    }

    fn from_token(map: &PairMap) -> Self {
        match map.get("scheme").and_then(Value::as_str) {
            Some("basic") => Auth::Basic {
                principal: map
                    .get("principal")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                credentials: map
                    .get("credentials")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            _ => Auth::None,
        }
    }
}

/// Requested access pattern for a statement or transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// Extra metadata carried by v3 RUN and BEGIN messages.
///
/// Empty entries are omitted from the wire map. The server enforces
/// `tx_timeout`; the client only transports it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TxMetadata {
    pub bookmarks: Vec<String>,
    pub tx_timeout_ms: Option<i64>,
    pub tx_metadata: Option<PairMap>,
    pub mode: Option<AccessMode>,
}

impl TxMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bookmarks(mut self, bookmarks: Vec<String>) -> Self {
        self.bookmarks = bookmarks;
        self
    }

    pub fn with_timeout_ms(mut self, millis: i64) -> Self {
        self.tx_timeout_ms = Some(millis);
        self
    }

    pub fn with_metadata(mut self, metadata: PairMap) -> Self {
        self.tx_metadata = Some(metadata);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.mode = Some(AccessMode::Read);
        self
    }

    pub fn to_map(&self) -> PairMap {
        let mut map = PairMap::new();

        if !self.bookmarks.is_empty() {
            map.insert("bookmarks", Value::from(self.bookmarks.clone()));
        }

        if let Some(millis) = self.tx_timeout_ms {
            map.insert("tx_timeout", millis);
        }

        if let Some(metadata) = &self.tx_metadata {
            map.insert("tx_metadata", metadata.clone());
        }

        if let Some(AccessMode::Read) = self.mode {
            map.insert("mode", "r");
        }

        map
    }
}

/// A client request
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// v1/v2 authentication opener
    Init { user_agent: String, auth: Auth },
    /// v3 authentication opener; all arguments travel in one map
    Hello { user_agent: String, auth: Auth },
    Run {
        statement: String,
        parameters: PairMap,
        metadata: Option<TxMetadata>,
    },
    DiscardAll,
    PullAll,
    AckFailure,
    Reset,
    Begin { metadata: TxMetadata },
    Commit,
    Rollback,
    Goodbye,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Init { .. } => "INIT",
            Request::Hello { .. } => "HELLO",
            Request::Run { .. } => "RUN",
            Request::DiscardAll => "DISCARD_ALL",
            Request::PullAll => "PULL_ALL",
            Request::AckFailure => "ACK_FAILURE",
            Request::Reset => "RESET",
            Request::Begin { .. } => "BEGIN",
            Request::Commit => "COMMIT",
            Request::Rollback => "ROLLBACK",
            Request::Goodbye => "GOODBYE",
        }
    }

    pub fn signature(&self) -> u8 {
        match self {
            Request::Init { .. } | Request::Hello { .. } => signature::INIT,
            Request::Run { .. } => signature::RUN,
            Request::DiscardAll => signature::DISCARD_ALL,
            Request::PullAll => signature::PULL_ALL,
            Request::AckFailure => signature::ACK_FAILURE,
            Request::Reset => signature::RESET,
            Request::Begin { .. } => signature::BEGIN,
            Request::Commit => signature::COMMIT,
            Request::Rollback => signature::ROLLBACK,
            Request::Goodbye => signature::GOODBYE,
        }
    }

    /// Whether the negotiated version admits this request at all
    pub fn permitted(&self, version: ProtocolVersion) -> bool {
        match self {
            Request::Init { .. } | Request::AckFailure => !version.supports_transactions(),
            Request::Hello { .. }
            | Request::Begin { .. }
            | Request::Commit
            | Request::Rollback
            | Request::Goodbye => version.supports_transactions(),
            Request::Run { .. } | Request::DiscardAll | Request::PullAll | Request::Reset => true,
        }
    }

    pub fn to_bytes(&self, version: ProtocolVersion) -> Result<Bytes, Error> {
        if !self.permitted(version) {
            return Err(Error::UnsupportedRequest {
                name: self.name(),
                version,
            });
        }

        let fields = match self {
            Request::Init { user_agent, auth } => vec![
                Value::from(user_agent.as_str()),
                Value::Map(auth.token(user_agent)),
            ],
            Request::Hello { user_agent, auth } => vec![Value::Map(auth.token(user_agent))],
            Request::Run {
                statement,
                parameters,
                metadata,
            } => {
                let mut fields = vec![
                    Value::from(statement.as_str()),
                    Value::Map(parameters.clone()),
                ];

                if version.supports_transactions() {
                    let metadata = metadata.clone().unwrap_or_default();
                    fields.push(Value::Map(metadata.to_map()));
                } else if metadata.is_some() {
                    return Err(Error::MetadataUnsupported(version));
                }

                fields
            }
            Request::Begin { metadata } => vec![Value::Map(metadata.to_map())],
            Request::DiscardAll
            | Request::PullAll
            | Request::AckFailure
            | Request::Reset
            | Request::Commit
            | Request::Rollback
            | Request::Goodbye => vec![],
        };

        let mut encoder = Encoder::new(version);
        encoder.structure(&Struct::new(self.signature(), fields))?;

        Ok(encoder.into_bytes())
    }

    pub fn from_bytes(input: &[u8], version: ProtocolVersion) -> Result<Self, Error> {
        let mut decoder = Decoder::new(input, version);
        let (len, signature) = decoder.struct_header()?;

        let request = match signature {
            signature::INIT if version.supports_transactions() => {
                arity(signature, 1, len)?;

                let token = map_field(&mut decoder, signature, "extra")?;
                let user_agent = token
                    .get("user_agent")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();

                Request::Hello {
                    user_agent,
                    auth: Auth::from_token(&token),
                }
            }
            signature::INIT => {
                arity(signature, 2, len)?;

                let user_agent = string_field(&mut decoder, signature, "user_agent")?;
                let token = map_field(&mut decoder, signature, "auth")?;

                Request::Init {
                    user_agent,
                    auth: Auth::from_token(&token),
                }
            }
            signature::RUN => {
                let expected = if version.supports_transactions() { 3 } else { 2 };
                arity(signature, expected, len)?;

                let statement = string_field(&mut decoder, signature, "statement")?;
                let parameters = map_field(&mut decoder, signature, "parameters")?;

                let metadata = if version.supports_transactions() {
                    let map = map_field(&mut decoder, signature, "metadata")?;
                    Some(metadata_from_map(&map))
                } else {
                    None
                };

                Request::Run {
                    statement,
                    parameters,
                    metadata,
                }
            }
            signature::BEGIN => {
                arity(signature, 1, len)?;
                let map = map_field(&mut decoder, signature, "metadata")?;

                Request::Begin {
                    metadata: metadata_from_map(&map),
                }
            }
            signature::DISCARD_ALL => bare(signature, len, Request::DiscardAll)?,
            signature::PULL_ALL => bare(signature, len, Request::PullAll)?,
            signature::ACK_FAILURE => bare(signature, len, Request::AckFailure)?,
            signature::RESET => bare(signature, len, Request::Reset)?,
            signature::COMMIT => bare(signature, len, Request::Commit)?,
            signature::ROLLBACK => bare(signature, len, Request::Rollback)?,
            signature::GOODBYE => bare(signature, len, Request::Goodbye)?,
            other => return Err(Error::UnknownSignature(other)),
        };

        exhausted(&decoder)?;

        Ok(request)
    }
}

/// A server response
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success(PairMap),
    Record(Vec<Value>),
    Ignored,
    Failure(ServerFailure),
}

impl Response {
    pub fn name(&self) -> &'static str {
        match self {
            Response::Success(_) => "SUCCESS",
            Response::Record(_) => "RECORD",
            Response::Ignored => "IGNORED",
            Response::Failure(_) => "FAILURE",
        }
    }

    pub fn to_bytes(&self, version: ProtocolVersion) -> Result<Bytes, Error> {
        let (signature, fields) = match self {
            Response::Success(metadata) => {
                (signature::SUCCESS, vec![Value::Map(metadata.clone())])
            }
            Response::Record(values) => (signature::RECORD, vec![Value::List(values.clone())]),
            Response::Ignored => (signature::IGNORED, vec![]),
            Response::Failure(failure) => {
                let mut map = PairMap::new();
                map.insert("code", failure.code.as_str());
                map.insert("message", failure.message.as_str());

                (signature::FAILURE, vec![Value::Map(map)])
            }
        };

        let mut encoder = Encoder::new(version);
        encoder.structure(&Struct::new(signature, fields))?;

        Ok(encoder.into_bytes())
    }

    pub fn from_bytes(input: &[u8], version: ProtocolVersion) -> Result<Self, Error> {
        let mut decoder = Decoder::new(input, version);
        let (len, signature) = decoder.struct_header()?;

        let response = match signature {
            signature::SUCCESS => {
                arity(signature, 1, len)?;
                Response::Success(map_field(&mut decoder, signature, "metadata")?)
            }
            signature::RECORD => {
                arity(signature, 1, len)?;

                match decoder.decode()? {
                    Value::List(values) => Response::Record(values),
                    _ => {
                        return Err(Error::MessageField {
                            signature,
                            field: "fields",
                        })
                    }
                }
            }
            signature::IGNORED => bare(signature, len, Response::Ignored)?,
            signature::FAILURE => {
                arity(signature, 1, len)?;
                let map = map_field(&mut decoder, signature, "metadata")?;

                Response::Failure(ServerFailure::from_metadata(&map))
            }
            other => return Err(Error::UnknownSignature(other)),
        };

        exhausted(&decoder)?;

        Ok(response)
    }
}

/// A FAILURE response: the statement or request failed server-side.
///
/// Recoverable; the session moves to its failed state until acknowledged
/// or reset.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ServerFailure {
    pub code: String,
    pub message: String,
}

impl ServerFailure {
    fn from_metadata(map: &PairMap) -> Self {
        Self {
            code: map
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            message: map
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }
    }
}

fn arity(signature: u8, expected: usize, actual: usize) -> Result<(), Error> {
    if expected != actual {
        return Err(Error::MessageArity {
            signature,
            expected,
            actual,
        });
    }

    Ok(())
}

fn bare<T>(signature: u8, len: usize, value: T) -> Result<T, Error> {
    arity(signature, 0, len)?;
    Ok(value)
}

fn exhausted(decoder: &Decoder<'_>) -> Result<(), Error> {
    if !decoder.is_exhausted() {
        return Err(Error::TrailingBytes(decoder.remaining()));
    }

    Ok(())
}

fn string_field(
    decoder: &mut Decoder<'_>,
    signature: u8,
    field: &'static str,
) -> Result<String, Error> {
    match decoder.decode()? {
        Value::String(x) => Ok(x),
        _ => Err(Error::MessageField { signature, field }),
    }
}

fn map_field(
    decoder: &mut Decoder<'_>,
    signature: u8,
    field: &'static str,
) -> Result<PairMap, Error> {
    match decoder.decode()? {
        Value::Map(x) => Ok(x),
        _ => Err(Error::MessageField { signature, field }),
    }
}

fn metadata_from_map(map: &PairMap) -> TxMetadata {
    let bookmarks = map
        .get("bookmarks")
        .and_then(Value::as_list)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    TxMetadata {
        bookmarks,
        tx_timeout_ms: map.get("tx_timeout").and_then(Value::as_int),
        tx_metadata: map.get("tx_metadata").and_then(Value::as_map).cloned(),
        mode: match map.get("mode").and_then(Value::as_str) {
            Some("r") => Some(AccessMode::Read),
            Some(_) => Some(AccessMode::Write),
            None => None,
        },
    }
}
