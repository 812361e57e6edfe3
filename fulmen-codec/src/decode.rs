//! PackStream decoder.
//!
//! A [`Decoder`] borrows the input buffer and reads one value per call,
//! tracking its position so that callers can pull several values out of the
//! same cursor (protocol messages are a signature byte followed by a run of
//! fields). Struct payloads recurse on the same cursor; graph, temporal and
//! spatial structs are assembled into their typed variants by signature.

use byteorder::{ByteOrder, NetworkEndian};
use thiserror::Error;

use crate::marker;
use crate::value::{
    signature, Date, DateTime, DateTimeZoned, Duration, LocalDateTime, LocalTime, Node, PairMap,
    Path, Point2D, Point3D, Relationship, Time, UnboundRelationship, Value,
};
use crate::version::ProtocolVersion;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown marker byte 0x{0:02X}")]
    UnknownMarker(u8),

    #[error("unexpected end of input, needed {needed} more bytes")]
    UnexpectedEnd { needed: usize },

    #[error("struct signature 0x{signature:02X} is not known under protocol {version}")]
    UnknownStructSignature {
        signature: u8,
        version: ProtocolVersion,
    },

    #[error("map key is not a string")]
    InvalidMapKey,

    #[error("string payload is not valid utf-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("struct 0x{signature:02X} carries {actual} fields, expected {expected}")]
    StructArity {
        signature: u8,
        expected: usize,
        actual: usize,
    },

    #[error("struct 0x{signature:02X} field `{field}` has the wrong type")]
    StructField { signature: u8, field: &'static str },

    #[error("{0} bytes of trailing input after value")]
    TrailingBytes(usize),
}

/// Cursor over a borrowed byte buffer
pub struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
    version: ProtocolVersion,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8], version: ProtocolVersion) -> Self {
        Self {
            input,
            pos: 0,
            version,
        }
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos == self.input.len()
    }

    /// Reads the next value off the cursor
    pub fn decode(&mut self) -> Result<Value, Error> {
        let m = self.u8()?;

        match m {
            0x00..=0x7F => Ok(Value::Int(m as i64)),
            0xF0..=0xFF => Ok(Value::Int(m as i8 as i64)),
            marker::NULL => Ok(Value::Null),
            marker::TRUE => Ok(Value::Bool(true)),
            marker::FALSE => Ok(Value::Bool(false)),
            marker::FLOAT => {
                let raw = self.take(8)?;
                Ok(Value::Float(NetworkEndian::read_f64(raw)))
            }
            marker::INT_8 => Ok(Value::Int(self.u8()? as i8 as i64)),
            marker::INT_16 => {
                let raw = self.take(2)?;
                Ok(Value::Int(NetworkEndian::read_i16(raw) as i64))
            }
            marker::INT_32 => {
                let raw = self.take(4)?;
                Ok(Value::Int(NetworkEndian::read_i32(raw) as i64))
            }
            marker::INT_64 => {
                let raw = self.take(8)?;
                Ok(Value::Int(NetworkEndian::read_i64(raw)))
            }
            0x80..=0x8F => self.string((m & 0x0F) as usize),
            marker::STRING_8 => {
                let len = self.u8()? as usize;
                self.string(len)
            }
            marker::STRING_16 => {
                let len = self.u16()? as usize;
                self.string(len)
            }
            marker::STRING_32 => {
                let len = self.u32()? as usize;
                self.string(len)
            }
            0x90..=0x9F => self.list((m & 0x0F) as usize),
            marker::LIST_8 => {
                let len = self.u8()? as usize;
                self.list(len)
            }
            marker::LIST_16 => {
                let len = self.u16()? as usize;
                self.list(len)
            }
            marker::LIST_32 => {
                let len = self.u32()? as usize;
                self.list(len)
            }
            0xA0..=0xAF => self.map((m & 0x0F) as usize),
            marker::MAP_8 => {
                let len = self.u8()? as usize;
                self.map(len)
            }
            marker::MAP_16 => {
                let len = self.u16()? as usize;
                self.map(len)
            }
            marker::MAP_32 => {
                let len = self.u32()? as usize;
                self.map(len)
            }
            0xB0..=0xBF => {
                let len = (m & 0x0F) as usize;
                let signature = self.u8()?;
                self.domain_struct(signature, len)
            }
            marker::STRUCT_8 => {
                let len = self.u8()? as usize;
                let signature = self.u8()?;
                self.domain_struct(signature, len)
            }
            marker::STRUCT_16 => {
                let len = self.u16()? as usize;
                let signature = self.u8()?;
                self.domain_struct(signature, len)
            }
            other => Err(Error::UnknownMarker(other)),
        }
    }

    /// Reads a struct marker, returning the field count and signature byte
    /// and leaving the cursor at the first field. Used by the message layer
    /// to take the outer message struct apart before dispatching on its
    /// signature.
    pub fn struct_header(&mut self) -> Result<(usize, u8), Error> {
        let m = self.u8()?;

        let len = match m {
            0xB0..=0xBF => (m & 0x0F) as usize,
            marker::STRUCT_8 => self.u8()? as usize,
            marker::STRUCT_16 => self.u16()? as usize,
            other => return Err(Error::UnknownMarker(other)),
        };

        let signature = self.u8()?;

        Ok((len, signature))
    }

    fn u8(&mut self) -> Result<u8, Error> {
        let raw = self.take(1)?;
        Ok(raw[0])
    }

    fn u16(&mut self) -> Result<u16, Error> {
        let raw = self.take(2)?;
        Ok(NetworkEndian::read_u16(raw))
    }

    fn u32(&mut self) -> Result<u32, Error> {
        let raw = self.take(4)?;
        Ok(NetworkEndian::read_u32(raw))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.remaining() < len {
            return Err(Error::UnexpectedEnd {
                needed: len - self.remaining(),
            });
        }

        let raw = &self.input[self.pos..self.pos + len];
        self.pos += len;

        Ok(raw)
    }

    fn string(&mut self, len: usize) -> Result<Value, Error> {
        let raw = self.take(len)?;
        Ok(Value::String(String::from_utf8(raw.to_vec())?))
    }

    fn list(&mut self, len: usize) -> Result<Value, Error> {
        let mut items = Vec::with_capacity(len.min(64));

        for _ in 0..len {
            items.push(self.decode()?);
        }

        Ok(Value::List(items))
    }

    fn map(&mut self, len: usize) -> Result<Value, Error> {
        let mut pairs = Vec::with_capacity(len.min(64));

        for _ in 0..len {
            let key = match self.decode()? {
                Value::String(key) => key,
                _ => return Err(Error::InvalidMapKey),
            };

            pairs.push((key, self.decode()?));
        }

        Ok(Value::Map(PairMap::from(pairs)))
    }

    fn domain_struct(&mut self, signature: u8, len: usize) -> Result<Value, Error> {
        match signature {
            signature::NODE => {
                self.arity(signature, 3, len)?;

                Ok(Value::Node(Node {
                    id: self.int_field(signature, "id")?,
                    labels: self.string_list_field(signature, "labels")?,
                    properties: self.map_field(signature, "properties")?,
                }))
            }
            signature::RELATIONSHIP => {
                self.arity(signature, 5, len)?;

                Ok(Value::Relationship(Relationship {
                    id: self.int_field(signature, "id")?,
                    start: self.int_field(signature, "start")?,
                    end: self.int_field(signature, "end")?,
                    rel_type: self.string_field(signature, "type")?,
                    properties: self.map_field(signature, "properties")?,
                }))
            }
            signature::UNBOUND_RELATIONSHIP => {
                self.arity(signature, 3, len)?;

                Ok(Value::UnboundRelationship(UnboundRelationship {
                    id: self.int_field(signature, "id")?,
                    rel_type: self.string_field(signature, "type")?,
                    properties: self.map_field(signature, "properties")?,
                }))
            }
            signature::PATH => {
                self.arity(signature, 3, len)?;

                let nodes = match self.decode()? {
                    Value::List(items) => items
                        .into_iter()
                        .map(|item| match item {
                            Value::Node(x) => Ok(x),
                            _ => Err(Error::StructField {
                                signature,
                                field: "nodes",
                            }),
                        })
                        .collect::<Result<_, _>>()?,
                    _ => {
                        return Err(Error::StructField {
                            signature,
                            field: "nodes",
                        })
                    }
                };

                let relationships = match self.decode()? {
                    Value::List(items) => items
                        .into_iter()
                        .map(|item| match item {
                            Value::UnboundRelationship(x) => Ok(x),
                            _ => Err(Error::StructField {
                                signature,
                                field: "relationships",
                            }),
                        })
                        .collect::<Result<_, _>>()?,
                    _ => {
                        return Err(Error::StructField {
                            signature,
                            field: "relationships",
                        })
                    }
                };

                let sequence = self.int_list_field(signature, "sequence")?;

                Ok(Value::Path(Path {
                    nodes,
                    relationships,
                    sequence,
                }))
            }
            signature::DATE if self.version.supports_temporal() => {
                self.arity(signature, 1, len)?;

                Ok(Value::Date(Date {
                    days: self.int_field(signature, "days")?,
                }))
            }
            signature::LOCAL_TIME if self.version.supports_temporal() => {
                self.arity(signature, 1, len)?;

                Ok(Value::LocalTime(LocalTime {
                    nanos_of_day: self.int_field(signature, "nanos_of_day")?,
                }))
            }
            signature::LOCAL_DATE_TIME if self.version.supports_temporal() => {
                self.arity(signature, 2, len)?;

                Ok(Value::LocalDateTime(LocalDateTime {
                    seconds: self.int_field(signature, "seconds")?,
                    nanos: self.int_field(signature, "nanos")?,
                }))
            }
            signature::TIME if self.version.supports_temporal() => {
                self.arity(signature, 2, len)?;

                Ok(Value::Time(Time {
                    nanos_of_day: self.int_field(signature, "nanos_of_day")?,
                    offset_seconds: self.int_field(signature, "offset_seconds")?,
                }))
            }
            signature::DATE_TIME if self.version.supports_temporal() => {
                self.arity(signature, 3, len)?;

                Ok(Value::DateTime(DateTime {
                    seconds: self.int_field(signature, "seconds")?,
                    nanos: self.int_field(signature, "nanos")?,
                    offset_seconds: self.int_field(signature, "offset_seconds")?,
                }))
            }
            signature::DATE_TIME_ZONE_ID if self.version.supports_temporal() => {
                self.arity(signature, 3, len)?;

                Ok(Value::DateTimeZoned(DateTimeZoned {
                    seconds: self.int_field(signature, "seconds")?,
                    nanos: self.int_field(signature, "nanos")?,
                    zone_id: self.string_field(signature, "zone_id")?,
                }))
            }
            signature::DURATION if self.version.supports_temporal() => {
                self.arity(signature, 4, len)?;

                Ok(Value::Duration(Duration {
                    months: self.int_field(signature, "months")?,
                    days: self.int_field(signature, "days")?,
                    seconds: self.int_field(signature, "seconds")?,
                    nanos: self.int_field(signature, "nanos")?,
                }))
            }
            signature::POINT_2D if self.version.supports_temporal() => {
                self.arity(signature, 3, len)?;

                Ok(Value::Point2D(Point2D {
                    srid: self.int_field(signature, "srid")?,
                    x: self.float_field(signature, "x")?,
                    y: self.float_field(signature, "y")?,
                }))
            }
            signature::POINT_3D if self.version.supports_temporal() => {
                self.arity(signature, 4, len)?;

                Ok(Value::Point3D(Point3D {
                    srid: self.int_field(signature, "srid")?,
                    x: self.float_field(signature, "x")?,
                    y: self.float_field(signature, "y")?,
                    z: self.float_field(signature, "z")?,
                }))
            }
            other => Err(Error::UnknownStructSignature {
                signature: other,
                version: self.version,
            }),
        }
    }

    fn arity(&self, signature: u8, expected: usize, actual: usize) -> Result<(), Error> {
        if expected != actual {
            return Err(Error::StructArity {
                signature,
                expected,
                actual,
            });
        }

        Ok(())
    }

    fn int_field(&mut self, signature: u8, field: &'static str) -> Result<i64, Error> {
        match self.decode()? {
            Value::Int(x) => Ok(x),
            _ => Err(Error::StructField { signature, field }),
        }
    }

    fn float_field(&mut self, signature: u8, field: &'static str) -> Result<f64, Error> {
        match self.decode()? {
            Value::Float(x) => Ok(x),
            _ => Err(Error::StructField { signature, field }),
        }
    }

    fn string_field(&mut self, signature: u8, field: &'static str) -> Result<String, Error> {
        match self.decode()? {
            Value::String(x) => Ok(x),
            _ => Err(Error::StructField { signature, field }),
        }
    }

    fn map_field(&mut self, signature: u8, field: &'static str) -> Result<PairMap, Error> {
        match self.decode()? {
            Value::Map(x) => Ok(x),
            _ => Err(Error::StructField { signature, field }),
        }
    }

    fn string_list_field(
        &mut self,
        signature: u8,
        field: &'static str,
    ) -> Result<Vec<String>, Error> {
        match self.decode()? {
            Value::List(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(x) => Ok(x),
                    _ => Err(Error::StructField { signature, field }),
                })
                .collect(),
            _ => Err(Error::StructField { signature, field }),
        }
    }

    fn int_list_field(&mut self, signature: u8, field: &'static str) -> Result<Vec<i64>, Error> {
        match self.decode()? {
            Value::List(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Int(x) => Ok(x),
                    _ => Err(Error::StructField { signature, field }),
                })
                .collect(),
            _ => Err(Error::StructField { signature, field }),
        }
    }
}

/// Parses a buffer holding exactly one value
pub fn from_bytes(input: &[u8], version: ProtocolVersion) -> Result<Value, Error> {
    let mut decoder = Decoder::new(input, version);
    let value = decoder.decode()?;

    if !decoder.is_exhausted() {
        return Err(Error::TrailingBytes(decoder.remaining()));
    }

    Ok(value)
}
