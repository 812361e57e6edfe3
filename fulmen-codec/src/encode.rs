//! PackStream encoder.
//!
//! Every value encodes as a marker byte followed by an optional size field
//! and payload. The encoder always picks the narrowest wire form that can
//! represent a value: the integer tiny form covers `-16..=127` (asymmetric
//! on purpose), and string/list/map size fields grow from the embedded
//! nibble through u8, u16 and u32.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::marker;
use crate::value::{signature, Struct, Value};
use crate::version::ProtocolVersion;

#[derive(Debug, Error)]
pub enum Error {
    #[error("collection of {0} items does not fit any wire size form")]
    OversizedCollection(usize),

    #[error("struct with {0} fields exceeds the 65535 field limit")]
    OversizedStruct(usize),

    #[error("{kind} values require protocol version 2 or above, negotiated {version}")]
    UnsupportedValue {
        kind: &'static str,
        version: ProtocolVersion,
    },

    #[error("{0} values are produced by the server and cannot be encoded")]
    ServerOnly(&'static str),
}

/// Serializes values into a growable buffer.
///
/// The negotiated protocol version is fixed at construction; values the
/// version cannot carry are rejected. A failed encode may leave a partial
/// value in the buffer, so callers discard the encoder on error.
pub struct Encoder {
    buf: BytesMut,
    version: ProtocolVersion,
}

impl Encoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self::with_capacity(version, 256)
    }

    pub fn with_capacity(version: ProtocolVersion, capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            version,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn encode(&mut self, value: &Value) -> Result<(), Error> {
        match value {
            Value::Null => self.buf.put_u8(marker::NULL),
            Value::Bool(true) => self.buf.put_u8(marker::TRUE),
            Value::Bool(false) => self.buf.put_u8(marker::FALSE),
            Value::Int(x) => self.integer(*x),
            Value::Float(x) => {
                self.buf.put_u8(marker::FLOAT);
                self.buf.put_f64(*x);
            }
            Value::String(x) => self.string(x)?,
            Value::List(items) => {
                self.size_header(
                    items.len(),
                    marker::TINY_LIST,
                    marker::LIST_8,
                    marker::LIST_16,
                    marker::LIST_32,
                )?;

                for item in items {
                    self.encode(item)?;
                }
            }
            Value::Map(pairs) => {
                self.size_header(
                    pairs.len(),
                    marker::TINY_MAP,
                    marker::MAP_8,
                    marker::MAP_16,
                    marker::MAP_32,
                )?;

                for (key, item) in pairs.iter() {
                    self.string(key)?;
                    self.encode(item)?;
                }
            }
            Value::Struct(x) => self.structure(x)?,
            Value::Node(_) => return Err(Error::ServerOnly("node")),
            Value::Relationship(_) => return Err(Error::ServerOnly("relationship")),
            Value::UnboundRelationship(_) => {
                return Err(Error::ServerOnly("unbound relationship"))
            }
            Value::Path(_) => return Err(Error::ServerOnly("path")),
            Value::Date(x) => {
                self.assert_version_2("date")?;
                self.struct_header(1, signature::DATE)?;
                self.integer(x.days);
            }
            Value::LocalTime(x) => {
                self.assert_version_2("local time")?;
                self.struct_header(1, signature::LOCAL_TIME)?;
                self.integer(x.nanos_of_day);
            }
            Value::LocalDateTime(x) => {
                self.assert_version_2("local datetime")?;
                self.struct_header(2, signature::LOCAL_DATE_TIME)?;
                self.integer(x.seconds);
                self.integer(x.nanos);
            }
            Value::Time(x) => {
                self.assert_version_2("time")?;
                self.struct_header(2, signature::TIME)?;
                self.integer(x.nanos_of_day);
                self.integer(x.offset_seconds);
            }
            Value::DateTime(x) => {
                self.assert_version_2("datetime")?;
                self.struct_header(3, signature::DATE_TIME)?;
                self.integer(x.seconds);
                self.integer(x.nanos);
                self.integer(x.offset_seconds);
            }
            Value::DateTimeZoned(x) => {
                self.assert_version_2("zoned datetime")?;
                self.struct_header(3, signature::DATE_TIME_ZONE_ID)?;
                self.integer(x.seconds);
                self.integer(x.nanos);
                self.string(&x.zone_id)?;
            }
            Value::Duration(x) => {
                self.assert_version_2("duration")?;
                self.struct_header(4, signature::DURATION)?;
                self.integer(x.months);
                self.integer(x.days);
                self.integer(x.seconds);
                self.integer(x.nanos);
            }
            Value::Point2D(x) => {
                self.assert_version_2("2d point")?;
                self.struct_header(3, signature::POINT_2D)?;
                self.integer(x.srid);
                self.float(x.x);
                self.float(x.y);
            }
            Value::Point3D(x) => {
                self.assert_version_2("3d point")?;
                self.struct_header(4, signature::POINT_3D)?;
                self.integer(x.srid);
                self.float(x.x);
                self.float(x.y);
                self.float(x.z);
            }
        }

        Ok(())
    }

    /// Writes a generic struct: header, signature byte, then each field
    pub fn structure(&mut self, x: &Struct) -> Result<(), Error> {
        self.struct_header(x.fields.len(), x.signature)?;

        for field in &x.fields {
            self.encode(field)?;
        }

        Ok(())
    }

    fn integer(&mut self, value: i64) {
        if (-16..=127).contains(&value) {
            self.buf.put_i8(value as i8);
        } else if let Ok(x) = i8::try_from(value) {
            self.buf.put_u8(marker::INT_8);
            self.buf.put_i8(x);
        } else if let Ok(x) = i16::try_from(value) {
            self.buf.put_u8(marker::INT_16);
            self.buf.put_i16(x);
        } else if let Ok(x) = i32::try_from(value) {
            self.buf.put_u8(marker::INT_32);
            self.buf.put_i32(x);
        } else {
            self.buf.put_u8(marker::INT_64);
            self.buf.put_i64(value);
        }
    }

    fn float(&mut self, value: f64) {
        self.buf.put_u8(marker::FLOAT);
        self.buf.put_f64(value);
    }

    fn string(&mut self, value: &str) -> Result<(), Error> {
        self.size_header(
            value.len(),
            marker::TINY_STRING,
            marker::STRING_8,
            marker::STRING_16,
            marker::STRING_32,
        )?;

        self.buf.put_slice(value.as_bytes());

        Ok(())
    }

    fn size_header(
        &mut self,
        len: usize,
        tiny: u8,
        m8: u8,
        m16: u8,
        m32: u8,
    ) -> Result<(), Error> {
        if len <= 0xF {
            self.buf.put_u8(tiny | len as u8);
        } else if len <= u8::MAX as usize {
            self.buf.put_u8(m8);
            self.buf.put_u8(len as u8);
        } else if len <= u16::MAX as usize {
            self.buf.put_u8(m16);
            self.buf.put_u16(len as u16);
        } else if len <= u32::MAX as usize {
            self.buf.put_u8(m32);
            self.buf.put_u32(len as u32);
        } else {
            return Err(Error::OversizedCollection(len));
        }

        Ok(())
    }

    fn struct_header(&mut self, len: usize, signature: u8) -> Result<(), Error> {
        if len <= 0xF {
            self.buf.put_u8(marker::TINY_STRUCT | len as u8);
        } else if len <= u8::MAX as usize {
            self.buf.put_u8(marker::STRUCT_8);
            self.buf.put_u8(len as u8);
        } else if len <= u16::MAX as usize {
            self.buf.put_u8(marker::STRUCT_16);
            self.buf.put_u16(len as u16);
        } else {
            return Err(Error::OversizedStruct(len));
        }

        self.buf.put_u8(signature);

        Ok(())
    }

    fn assert_version_2(&self, kind: &'static str) -> Result<(), Error> {
        if !self.version.supports_temporal() {
            return Err(Error::UnsupportedValue {
                kind,
                version: self.version,
            });
        }

        Ok(())
    }
}

/// Serializes a single value with the rules of the given version
pub fn to_bytes(value: &Value, version: ProtocolVersion) -> Result<Bytes, Error> {
    let mut encoder = Encoder::new(version);
    encoder.encode(value)?;

    Ok(encoder.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Date, Duration, Node, PairMap};

    fn encoded(value: &Value) -> Vec<u8> {
        to_bytes(value, ProtocolVersion::V3).unwrap().to_vec()
    }

    #[test]
    fn integers_pick_the_narrowest_form() {
        assert_eq!(encoded(&Value::Int(0)), vec![0x00]);
        assert_eq!(encoded(&Value::Int(127)), vec![0x7F]);
        assert_eq!(encoded(&Value::Int(-16)), vec![0xF0]);
        assert_eq!(encoded(&Value::Int(-1)), vec![0xFF]);
        assert_eq!(encoded(&Value::Int(-17)), vec![0xC8, 0xEF]);
        assert_eq!(encoded(&Value::Int(128)), vec![0xC9, 0x00, 0x80]);
        assert_eq!(encoded(&Value::Int(-129)), vec![0xC9, 0xFF, 0x7F]);
        assert_eq!(encoded(&Value::Int(32_767)), vec![0xC9, 0x7F, 0xFF]);
        assert_eq!(
            encoded(&Value::Int(32_768)),
            vec![0xCA, 0x00, 0x00, 0x80, 0x00]
        );
        assert_eq!(
            encoded(&Value::Int(2_147_483_647)),
            vec![0xCA, 0x7F, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(
            encoded(&Value::Int(i64::MAX)),
            vec![0xCB, 0x7F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn primitive_markers() {
        assert_eq!(encoded(&Value::Null), vec![0xC0]);
        assert_eq!(encoded(&Value::Bool(false)), vec![0xC2]);
        assert_eq!(encoded(&Value::Bool(true)), vec![0xC3]);
        assert_eq!(
            encoded(&Value::Float(1.1)),
            vec![0xC1, 0x3F, 0xF1, 0x99, 0x99, 0x99, 0x99, 0x99, 0x9A]
        );
    }

    #[test]
    fn string_size_forms() {
        assert_eq!(encoded(&Value::from("")), vec![0x80]);

        let fifteen = "a".repeat(15);
        assert_eq!(encoded(&Value::from(fifteen.as_str()))[0], 0x8F);

        let sixteen = "a".repeat(16);
        let bytes = encoded(&Value::from(sixteen.as_str()));
        assert_eq!(&bytes[..2], &[0xD0, 0x10]);

        let wide = "a".repeat(256);
        let bytes = encoded(&Value::from(wide.as_str()));
        assert_eq!(&bytes[..3], &[0xD1, 0x01, 0x00]);
    }

    #[test]
    fn map_entries_encode_in_insertion_order() {
        let mut map = PairMap::new();
        map.insert("b", 1i64);
        map.insert("a", 2i64);

        assert_eq!(
            encoded(&Value::Map(map)),
            vec![0xA2, 0x81, b'b', 0x01, 0x81, b'a', 0x02]
        );
    }

    #[test]
    fn duration_struct_layout() {
        let duration = Duration {
            months: 13,
            days: 11,
            seconds: 46_941,
            nanos: 554,
        };

        assert_eq!(
            encoded(&Value::Duration(duration)),
            vec![0xB4, 0x45, 0x0D, 0x0B, 0xCA, 0x00, 0x00, 0xB7, 0x5D, 0xC9, 0x02, 0x2A]
        );
    }

    #[test]
    fn temporal_values_rejected_below_version_2() {
        let date = Value::Date(Date { days: 18_000 });

        assert!(to_bytes(&date, ProtocolVersion::V2).is_ok());
        assert!(matches!(
            to_bytes(&date, ProtocolVersion::V1),
            Err(Error::UnsupportedValue { .. })
        ));
    }

    #[test]
    fn graph_values_are_server_only() {
        let node = Value::Node(Node {
            id: 1,
            labels: vec![],
            properties: PairMap::new(),
        });

        assert!(matches!(
            to_bytes(&node, ProtocolVersion::V3),
            Err(Error::ServerOnly(_))
        ));
    }
}
