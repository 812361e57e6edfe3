//! The closed set of values carried by the PackStream wire format.

use std::fmt;
use std::ops::Deref;

use chrono::{FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike};
use serde::{Deserialize, Serialize};

/// Signature bytes for the domain structs of the wire format
pub mod signature {
    pub const DATE: u8 = 0x44;
    pub const DURATION: u8 = 0x45;
    pub const DATE_TIME: u8 = 0x46;
    pub const TIME: u8 = 0x54;
    pub const POINT_2D: u8 = 0x58;
    pub const POINT_3D: u8 = 0x59;
    pub const LOCAL_DATE_TIME: u8 = 0x64;
    pub const DATE_TIME_ZONE_ID: u8 = 0x66;
    pub const LOCAL_TIME: u8 = 0x74;

    pub const NODE: u8 = 0x4E;
    pub const RELATIONSHIP: u8 = 0x52;
    pub const UNBOUND_RELATIONSHIP: u8 = 0x72;
    pub const PATH: u8 = 0x50;
}

/// Custom collection to ensure ordered pairs of values
///
/// Map entries keep their insertion order so that re-encoding a value yields
/// the same bytes. We use a Vec as the underlying storage (as opposed to a
/// BTreeMap or HashMap). Lookups scan from the back, so a duplicate key
/// resolves to its last occurrence.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(from = "Vec<(String, Value)>", into = "Vec<(String, Value)>")]
pub struct PairMap(Vec<(String, Value)>);

impl PairMap {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    /// Inserts a key/value pair, replacing the value in place when the key
    /// is already present.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();

        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value.into(),
            None => self.0.push((key, value.into())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn to_vec(self) -> Vec<(String, Value)> {
        self.0
    }
}

impl Deref for PairMap {
    type Target = [(String, Value)];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<(String, Value)>> for PairMap {
    fn from(pairs: Vec<(String, Value)>) -> Self {
        Self(pairs)
    }
}

impl From<PairMap> for Vec<(String, Value)> {
    fn from(map: PairMap) -> Self {
        map.0
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for PairMap {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// A generic tagged record; the building block for protocol messages
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Struct {
    pub signature: u8,
    pub fields: Vec<Value>,
}

impl Struct {
    pub fn new(signature: u8, fields: Vec<Value>) -> Self {
        Self { signature, fields }
    }
}

/// A node of the graph, as returned by the server
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Node {
    pub id: i64,
    pub labels: Vec<String>,
    pub properties: PairMap,
}

/// A relationship bound to its start and end nodes
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Relationship {
    pub id: i64,
    pub start: i64,
    pub end: i64,
    pub rel_type: String,
    pub properties: PairMap,
}

/// A relationship without endpoint information, used inside paths
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UnboundRelationship {
    pub id: i64,
    pub rel_type: String,
    pub properties: PairMap,
}

/// An alternating sequence of nodes and relationships
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Path {
    pub nodes: Vec<Node>,
    pub relationships: Vec<UnboundRelationship>,
    pub sequence: Vec<i64>,
}

/// Days since the epoch date 1970-01-01
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Date {
    pub days: i64,
}

impl Date {
    pub fn from_naive(date: NaiveDate) -> Self {
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
        Self {
            days: (date - epoch).num_days(),
        }
    }

    pub fn to_naive(self) -> Option<NaiveDate> {
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
        epoch.checked_add_signed(chrono::TimeDelta::try_days(self.days)?)
    }
}

/// Nanoseconds since midnight, with no zone information
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalTime {
    pub nanos_of_day: i64,
}

impl LocalTime {
    pub fn from_naive(time: NaiveTime) -> Self {
        let nanos_of_day =
            time.num_seconds_from_midnight() as i64 * 1_000_000_000 + time.nanosecond() as i64;

        Self { nanos_of_day }
    }

    pub fn to_naive(self) -> Option<NaiveTime> {
        let secs = u32::try_from(self.nanos_of_day.div_euclid(1_000_000_000)).ok()?;
        let nanos = u32::try_from(self.nanos_of_day.rem_euclid(1_000_000_000)).ok()?;

        NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
    }
}

/// Seconds since the epoch plus a nanosecond remainder in `[0, 1e9)`
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalDateTime {
    pub seconds: i64,
    pub nanos: i64,
}

impl LocalDateTime {
    /// Splits an epoch offset given in microseconds, flooring the division
    /// so that the nanosecond remainder stays non-negative.
    pub fn from_epoch_micros(micros: i64) -> Self {
        Self {
            seconds: micros.div_euclid(1_000_000),
            nanos: micros.rem_euclid(1_000_000) * 1_000,
        }
    }

    pub fn from_naive(datetime: NaiveDateTime) -> Self {
        let utc = datetime.and_utc();

        Self {
            seconds: utc.timestamp(),
            nanos: utc.timestamp_subsec_nanos() as i64,
        }
    }

    pub fn to_naive(self) -> Option<NaiveDateTime> {
        let nanos = u32::try_from(self.nanos).ok()?;
        chrono::DateTime::from_timestamp(self.seconds, nanos).map(|x| x.naive_utc())
    }
}

/// Nanoseconds since midnight in a zone given by its UTC offset
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Time {
    pub nanos_of_day: i64,
    pub offset_seconds: i64,
}

impl Time {
    pub fn from_naive(time: NaiveTime, offset: FixedOffset) -> Self {
        Self {
            nanos_of_day: LocalTime::from_naive(time).nanos_of_day,
            offset_seconds: offset.local_minus_utc() as i64,
        }
    }
}

/// An epoch instant in a zone given by its UTC offset
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct DateTime {
    pub seconds: i64,
    pub nanos: i64,
    pub offset_seconds: i64,
}

impl DateTime {
    pub fn from_chrono(datetime: &chrono::DateTime<FixedOffset>) -> Self {
        Self {
            seconds: datetime.timestamp(),
            nanos: datetime.timestamp_subsec_nanos() as i64,
            offset_seconds: datetime.offset().local_minus_utc() as i64,
        }
    }

    pub fn to_chrono(self) -> Option<chrono::DateTime<FixedOffset>> {
        let nanos = u32::try_from(self.nanos).ok()?;
        let offset = FixedOffset::east_opt(i32::try_from(self.offset_seconds).ok()?)?;
        let utc = chrono::DateTime::from_timestamp(self.seconds, nanos)?;

        Some(offset.from_utc_datetime(&utc.naive_utc()))
    }
}

/// An epoch instant in a zone given by its identifier (e.g. `Europe/Oslo`)
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DateTimeZoned {
    pub seconds: i64,
    pub nanos: i64,
    pub zone_id: String,
}

/// An amount of time split over four independent units.
///
/// Months, days, seconds and nanos are never normalized across units: a
/// month has no canonical second count.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Duration {
    pub months: i64,
    pub days: i64,
    pub seconds: i64,
    pub nanos: i64,
}

/// A point in a 2-dimensional coordinate reference system
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Point2D {
    pub srid: i64,
    pub x: f64,
    pub y: f64,
}

/// A point in a 3-dimensional coordinate reference system
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Point3D {
    pub srid: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// A value of the wire format.
///
/// Integers are always widened to 64 bits in memory; the encoder picks the
/// narrowest wire form. Graph variants are only ever produced by decoding
/// server payloads. Temporal and spatial variants require protocol version 2
/// or above.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(PairMap),
    Struct(Struct),
    Node(Node),
    Relationship(Relationship),
    UnboundRelationship(UnboundRelationship),
    Path(Path),
    Date(Date),
    LocalTime(LocalTime),
    LocalDateTime(LocalDateTime),
    Time(Time),
    DateTime(DateTime),
    DateTimeZoned(DateTimeZoned),
    Duration(Duration),
    Point2D(Point2D),
    Point3D(Point3D),
}

impl Value {
    /// A short label for the variant, used in error reporting
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Struct(_) => "struct",
            Value::Node(_) => "node",
            Value::Relationship(_) => "relationship",
            Value::UnboundRelationship(_) => "unbound relationship",
            Value::Path(_) => "path",
            Value::Date(_) => "date",
            Value::LocalTime(_) => "local time",
            Value::LocalDateTime(_) => "local datetime",
            Value::Time(_) => "time",
            Value::DateTime(_) => "datetime",
            Value::DateTimeZoned(_) => "zoned datetime",
            Value::Duration(_) => "duration",
            Value::Point2D(_) => "2d point",
            Value::Point3D(_) => "3d point",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(x) => Some(x),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(x) => Some(x),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&PairMap> {
        match self {
            Value::Map(x) => Some(x),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(x) => write!(f, "{x}"),
            Value::Int(x) => write!(f, "{x}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(x) => write!(f, "{x:?}"),
            other => write!(f, "<{}>", other.kind()),
        }
    }
}

impl From<bool> for Value {
    fn from(x: bool) -> Self {
        Value::Bool(x)
    }
}

impl From<i64> for Value {
    fn from(x: i64) -> Self {
        Value::Int(x)
    }
}

impl From<i32> for Value {
    fn from(x: i32) -> Self {
        Value::Int(x as i64)
    }
}

impl From<u32> for Value {
    fn from(x: u32) -> Self {
        Value::Int(x as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(x: &str) -> Self {
        Value::String(x.to_string())
    }
}

impl From<String> for Value {
    fn from(x: String) -> Self {
        Value::String(x)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(x: Vec<T>) -> Self {
        Value::List(x.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(x: Option<T>) -> Self {
        match x {
            Some(x) => x.into(),
            None => Value::Null,
        }
    }
}

impl From<PairMap> for Value {
    fn from(x: PairMap) -> Self {
        Value::Map(x)
    }
}

impl From<Struct> for Value {
    fn from(x: Struct) -> Self {
        Value::Struct(x)
    }
}

impl From<NaiveDate> for Value {
    fn from(x: NaiveDate) -> Self {
        Value::Date(Date::from_naive(x))
    }
}

impl From<NaiveTime> for Value {
    fn from(x: NaiveTime) -> Self {
        Value::LocalTime(LocalTime::from_naive(x))
    }
}

impl From<NaiveDateTime> for Value {
    fn from(x: NaiveDateTime) -> Self {
        Value::LocalDateTime(LocalDateTime::from_naive(x))
    }
}

impl From<chrono::DateTime<FixedOffset>> for Value {
    fn from(x: chrono::DateTime<FixedOffset>) -> Self {
        Value::DateTime(DateTime::from_chrono(&x))
    }
}

macro_rules! value_from_domain {
    ($($type:ident),+ $(,)?) => {
        $(
            impl From<$type> for Value {
                fn from(x: $type) -> Self {
                    Value::$type(x)
                }
            }
        )+
    };
}

value_from_domain!(
    Date,
    LocalTime,
    LocalDateTime,
    Time,
    DateTime,
    DateTimeZoned,
    Duration,
    Point2D,
    Point3D,
);

/// Error for conversions out of [`Value`] into a narrower host type
#[derive(Debug, thiserror::Error)]
#[error("expected a {expected} value, found {actual}")]
pub struct TypeMismatch {
    pub expected: &'static str,
    pub actual: &'static str,
}

macro_rules! try_from_value {
    ($type:ty, $expected:literal, $variant:ident) => {
        impl TryFrom<Value> for $type {
            type Error = TypeMismatch;

            fn try_from(value: Value) -> Result<Self, Self::Error> {
                match value {
                    Value::$variant(x) => Ok(x),
                    other => Err(TypeMismatch {
                        expected: $expected,
                        actual: other.kind(),
                    }),
                }
            }
        }
    };
}

try_from_value!(bool, "bool", Bool);
try_from_value!(i64, "int", Int);
try_from_value!(f64, "float", Float);
try_from_value!(String, "string", String);
try_from_value!(Vec<Value>, "list", List);
try_from_value!(PairMap, "map", Map);
try_from_value!(Node, "node", Node);
try_from_value!(Relationship, "relationship", Relationship);
try_from_value!(Path, "path", Path);
try_from_value!(Duration, "duration", Duration);
