use fulmen_codec::decode::from_bytes;
use fulmen_codec::encode::to_bytes;
use fulmen_codec::value::{
    Date, DateTime, DateTimeZoned, Duration, LocalDateTime, LocalTime, PairMap, Point2D, Point3D,
    Time,
};
use fulmen_codec::{ProtocolVersion, Value};
use proptest::collection::vec;
use proptest::prelude::*;

fn value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        prop::num::f64::NORMAL.prop_map(Value::Float),
        ".{0,12}".prop_map(Value::from),
    ];

    leaf.prop_recursive(3, 24, 6, |inner| {
        prop_oneof![
            vec(inner.clone(), 0..6).prop_map(Value::List),
            vec(("[a-z]{0,6}".prop_map(String::from), inner), 0..6)
                .prop_map(|pairs| Value::Map(PairMap::from(pairs))),
        ]
    })
}

proptest! {
    #[test]
    fn encode_decode_identity(value in value_strategy()) {
        let bytes = to_bytes(&value, ProtocolVersion::V3).unwrap();
        prop_assert_eq!(from_bytes(&bytes, ProtocolVersion::V3).unwrap(), value);
    }

    #[test]
    fn encoding_is_deterministic(value in value_strategy()) {
        let first = to_bytes(&value, ProtocolVersion::V3).unwrap();
        let second = to_bytes(&value, ProtocolVersion::V3).unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn integer_encoding_is_minimal(x in any::<i64>()) {
        let bytes = to_bytes(&Value::Int(x), ProtocolVersion::V3).unwrap();

        let expected = if (-16..=127).contains(&x) {
            1
        } else if i8::try_from(x).is_ok() {
            2
        } else if i16::try_from(x).is_ok() {
            3
        } else if i32::try_from(x).is_ok() {
            5
        } else {
            9
        };

        prop_assert_eq!(bytes.len(), expected);
    }
}

#[test]
fn golden_vectors() {
    let cases: &[(&str, Value)] = &[
        ("c0", Value::Null),
        ("c2", Value::Bool(false)),
        ("c3", Value::Bool(true)),
        ("7f", Value::Int(127)),
        ("f0", Value::Int(-16)),
        ("c8ef", Value::Int(-17)),
        ("c90080", Value::Int(128)),
        ("c1400921fb54442d18", Value::Float(std::f64::consts::PI)),
        ("8568656c6c6f", Value::from("hello")),
        ("90", Value::List(vec![])),
        ("9301c90080c3", Value::from(vec![Value::Int(1), Value::Int(128), Value::Bool(true)])),
        (
            "b4450d0bca0000b75dc9022a",
            Value::Duration(Duration {
                months: 13,
                days: 11,
                seconds: 46_941,
                nanos: 554,
            }),
        ),
    ];

    for (expected, value) in cases {
        let bytes = to_bytes(value, ProtocolVersion::V3).unwrap();

        assert_eq!(&hex::encode(&bytes), expected);
        assert_eq!(&from_bytes(&bytes, ProtocolVersion::V3).unwrap(), value);
    }
}

#[test]
fn string_size_boundaries() {
    // (byte length, expected marker prefix)
    let cases: &[(usize, &[u8])] = &[
        (0, &[0x80]),
        (15, &[0x8F]),
        (16, &[0xD0, 0x10]),
        (255, &[0xD0, 0xFF]),
        (256, &[0xD1, 0x01, 0x00]),
        (65_535, &[0xD1, 0xFF, 0xFF]),
        (65_536, &[0xD2, 0x00, 0x01, 0x00, 0x00]),
    ];

    for (len, prefix) in cases {
        let value = Value::String("x".repeat(*len));
        let bytes = to_bytes(&value, ProtocolVersion::V3).unwrap();

        assert_eq!(&bytes[..prefix.len()], *prefix, "string of {len} bytes");
        assert_eq!(bytes.len(), prefix.len() + len);
        assert_eq!(from_bytes(&bytes, ProtocolVersion::V3).unwrap(), value);
    }
}

#[test]
fn list_size_boundaries() {
    let cases: &[(usize, &[u8])] = &[
        (0, &[0x90]),
        (15, &[0x9F]),
        (16, &[0xD4, 0x10]),
        (255, &[0xD4, 0xFF]),
        (256, &[0xD5, 0x01, 0x00]),
        (65_535, &[0xD5, 0xFF, 0xFF]),
        (65_536, &[0xD6, 0x00, 0x01, 0x00, 0x00]),
    ];

    for (len, prefix) in cases {
        let value = Value::List(vec![Value::Int(0); *len]);
        let bytes = to_bytes(&value, ProtocolVersion::V3).unwrap();

        assert_eq!(&bytes[..prefix.len()], *prefix, "list of {len} items");
        assert_eq!(from_bytes(&bytes, ProtocolVersion::V3).unwrap(), value);
    }
}

#[test]
fn map_size_boundaries() {
    for len in [0usize, 15, 16, 255, 256, 65_535, 65_536] {
        let pairs: Vec<_> = (0..len)
            .map(|i| (format!("k{i}"), Value::Int(i as i64)))
            .collect();
        let value = Value::Map(PairMap::from(pairs));

        let bytes = to_bytes(&value, ProtocolVersion::V3).unwrap();
        assert_eq!(
            from_bytes(&bytes, ProtocolVersion::V3).unwrap(),
            value,
            "map of {len} entries"
        );
    }
}

#[test]
fn temporal_and_spatial_roundtrips() {
    let values = vec![
        Value::Date(Date { days: -719_162 }),
        Value::LocalTime(LocalTime {
            nanos_of_day: 86_399_999_999_999,
        }),
        Value::LocalDateTime(LocalDateTime {
            seconds: 1_598_000_000,
            nanos: 999_999_999,
        }),
        Value::Time(Time {
            nanos_of_day: 1,
            offset_seconds: -3_600,
        }),
        Value::DateTime(DateTime {
            seconds: -1,
            nanos: 999_999_000,
            offset_seconds: 7_200,
        }),
        Value::DateTimeZoned(DateTimeZoned {
            seconds: 1_598_000_000,
            nanos: 0,
            zone_id: "Europe/Oslo".to_string(),
        }),
        Value::Duration(Duration {
            months: 13,
            days: 11,
            seconds: 46_941,
            nanos: 554,
        }),
        Value::Point2D(Point2D {
            srid: 4326,
            x: 12.994_341,
            y: 55.611_784,
        }),
        Value::Point3D(Point3D {
            srid: 4979,
            x: 12.994_341,
            y: 55.611_784,
            z: 2.5,
        }),
    ];

    for value in values {
        for version in [ProtocolVersion::V2, ProtocolVersion::V3] {
            let bytes = to_bytes(&value, version).unwrap();
            assert_eq!(from_bytes(&bytes, version).unwrap(), value);
        }

        assert!(to_bytes(&value, ProtocolVersion::V1).is_err());
    }
}

#[test]
fn nested_containers_roundtrip() {
    let mut properties = PairMap::new();
    properties.insert("name", "rust");
    properties.insert("stars", 93_000i64);
    properties.insert("tags", Value::from(vec!["systems", "fast"]));

    let value = Value::List(vec![
        Value::Null,
        Value::Map(properties),
        Value::List(vec![Value::Int(-17), Value::Float(0.5)]),
    ]);

    let bytes = to_bytes(&value, ProtocolVersion::V1).unwrap();
    assert_eq!(from_bytes(&bytes, ProtocolVersion::V1).unwrap(), value);
}
