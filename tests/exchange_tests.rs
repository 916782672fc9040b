//! End-to-end exchange scenarios over file-backed and heap regions

use std::sync::Arc;

use flexshm::{
    ArrayValue, Exchange, FileProvider, HeapProvider, ReadOptions, RegionProvider, Schema,
    ShmError, Value,
};
use tempfile::TempDir;

fn heap() -> Arc<dyn RegionProvider> {
    Arc::new(HeapProvider::default())
}

#[test]
fn test_scalar_and_truncated_string_snapshot() {
    let p = heap();
    let schema = Schema::parse(&[("x", "f64"), ("y", "f64"), ("msg", "str[4]")]).unwrap();
    let mut tx = Exchange::create_with(Arc::clone(&p), schema.clone(), "scen1", 1).unwrap();
    let mut rx = Exchange::open_with(p, schema, "scen1", 1).unwrap();

    tx.write(&[
        ("x", Value::F64(1.5)),
        ("y", Value::F64(2.5)),
        ("msg", Value::from("héllo")),
    ])
    .unwrap();

    let snap = rx.read(ReadOptions::default()).unwrap();
    let x = snap.field("x").unwrap();
    assert_eq!(x.value().as_f64(), Some(1.5));
    assert!(x.valid());
    let y = snap.field("y").unwrap();
    assert_eq!(y.value().as_f64(), Some(2.5));
    assert!(y.valid());

    // Five characters into a four-character field: longest fitting prefix
    let msg = snap.field("msg").unwrap();
    assert!(!msg.valid());
    assert!(msg.truncated());
    assert_eq!(msg.value().as_str(), Some("héll"));
}

#[test]
fn test_array_row_major_and_shape_mismatch() {
    let p = heap();
    let schema = Schema::parse(&[("img", "u8[2,2]")]).unwrap();
    let mut tx = Exchange::create_with(Arc::clone(&p), schema.clone(), "scen4", 1).unwrap();
    let mut rx = Exchange::open_with(p, schema, "scen4", 1).unwrap();

    let img = ArrayValue::from_slice(&[1u8, 2, 3, 4], &[2, 2]).unwrap();
    tx.write(&[("img", Value::Array(img))]).unwrap();

    let snap = rx.read(ReadOptions::default()).unwrap();
    let img = snap.field("img").unwrap();
    assert!(img.valid());
    assert_eq!(img.value().as_array().unwrap().bytes(), &[1, 2, 3, 4]);

    // A (1,3) source into a (2,2) field: prefix stored, rest zeroed
    let short = ArrayValue::from_slice(&[1u8, 2, 3], &[1, 3]).unwrap();
    tx.write(&[("img", Value::Array(short))]).unwrap();

    let snap = rx.read(ReadOptions::default()).unwrap();
    let img = snap.field("img").unwrap();
    assert!(img.truncated());
    assert!(!img.valid());
    assert_eq!(img.value().as_array().unwrap().bytes(), &[1, 2, 3, 0]);
    assert_eq!(img.value().as_array().unwrap().shape(), &[2, 2]);
}

#[test]
fn test_attach_rejects_renamed_field() {
    let p = heap();
    let schema = Schema::parse(&[("first", "f64"), ("second", "i32")]).unwrap();
    let mut tx = Exchange::create_with(Arc::clone(&p), schema.clone(), "scen5", 1).unwrap();
    tx.write(&[("first", Value::F64(1.0))]).unwrap();

    let renamed = Schema::parse(&[("first", "f64"), ("renamed", "i32")]).unwrap();
    let err = Exchange::open_with(Arc::clone(&p), renamed, "scen5", 1).unwrap_err();
    assert!(matches!(
        err,
        ShmError::SchemaMismatch {
            what: "schema hash",
            ..
        }
    ));

    // Region is unchanged and still readable under the real schema
    let mut rx = Exchange::open_with(p, schema, "scen5", 1).unwrap();
    let snap = rx.read(ReadOptions::default()).unwrap();
    assert_eq!(snap.field("first").unwrap().value().as_f64(), Some(1.0));
}

#[test]
fn test_unicode_string_roundtrips() {
    let p = heap();
    let schema = Schema::parse(&[("text", "str[32]")]).unwrap();
    let mut tx = Exchange::create_with(Arc::clone(&p), schema.clone(), "uni", 1).unwrap();
    let mut rx = Exchange::open_with(p, schema, "uni", 1).unwrap();

    let samples = [
        "plain ascii",
        "日本語のテキスト",
        "مرحبا بالعالم",
        "🦀🚀✨",
        "e\u{301}le\u{300}ve", // combining marks
        "",
    ];
    for sample in samples {
        tx.write(&[("text", Value::from(sample))]).unwrap();
        let snap = rx.read(ReadOptions::default()).unwrap();
        let text = snap.field("text").unwrap();
        assert!(text.valid(), "{:?} should fit", sample);
        assert_eq!(text.value().as_str(), Some(sample));
    }
}

#[test]
fn test_capacity_exact_string_is_valid() {
    let p = heap();
    let schema = Schema::parse(&[("text", "str[4]")]).unwrap();
    let mut tx = Exchange::create_with(Arc::clone(&p), schema.clone(), "exact", 1).unwrap();
    let mut rx = Exchange::open_with(p, schema, "exact", 1).unwrap();

    // Exactly four characters, all four bytes wide
    tx.write(&[("text", Value::from("🦀🦀🦀🦀"))]).unwrap();
    let snap = rx.read(ReadOptions::default()).unwrap();
    assert!(snap.field("text").unwrap().valid());

    // One character over: truncated, never split mid code point
    tx.write(&[("text", Value::from("🦀🦀🦀🦀🦀"))]).unwrap();
    let snap = rx.read(ReadOptions::default()).unwrap();
    let text = snap.field("text").unwrap();
    assert!(text.truncated());
    assert_eq!(text.value().as_str(), Some("🦀🦀🦀🦀"));
}

#[test]
fn test_nan_bits_survive_the_wire() {
    let p = heap();
    let schema = Schema::parse(&[("x", "f64")]).unwrap();
    let mut tx = Exchange::create_with(Arc::clone(&p), schema.clone(), "nan", 1).unwrap();
    let mut rx = Exchange::open_with(p, schema, "nan", 1).unwrap();

    let nan = f64::from_bits(0x7ff8_0000_0000_1234);
    tx.write(&[("x", Value::F64(nan))]).unwrap();
    let snap = rx.read(ReadOptions::default()).unwrap();
    let x = snap.field("x").unwrap().value().as_f64().unwrap();
    assert_eq!(x.to_bits(), nan.to_bits());

    tx.write(&[("x", Value::F64(f64::INFINITY))]).unwrap();
    let snap = rx.read(ReadOptions::default()).unwrap();
    assert_eq!(
        snap.field("x").unwrap().value().as_f64(),
        Some(f64::INFINITY)
    );
}

#[test]
fn test_empty_schema_publishes() {
    let p = heap();
    let schema = Schema::parse(&[]).unwrap();
    let mut tx = Exchange::create_with(Arc::clone(&p), schema.clone(), "nothing", 1).unwrap();
    let mut rx = Exchange::open_with(p, schema, "nothing", 1).unwrap();

    tx.write(&[]).unwrap();
    let snap = rx.read(ReadOptions::default()).unwrap();
    assert!(snap.is_empty());
    assert_eq!(snap.write_id(), 1);
}

#[test]
fn test_zero_dim_array_field() {
    let p = heap();
    let schema = Schema::parse(&[("none", "f32[0]"), ("tail", "i32")]).unwrap();
    let mut tx = Exchange::create_with(Arc::clone(&p), schema.clone(), "zerodim", 1).unwrap();
    let mut rx = Exchange::open_with(p, schema, "zerodim", 1).unwrap();

    let empty = ArrayValue::from_slice::<f32>(&[], &[0]).unwrap();
    tx.write(&[("none", Value::Array(empty)), ("tail", Value::I32(7))])
        .unwrap();
    let snap = rx.read(ReadOptions::default()).unwrap();
    assert!(snap.field("none").unwrap().valid());
    assert!(snap.field("none").unwrap().value().as_array().unwrap().bytes().is_empty());
    assert_eq!(snap.field("tail").unwrap().value().as_i32(), Some(7));
}

#[test]
fn test_file_backed_region_across_instances() {
    let dir = TempDir::new().unwrap();
    let provider: Arc<dyn RegionProvider> = Arc::new(FileProvider::new(dir.path()));
    let schema = Schema::parse(&[("seq", "i32"), ("label", "str[8]")]).unwrap();

    let mut tx =
        Exchange::create_with(Arc::clone(&provider), schema.clone(), "filereg", 2).unwrap();
    tx.write(&[("seq", Value::I32(1)), ("label", Value::from("first"))])
        .unwrap();
    tx.finalize().unwrap();

    // A separate attach maps the same file
    let mut rx =
        Exchange::open_with(Arc::clone(&provider), schema.clone(), "filereg", 2).unwrap();
    let snap = rx.read(ReadOptions::default()).unwrap();
    assert_eq!(snap.field("seq").unwrap().value().as_i32(), Some(1));
    assert_eq!(snap.field("label").unwrap().value().as_str(), Some("first"));

    // Unlink removes the name; further opens fail
    tx.unlink().unwrap();
    assert!(matches!(
        Exchange::open_with(provider, schema, "filereg", 2).unwrap_err(),
        ShmError::NotFound { .. }
    ));
}

#[test]
fn test_name_in_use() {
    let p = heap();
    let schema = Schema::parse(&[("a", "i32")]).unwrap();
    let _first = Exchange::create_with(Arc::clone(&p), schema.clone(), "taken", 1).unwrap();
    assert!(matches!(
        Exchange::create_with(p, schema, "taken", 1).unwrap_err(),
        ShmError::NameInUse { .. }
    ));
}

#[test]
fn test_slot_count_must_match_on_attach() {
    let p = heap();
    let schema = Schema::parse(&[("a", "i32")]).unwrap();
    let _tx = Exchange::create_with(Arc::clone(&p), schema.clone(), "geom", 4).unwrap();
    let err = Exchange::open_with(p, schema, "geom", 2).unwrap_err();
    assert!(matches!(
        err,
        ShmError::SchemaMismatch {
            what: "slot count",
            ..
        }
    ));
}
