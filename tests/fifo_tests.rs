//! FIFO ring behavior: staged writes, ordering, lapping, latest reads

use std::sync::Arc;
use std::time::Duration;

use flexshm::{
    Exchange, HeapProvider, ReadOptions, RegionProvider, Schema, ShmError, Value,
};

fn provider() -> Arc<dyn RegionProvider> {
    Arc::new(HeapProvider::default())
}

fn int_schema() -> Schema {
    Schema::parse(&[("a", "i32")]).unwrap()
}

fn pair(provider: &Arc<dyn RegionProvider>, name: &str, slots: u32) -> (Exchange, Exchange) {
    let tx = Exchange::create_with(Arc::clone(provider), int_schema(), name, slots).unwrap();
    let rx = Exchange::open_with(Arc::clone(provider), int_schema(), name, slots).unwrap();
    (tx, rx)
}

fn read_a(rx: &mut Exchange, options: ReadOptions) -> i32 {
    rx.read(options)
        .unwrap()
        .field("a")
        .unwrap()
        .value()
        .as_i32()
        .unwrap()
}

#[test]
fn test_staged_writes_invisible_until_finalize() {
    let p = provider();
    let (mut tx, mut rx) = pair(&p, "staged", 4);

    tx.write(&[("a", Value::I32(1))]).unwrap();
    assert!(matches!(
        rx.read(ReadOptions::default()).unwrap_err(),
        ShmError::Timeout
    ));

    tx.finalize().unwrap();
    assert_eq!(read_a(&mut rx, ReadOptions::default()), 1);
}

#[test]
fn test_writes_accumulate_until_finalize() {
    let p = provider();
    let schema = Schema::parse(&[("a", "i32"), ("b", "i32")]).unwrap();
    let mut tx = Exchange::create_with(Arc::clone(&p), schema.clone(), "accum", 4).unwrap();
    let mut rx = Exchange::open_with(p, schema, "accum", 4).unwrap();

    tx.write(&[("a", Value::I32(1))]).unwrap();
    tx.write(&[("b", Value::I32(2))]).unwrap();
    tx.finalize().unwrap();

    let snap = rx.read(ReadOptions::default()).unwrap();
    assert_eq!(snap.field("a").unwrap().value().as_i32(), Some(1));
    assert_eq!(snap.field("b").unwrap().value().as_i32(), Some(2));
    assert!(snap.field("a").unwrap().modified());
    assert!(snap.field("b").unwrap().modified());
}

#[test]
fn test_fifo_order_and_overwrite_oldest() {
    // Writer publishes a=1..4 into three slots without a reader; the
    // FIFO reader then receives 2, 3, 4 (1 was dropped)
    let p = provider();
    let (mut tx, mut rx) = pair(&p, "lap", 3);

    for v in 1..=4 {
        tx.write(&[("a", Value::I32(v))]).unwrap();
        tx.finalize().unwrap();
    }

    assert_eq!(rx.pending().unwrap(), 3);
    for expected in 2..=4 {
        assert_eq!(read_a(&mut rx, ReadOptions::default()), expected);
    }
    assert!(matches!(
        rx.read(ReadOptions::default()).unwrap_err(),
        ShmError::Timeout
    ));
}

#[test]
fn test_latest_skips_to_most_recent() {
    let p = provider();
    let (mut tx, mut rx) = pair(&p, "latest", 3);

    for v in 1..=4 {
        tx.write(&[("a", Value::I32(v))]).unwrap();
        tx.finalize().unwrap();
    }

    assert_eq!(read_a(&mut rx, ReadOptions::default().latest(true)), 4);
    let err = rx
        .read(ReadOptions::default().timeout(Duration::from_millis(50)))
        .unwrap_err();
    assert!(matches!(err, ShmError::Timeout));
}

#[test]
fn test_write_ids_strictly_increase() {
    let p = provider();
    let (mut tx, mut rx) = pair(&p, "ids", 2);

    let mut last = 0;
    for v in 1..=5 {
        tx.write(&[("a", Value::I32(v))]).unwrap();
        tx.finalize().unwrap();

        let snap = rx.read(ReadOptions::default().latest(true)).unwrap();
        assert!(snap.write_id() > last);
        last = snap.write_id();
    }
    assert_eq!(last, 5);
}

#[test]
fn test_finalize_without_writes_is_noop() {
    let p = provider();
    let (mut tx, mut rx) = pair(&p, "noop", 2);

    tx.finalize().unwrap();
    assert!(matches!(
        rx.read(ReadOptions::default()).unwrap_err(),
        ShmError::Timeout
    ));
}

#[test]
fn test_empty_write_publishes_with_flags_cleared() {
    let p = provider();
    let (mut tx, mut rx) = pair(&p, "empty-write", 2);

    tx.write(&[("a", Value::I32(9))]).unwrap();
    tx.finalize().unwrap();
    rx.read(ReadOptions::default()).unwrap();

    // A publication that touches nothing: value carried, modified clear
    tx.write(&[]).unwrap();
    tx.finalize().unwrap();
    let snap = rx.read(ReadOptions::default()).unwrap();
    let a = snap.field("a").unwrap();
    assert_eq!(a.value().as_i32(), Some(9));
    assert!(a.valid());
    assert!(!a.modified());
}

#[test]
fn test_modified_relative_to_previous_publication_despite_skips() {
    let p = provider();
    let schema = Schema::parse(&[("a", "i32"), ("b", "i32")]).unwrap();
    let mut tx = Exchange::create_with(Arc::clone(&p), schema.clone(), "skips", 4).unwrap();
    let mut rx = Exchange::open_with(p, schema, "skips", 4).unwrap();

    tx.write(&[("a", Value::I32(1)), ("b", Value::I32(1))]).unwrap();
    tx.finalize().unwrap();
    tx.write(&[("a", Value::I32(2))]).unwrap();
    tx.finalize().unwrap();
    tx.write(&[("b", Value::I32(3))]).unwrap();
    tx.finalize().unwrap();

    // Reader jumps straight to the last publication; its modified flags
    // still describe the change in that publication alone
    let snap = rx.read(ReadOptions::default().latest(true)).unwrap();
    assert!(!snap.field("a").unwrap().modified());
    assert!(snap.field("b").unwrap().modified());
    assert_eq!(snap.field("a").unwrap().value().as_i32(), Some(2));
    assert_eq!(snap.field("b").unwrap().value().as_i32(), Some(3));
}

#[test]
fn test_timeout_zero_returns_immediately_when_empty() {
    let p = provider();
    let (_tx, mut rx) = pair(&p, "poll", 2);
    assert!(matches!(
        rx.read(ReadOptions::default()).unwrap_err(),
        ShmError::Timeout
    ));
}

#[test]
fn test_single_slot_lap_keeps_only_latest() {
    let p = provider();
    let (mut tx, mut rx) = pair(&p, "single-lap", 1);

    for v in 1..=3 {
        tx.write(&[("a", Value::I32(v))]).unwrap();
    }
    assert_eq!(read_a(&mut rx, ReadOptions::default()), 3);
}

#[test]
fn test_independent_reader_cursors() {
    let p = provider();
    let (mut tx, mut rx1) = pair(&p, "cursors", 4);
    let mut rx2 = Exchange::open_with(Arc::clone(&p), int_schema(), "cursors", 4).unwrap();

    for v in 1..=2 {
        tx.write(&[("a", Value::I32(v))]).unwrap();
        tx.finalize().unwrap();
    }

    assert_eq!(read_a(&mut rx1, ReadOptions::default()), 1);
    assert_eq!(read_a(&mut rx1, ReadOptions::default()), 2);
    // The second reader starts from the beginning regardless
    assert_eq!(read_a(&mut rx2, ReadOptions::default()), 1);
}
