#![allow(missing_docs)]

use std::sync::Arc;

use bytes::Bytes;
use tessera::{
    GraphIndex, IndexReader, IndexWriter, Key, MemoryTransport, ReaderOptions, TesseraError,
    Transport,
};

fn key(i: u32) -> Key {
    Key::new([format!("n{i:05}").into_bytes()])
}

/// Ten thousand chained nodes, roughly 350 KiB serialized.
fn big_index() -> Bytes {
    let mut writer = IndexWriter::new(1, 1);
    for i in 0..10_000u32 {
        let parents = if i == 0 { Vec::new() } else { vec![key(i - 1)] };
        writer
            .add_node(key(i), format!("value-{i:05}-{i:05}").into_bytes(), vec![parents])
            .unwrap();
    }
    writer.finish().unwrap()
}

#[test]
fn single_key_lookups_read_a_fraction_of_the_index() {
    let bytes = big_index();
    let size = bytes.len() as u64;
    let transport = Arc::new(MemoryTransport::with_page_size(1024));
    transport.put_bytes("big.tix", &bytes).unwrap();
    let reader = IndexReader::open(transport, "big.tix", Some(size));

    let entries = reader.iter_entries(&[key(7_341)]).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].value, Bytes::from(&b"value-07341-07341"[..]));
    assert_eq!(entries[0].refs[0], vec![key(7_340)]);

    let stats = reader.stats();
    assert!(!stats.buffered);
    assert!(stats.readv_calls >= 2, "bisection issues several probes");
    assert!(
        stats.bytes_read < size / 4,
        "read {} of {} bytes",
        stats.bytes_read,
        size
    );
}

#[test]
fn repeated_lookups_answer_from_parsed_regions() {
    let bytes = big_index();
    let size = bytes.len() as u64;
    let transport = Arc::new(MemoryTransport::with_page_size(1024));
    transport.put_bytes("big.tix", &bytes).unwrap();
    let reader = IndexReader::open(transport, "big.tix", Some(size));

    let first = reader.iter_entries(&[key(2_500)]).unwrap();
    assert_eq!(first.len(), 1);
    let after_first = reader.stats();

    let second = reader.iter_entries(&[key(2_500)]).unwrap();
    assert_eq!(first, second);
    let after_second = reader.stats();
    assert_eq!(after_first.readv_calls, after_second.readv_calls);
    assert_eq!(after_first.bytes_read, after_second.bytes_read);
}

#[test]
fn wide_lookups_buffer_the_whole_index() {
    let bytes = big_index();
    let size = bytes.len() as u64;
    let transport = Arc::new(MemoryTransport::with_page_size(1024));
    transport.put_bytes("big.tix", &bytes).unwrap();
    let reader = IndexReader::open(transport, "big.tix", Some(size));

    let wanted: Vec<Key> = (0..600).map(|i| key(i * 16)).collect();
    let entries = reader.iter_entries(&wanted).unwrap();
    assert_eq!(entries.len(), 600);

    let stats = reader.stats();
    assert!(stats.buffered);
    assert!(stats.bytes_read >= size);
}

#[test]
fn values_wider_than_read_windows_stay_visible() {
    // Every node line is wider than a read window, so no single window
    // holds a complete line and most decode nothing at all.
    let mut writer = IndexWriter::new(0, 1);
    for i in 0..30u32 {
        let mut value = format!("blob-{i:02}-").into_bytes();
        value.resize(2_048, b'.');
        writer.add_node(key(i), value, Vec::new()).unwrap();
    }
    let bytes = writer.finish().unwrap();
    let size = bytes.len() as u64;

    let transport = Arc::new(MemoryTransport::with_page_size(64));
    transport.put_bytes("blobs.tix", &bytes).unwrap();
    let bisected = IndexReader::open(transport, "blobs.tix", Some(size));

    let whole = Arc::new(MemoryTransport::new());
    whole.put_bytes("blobs.tix", &bytes).unwrap();
    let buffered = IndexReader::open(whole, "blobs.tix", None);

    assert!(bisected.iter_entries(&[key(99_999)]).unwrap().is_empty());
    for i in [0u32, 13, 29] {
        assert_eq!(
            bisected.iter_entries(&[key(i)]).unwrap(),
            buffered.iter_entries(&[key(i)]).unwrap(),
        );
    }
}

#[test]
fn an_unknown_size_buffers_immediately() {
    let bytes = big_index();
    let transport = Arc::new(MemoryTransport::new());
    transport.put_bytes("big.tix", &bytes).unwrap();
    let reader = IndexReader::open(transport, "big.tix", None);

    let entries = reader.iter_entries(&[key(42)]).unwrap();
    assert_eq!(entries.len(), 1);
    assert!(reader.stats().buffered);
}

#[test]
fn an_index_embedded_in_a_container_reads_in_place() {
    let mut writer = IndexWriter::new(1, 1);
    for i in 0..50u32 {
        let parents = if i == 0 { Vec::new() } else { vec![key(i - 1)] };
        writer
            .add_node(key(i), format!("packed {i}").into_bytes(), vec![parents])
            .unwrap();
    }
    let index = writer.finish().unwrap();

    let mut container = vec![0xAAu8; 500];
    container.extend_from_slice(&index);
    container.extend_from_slice(&[0x55u8; 300]);

    let transport = Arc::new(MemoryTransport::with_page_size(512));
    transport.put_bytes("bundle.pack", &container).unwrap();
    let reader = IndexReader::open_with_options(
        transport,
        "bundle.pack",
        Some(index.len() as u64),
        ReaderOptions {
            base_offset: 500,
            unlimited_cache: true,
            ..ReaderOptions::default()
        },
    );
    assert!(reader.unlimited_cache());

    // A probe near the region edges may fetch container bytes; those are
    // trimmed before parsing.
    let entries = reader.iter_entries(&[key(31)]).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].value, Bytes::from(&b"packed 31"[..]));

    assert_eq!(reader.iter_all_entries().unwrap().len(), 50);
    reader.validate().unwrap();
}

#[test]
fn a_vanished_file_reports_missing_storage() {
    let transport = Arc::new(MemoryTransport::new());
    let reader = IndexReader::open(transport, "gone.tix", Some(1_000));
    assert!(matches!(
        reader.iter_entries(&[key(1)]),
        Err(TesseraError::StorageNotFound { .. })
    ));
    assert!(matches!(
        reader.iter_all_entries(),
        Err(TesseraError::StorageNotFound { .. })
    ));
}

#[test]
fn clear_cache_discards_buffers_and_counters() {
    let mut writer = IndexWriter::new(0, 1);
    for i in 0..10u32 {
        writer.add_node(key(i), &b"v"[..], Vec::new()).unwrap();
    }
    let bytes = writer.finish().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    transport.put_bytes("small.tix", &bytes).unwrap();
    let reader = IndexReader::open(transport, "small.tix", Some(bytes.len() as u64));

    assert_eq!(reader.iter_all_entries().unwrap().len(), 10);
    assert!(reader.stats().buffered);

    reader.clear_cache();
    let stats = reader.stats();
    assert!(!stats.buffered);
    assert_eq!(stats.bytes_read, 0);
    assert_eq!(stats.readv_calls, 0);

    let entries = reader.iter_entries(&[key(3)]).unwrap();
    assert_eq!(entries.len(), 1);
}
