#![allow(missing_docs)]

use std::sync::Arc;

use bytes::Bytes;
use tempfile::tempdir;
use tessera::{
    GraphIndex, IndexReader, IndexWriter, InMemoryIndex, Key, LocalTransport, MemoryTransport,
    PrefixKey, TesseraError, Transport,
};

fn key(text: &str) -> Key {
    Key::new([text.as_bytes().to_vec()])
}

fn rev(i: u32) -> Key {
    key(&format!("rev-{i:03}"))
}

fn open_reader(transport: Arc<MemoryTransport>, path: &str, bytes: &Bytes) -> IndexReader {
    transport.put_bytes(path, bytes).unwrap();
    IndexReader::open(transport, path, Some(bytes.len() as u64))
}

#[test]
fn revision_graph_round_trips_through_disk() {
    let mut writer = IndexWriter::new(2, 1);
    // Insertion order is irrelevant; the serialized form is sorted.
    let mut order: Vec<u32> = (1..=50).collect();
    order.reverse();
    order.swap(3, 40);
    for i in order {
        let parents = vec![rev(i - 1)];
        let annotations = if i % 10 == 0 { vec![rev(1)] } else { Vec::new() };
        writer
            .add_node(rev(i), format!("value {i}").into_bytes(), vec![parents, annotations])
            .unwrap();
    }
    let bytes = writer.finish().unwrap();

    let transport = Arc::new(MemoryTransport::new());
    let reader = open_reader(transport, "graph.tix", &bytes);

    assert_eq!(reader.key_count().unwrap(), 50);
    let all = reader.iter_all_entries().unwrap();
    assert_eq!(all.len(), 50);
    let keys: Vec<Key> = all.iter().map(|e| e.key.clone()).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);

    let entries = reader.iter_entries(&[rev(25)]).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].value, Bytes::from(&b"value 25"[..]));
    assert_eq!(entries[0].refs[0], vec![rev(24)]);
    assert!(entries[0].refs[1].is_empty());

    // rev-000 was only ever referenced, never added.
    let ghosts = reader.external_references(0).unwrap();
    assert_eq!(ghosts.len(), 1);
    assert!(ghosts.contains(&rev(0)));
    assert!(reader.external_references(1).unwrap().is_empty());

    reader.validate().unwrap();
}

#[test]
fn pathname_keys_round_trip_with_prefix_lookups() {
    let mut writer = IndexWriter::new(0, 2);
    let files = [
        ("dir-a", "f1", &b"size=10\tmode=644"[..]),
        ("dir-a", "f2", &b"size=0 sha=da39a3ee"[..]),
        ("dir-b", "f1", &b"size=7\tmode=755"[..]),
    ];
    for (dir, name, value) in files {
        writer
            .add_node(Key::new([dir, name]), value, Vec::new())
            .unwrap();
    }
    let bytes = writer.finish().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let reader = open_reader(transport, "paths.tix", &bytes);

    let in_dir_a = reader
        .iter_entries_prefix(&[PrefixKey::with_wildcards(["dir-a"], 1)])
        .unwrap();
    assert_eq!(in_dir_a.len(), 2);

    let exact = reader
        .iter_entries_prefix(&[PrefixKey::from_key(&Key::new(["dir-b", "f1"]))])
        .unwrap();
    assert_eq!(exact.len(), 1);
    assert_eq!(exact[0].value, Bytes::from(&b"size=7\tmode=755"[..]));
}

#[test]
fn absent_keys_promote_to_real_nodes() {
    let mut writer = IndexWriter::new(1, 1);
    writer
        .add_node(key("child"), &b"c"[..], vec![vec![key("parent")]])
        .unwrap();
    writer
        .add_node(key("parent"), &b"p"[..], vec![Vec::new()])
        .unwrap();
    let bytes = writer.finish().unwrap();

    let transport = Arc::new(MemoryTransport::new());
    let reader = open_reader(transport, "promote.tix", &bytes);
    assert_eq!(reader.key_count().unwrap(), 2);
    assert!(reader.external_references(0).unwrap().is_empty());
    let entries = reader.iter_entries(&[key("child")]).unwrap();
    assert_eq!(entries[0].refs[0], vec![key("parent")]);
}

#[test]
fn writers_reject_invalid_nodes_without_poisoning_the_index() {
    let mut writer = IndexWriter::new(1, 1);

    assert!(matches!(
        writer.add_node(key("has space"), &b"v"[..], vec![Vec::new()]),
        Err(TesseraError::BadKey(_))
    ));
    assert!(matches!(
        writer.add_node(key("ok"), &b"new\nline"[..], vec![Vec::new()]),
        Err(TesseraError::BadValue(_))
    ));
    assert!(matches!(
        writer.add_node(key("ok"), &b"v"[..], Vec::new()),
        Err(TesseraError::BadValue(_))
    ));

    writer.add_node(key("ok"), &b"v"[..], vec![Vec::new()]).unwrap();
    assert!(matches!(
        writer.add_node(key("ok"), &b"again"[..], vec![Vec::new()]),
        Err(TesseraError::DuplicateKey(_))
    ));

    let bytes = writer.finish().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let reader = open_reader(transport, "clean.tix", &bytes);
    assert_eq!(reader.key_count().unwrap(), 1);
    let entries = reader.iter_entries(&[key("ok")]).unwrap();
    assert_eq!(entries[0].value, Bytes::from(&b"v"[..]));
}

#[test]
fn empty_index_round_trips() {
    let mut writer = IndexWriter::new(0, 1);
    let bytes = writer.finish().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let reader = open_reader(transport, "empty.tix", &bytes);

    assert_eq!(reader.key_count().unwrap(), 0);
    assert!(reader.iter_all_entries().unwrap().is_empty());
    assert!(reader.iter_entries(&[key("missing")]).unwrap().is_empty());
    reader.validate().unwrap();
}

#[test]
fn memory_and_disk_agree_on_the_same_nodes() {
    let memory = InMemoryIndex::new(1, 1);
    let mut writer = IndexWriter::new(1, 1);
    for i in 1..=20u32 {
        let refs = vec![vec![rev(i - 1)]];
        memory
            .add_node(rev(i), format!("v{i}").into_bytes(), refs.clone())
            .unwrap();
        writer
            .add_node(rev(i), format!("v{i}").into_bytes(), refs)
            .unwrap();
    }
    let bytes = writer.finish().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let reader = open_reader(transport, "parity.tix", &bytes);

    assert_eq!(memory.key_count().unwrap(), reader.key_count().unwrap());
    assert_eq!(
        memory.iter_all_entries().unwrap(),
        reader.iter_all_entries().unwrap()
    );
    assert_eq!(
        memory.external_references(0).unwrap(),
        reader.external_references(0).unwrap()
    );
}

#[test]
fn local_files_serve_lookups() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(LocalTransport::new(dir.path()));

    let mut writer = IndexWriter::new(1, 1);
    for i in 1..=30u32 {
        writer
            .add_node(rev(i), format!("local {i}").into_bytes(), vec![vec![rev(i - 1)]])
            .unwrap();
    }
    let bytes = writer.finish().unwrap();
    transport.put_bytes("indices/graph.tix", &bytes).unwrap();

    let reader = IndexReader::open(
        transport,
        "indices/graph.tix",
        Some(bytes.len() as u64),
    );
    reader.validate().unwrap();
    let entries = reader.iter_entries(&[rev(7), rev(30)]).unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().any(|e| e.value == Bytes::from(&b"local 7"[..])));
}
