#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tessera::{
    CombinedIndex, GraphIndex, IndexReader, IndexWriter, InMemoryIndex, Key, Member,
    MemoryTransport, TesseraError, Transport,
};

fn key(text: &str) -> Key {
    Key::new([text.as_bytes().to_vec()])
}

fn mem(entries: &[(&str, &[u8])]) -> Arc<InMemoryIndex> {
    let index = InMemoryIndex::new(0, 1);
    for (name, value) in entries {
        index.add_node(key(name), value.to_vec(), Vec::new()).unwrap();
    }
    Arc::new(index)
}

fn write_pack(
    transport: &Arc<MemoryTransport>,
    path: &str,
    entries: &[(&str, &[u8])],
) -> Arc<IndexReader> {
    let mut writer = IndexWriter::new(0, 1);
    for (name, value) in entries {
        writer.add_node(key(name), value.to_vec(), Vec::new()).unwrap();
    }
    let bytes = writer.finish().unwrap();
    transport.put_bytes(path, &bytes).unwrap();
    Arc::new(IndexReader::open(
        transport.clone(),
        path,
        Some(bytes.len() as u64),
    ))
}

fn named(name: &str, index: Arc<dyn GraphIndex>) -> Member {
    (Some(name.to_string()), index)
}

#[test]
fn compaction_swaps_packs_under_a_live_view() {
    let transport = Arc::new(MemoryTransport::new());
    let pack_a = write_pack(&transport, "packs/a.tix", &[("alpha", b"1"), ("bravo", b"2")]);
    let pack_b = write_pack(&transport, "packs/b.tix", &[("delta", b"4")]);

    let packs: Arc<Mutex<Vec<Member>>> = Arc::new(Mutex::new(vec![
        named("a", pack_a.clone()),
        named("b", pack_b.clone()),
    ]));
    let registry = packs.clone();
    let combined = CombinedIndex::with_reload(
        packs.lock().clone(),
        Box::new(move || Ok(Some(registry.lock().clone()))),
    );

    // Compaction rewrites both packs into one and removes the originals.
    let repacked = write_pack(
        &transport,
        "packs/repacked.tix",
        &[("alpha", b"1"), ("bravo", b"2"), ("delta", b"4")],
    );
    transport.delete("packs/a.tix").unwrap();
    transport.delete("packs/b.tix").unwrap();
    *packs.lock() = vec![named("repacked", repacked)];

    let entries = combined.iter_entries(&[key("alpha"), key("delta")]).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(combined.member_names(), vec![Some("repacked".to_string())]);
    assert_eq!(combined.key_count().unwrap(), 3);
}

#[test]
fn midstream_reload_does_not_duplicate_results() {
    let transport = Arc::new(MemoryTransport::new());
    let first = mem(&[("alpha", b"from-first")]);
    let vanished = write_pack(&transport, "packs/gone.tix", &[("omega", b"old")]);
    transport.delete("packs/gone.tix").unwrap();

    let replacement = mem(&[("alpha", b"conflicting"), ("omega", b"from-reload")]);
    let members = vec![named("first", first.clone()), named("gone", vanished)];
    let fresh = vec![named("first", first), named("replacement", replacement)];
    let combined = CombinedIndex::with_reload(members, Box::new(move || Ok(Some(fresh.clone()))));

    let mut entries = combined.iter_entries(&[key("alpha"), key("omega")]).unwrap();
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    assert_eq!(entries.len(), 2);
    // "alpha" was answered before the failure; the retry must not yield the
    // replacement's conflicting copy.
    assert_eq!(entries[0].value, Bytes::from(&b"from-first"[..]));
    assert_eq!(entries[1].value, Bytes::from(&b"from-reload"[..]));
}

#[test]
fn interrupted_full_scans_resume_without_duplicates() {
    let transport = Arc::new(MemoryTransport::new());
    let first = mem(&[("alpha", b"1"), ("bravo", b"2")]);
    let vanished = write_pack(&transport, "packs/gone.tix", &[("charlie", b"3")]);
    transport.delete("packs/gone.tix").unwrap();

    // The replacement repeats "bravo"; a resumed scan must not.
    let replacement = mem(&[("bravo", b"99"), ("charlie", b"3")]);
    let members = vec![named("first", first.clone()), named("gone", vanished)];
    let fresh = vec![named("first", first), named("replacement", replacement)];
    let combined = CombinedIndex::with_reload(members, Box::new(move || Ok(Some(fresh.clone()))));

    let entries = combined.iter_all_entries().unwrap();
    assert_eq!(entries.len(), 3);
    let mut keys: Vec<Key> = entries.iter().map(|e| e.key.clone()).collect();
    keys.sort();
    assert_eq!(keys, vec![key("alpha"), key("bravo"), key("charlie")]);
    let bravo = entries.iter().find(|e| e.key == key("bravo")).unwrap();
    assert_eq!(bravo.value, Bytes::from(&b"2"[..]));
}

#[test]
fn key_count_and_validate_follow_a_reload() {
    let transport = Arc::new(MemoryTransport::new());
    let vanished = write_pack(&transport, "packs/gone.tix", &[("alpha", b"1")]);
    transport.delete("packs/gone.tix").unwrap();

    let fresh = vec![named(
        "replacement",
        mem(&[("alpha", b"1"), ("bravo", b"2"), ("charlie", b"3")]),
    )];
    let combined = CombinedIndex::with_reload(
        vec![named("gone", vanished)],
        Box::new(move || Ok(Some(fresh.clone()))),
    );

    assert_eq!(combined.key_count().unwrap(), 3);
    combined.validate().unwrap();
    assert_eq!(
        combined.member_names(),
        vec![Some("replacement".to_string())]
    );
}

#[test]
fn each_operation_gets_its_own_reload_attempt() {
    let transport = Arc::new(MemoryTransport::new());
    let vanished = write_pack(&transport, "packs/gone.tix", &[("alpha", b"1")]);
    transport.delete("packs/gone.tix").unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let combined = CombinedIndex::with_reload(
        vec![named("gone", vanished)],
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            // Nothing changed on disk; the caller keeps the original error.
            Ok(None)
        }),
    );

    assert!(matches!(
        combined.iter_entries(&[key("alpha")]),
        Err(TesseraError::StorageNotFound { .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(matches!(
        combined.key_count(),
        Err(TesseraError::StorageNotFound { .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
