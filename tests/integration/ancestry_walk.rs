#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tessera::{
    CombinedIndex, GraphIndex, IndexReader, IndexWriter, InMemoryIndex, Key, Member,
    MemoryTransport, Transport,
};

fn key(text: &str) -> Key {
    Key::new([text.as_bytes().to_vec()])
}

fn name(i: usize) -> Key {
    key(&format!("node-{i:03}"))
}

fn named(label: &str, index: Arc<dyn GraphIndex>) -> Member {
    (Some(label.to_string()), index)
}

#[test]
fn walks_cross_disk_and_memory_members() {
    // tip -> mid -> root, with one ghost grandparent.
    let transport = Arc::new(MemoryTransport::new());
    let mut writer = IndexWriter::new(1, 1);
    writer
        .add_node(key("root"), &b"r"[..], vec![vec![key("ghost")]])
        .unwrap();
    let bytes = writer.finish().unwrap();
    transport.put_bytes("history.tix", &bytes).unwrap();
    let disk = Arc::new(IndexReader::open(
        transport,
        "history.tix",
        Some(bytes.len() as u64),
    ));

    let recent = InMemoryIndex::new(1, 1);
    recent
        .add_node(key("mid"), &b"m"[..], vec![vec![key("root")]])
        .unwrap();
    recent
        .add_node(key("tip"), &b"t"[..], vec![vec![key("mid")]])
        .unwrap();

    let combined = CombinedIndex::new(vec![
        named("recent", Arc::new(recent)),
        named("history", disk),
    ]);
    let ancestry = combined.find_ancestry(&[key("tip")], 0).unwrap();

    assert_eq!(ancestry.parent_map.len(), 3);
    assert_eq!(ancestry.parent_map[&key("tip")], vec![key("mid")]);
    assert_eq!(ancestry.parent_map[&key("mid")], vec![key("root")]);
    assert_eq!(ancestry.parent_map[&key("root")], vec![key("ghost")]);
    assert_eq!(ancestry.missing_keys.len(), 1);
    assert!(ancestry.missing_keys.contains(&key("ghost")));
}

#[test]
fn random_dags_match_a_reference_walk() {
    let mut rng = ChaCha8Rng::seed_from_u64(0x00AC_CE55);
    let mut graph: Vec<(Key, Vec<Key>)> = Vec::new();
    for i in 0..300usize {
        let mut parents = Vec::new();
        let parent_count = rng.gen_range(0..=3.min(i));
        for _ in 0..parent_count {
            parents.push(name(rng.gen_range(0..i)));
        }
        if i % 40 == 7 {
            parents.push(key(&format!("ghost-{i}")));
        }
        graph.push((name(i), parents));
    }

    // Scatter the nodes over two memory members and one pack file.
    let transport = Arc::new(MemoryTransport::new());
    let mut writer = IndexWriter::new(1, 1);
    let mem_a = InMemoryIndex::new(1, 1);
    let mem_b = InMemoryIndex::new(1, 1);
    for (i, (node, parents)) in graph.iter().enumerate() {
        let refs = vec![parents.clone()];
        match i % 3 {
            0 => writer.add_node(node.clone(), &b"v"[..], refs).unwrap(),
            1 => mem_a.add_node(node.clone(), &b"v"[..], refs).unwrap(),
            _ => mem_b.add_node(node.clone(), &b"v"[..], refs).unwrap(),
        }
    }
    let bytes = writer.finish().unwrap();
    transport.put_bytes("scattered.tix", &bytes).unwrap();
    let disk = Arc::new(IndexReader::open(
        transport,
        "scattered.tix",
        Some(bytes.len() as u64),
    ));
    let combined = CombinedIndex::new(vec![
        named("a", Arc::new(mem_a)),
        named("pack", disk),
        named("b", Arc::new(mem_b)),
    ]);

    let tips: Vec<Key> = (295..300).map(name).chain([key("never-existed")]).collect();
    let ancestry = combined.find_ancestry(&tips, 0).unwrap();

    // Reference traversal over the flat edge list.
    let edges: HashMap<Key, Vec<Key>> = graph.iter().cloned().collect();
    let mut expected_parents: HashMap<Key, Vec<Key>> = HashMap::new();
    let mut expected_missing: Vec<Key> = Vec::new();
    let mut queue: Vec<Key> = tips.clone();
    let mut visited: Vec<Key> = Vec::new();
    while let Some(node) = queue.pop() {
        if visited.contains(&node) {
            continue;
        }
        visited.push(node.clone());
        match edges.get(&node) {
            Some(parents) => {
                expected_parents.insert(node, parents.clone());
                queue.extend(parents.iter().cloned());
            }
            None => expected_missing.push(node),
        }
    }

    assert_eq!(ancestry.parent_map.len(), expected_parents.len());
    for (node, parents) in &expected_parents {
        assert_eq!(ancestry.parent_map.get(node), Some(parents), "{node:?}");
    }
    assert_eq!(ancestry.missing_keys.len(), expected_missing.len());
    for node in &expected_missing {
        assert!(ancestry.missing_keys.contains(node), "{node:?}");
    }
}

#[test]
fn a_member_lost_mid_walk_is_reloaded() {
    let transport = Arc::new(MemoryTransport::new());
    let mut writer = IndexWriter::new(1, 1);
    writer
        .add_node(key("a"), &b"v"[..], vec![Vec::new()])
        .unwrap();
    writer
        .add_node(key("b"), &b"v"[..], vec![vec![key("a")]])
        .unwrap();
    let bytes = writer.finish().unwrap();
    transport.put_bytes("packs/old.tix", &bytes).unwrap();
    let disk = Arc::new(IndexReader::open(
        transport.clone(),
        "packs/old.tix",
        Some(bytes.len() as u64),
    ));

    let recent = InMemoryIndex::new(1, 1);
    recent
        .add_node(key("c"), &b"v"[..], vec![vec![key("b")]])
        .unwrap();
    recent
        .add_node(key("d"), &b"v"[..], vec![vec![key("c")]])
        .unwrap();
    let recent = Arc::new(recent);

    let replacement = InMemoryIndex::new(1, 1);
    replacement
        .add_node(key("a"), &b"v"[..], vec![Vec::new()])
        .unwrap();
    replacement
        .add_node(key("b"), &b"v"[..], vec![vec![key("a")]])
        .unwrap();
    let fresh = vec![
        named("recent", recent.clone()),
        named("replacement", Arc::new(replacement)),
    ];
    let combined = CombinedIndex::with_reload(
        vec![named("recent", recent), named("old", disk)],
        Box::new(move || Ok(Some(fresh.clone()))),
    );

    transport.delete("packs/old.tix").unwrap();
    let ancestry = combined.find_ancestry(&[key("d")], 0).unwrap();
    assert_eq!(ancestry.parent_map.len(), 4);
    assert!(ancestry.missing_keys.is_empty());
    assert_eq!(ancestry.parent_map[&key("a")], Vec::<Key>::new());
}
