use arbitrary::{Arbitrary, Unstructured};
use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::collections::BTreeMap;

use super::*;

fn setup(name: &str) -> (Store, Opctx) {
    let dir = std::env::temp_dir().join(name);
    std::fs::remove_dir_all(&dir).ok();
    let mut config = Config::new(dir.as_os_str(), "t");
    config.set_file_size(4 * 1024 * 1024, 32 * 1024 * 1024);
    (Store::create(config).unwrap(), Opctx::new())
}

fn drain(store: &Store, cur: &mut Cursor, ctx: &Opctx) -> Vec<(DiskLoc, Doc)> {
    let mut out = vec![];
    while let Some(item) = store.cursor_next(cur, ctx).unwrap() {
        out.push(item);
    }
    out
}

fn int_of(doc: &Doc, field: &str) -> i64 {
    match doc.get(field) {
        Some(Value::Integer(x)) => *x,
        v => panic!("field {:?} = {:?}", field, v),
    }
}

#[test]
fn test_insert_fetch_delete() {
    let (store, ctx) = setup("recstore-store-ifd");
    store.create_collection("c", CollOpts::default(), &ctx).unwrap();

    let doc = Doc::new().set("a", 10_i64).set("b", "ten");
    let loc = store.insert("c", &doc, &ctx).unwrap();
    assert_eq!(store.fetch(loc).unwrap(), doc);

    store.delete("c", loc, &ctx).unwrap();
    // a second delete of the same locator reports not-found.
    match store.delete("c", loc, &ctx) {
        Err(Error::KeyNotFound(_, _)) => (),
        res => panic!("unexpected {:?}", res.err()),
    }
    match store.fetch(loc) {
        Err(Error::KeyNotFound(_, _)) => (),
        res => panic!("unexpected {:?}", res.err()),
    }

    let stats = store.stats("c").unwrap();
    assert_eq!(stats.n_records, 0);
    assert_eq!(stats.data_size, 0);
}

#[test]
fn test_update_in_place_vs_move() {
    let (store, ctx) = setup("recstore-store-update");
    store.create_collection("c", CollOpts::default(), &ctx).unwrap();
    store
        .create_index("c", "a_1", &Doc::new().set("a", 1_i64), false, false, &ctx)
        .unwrap();

    let doc = Doc::new().set("_id", 1_i64).set("a", "AAAA");
    let loc = store.insert("c", &doc, &ctx).unwrap();
    let padding0 = store.stats("c").unwrap().padding;
    assert_eq!(padding0, 1.0);

    // same size: same locator, padding stays at its floor.
    let doc2 = Doc::new().set("_id", 1_i64).set("a", "BBBB");
    let loc2 = store.update("c", loc, &doc2, &ctx).unwrap();
    assert_eq!(loc2, loc);
    assert_eq!(store.fetch(loc).unwrap(), doc2);
    assert_eq!(store.stats("c").unwrap().padding, 1.0);

    // the index reflects only the new value.
    let mut cur = store.index_scan("c", "a_1", 1, None, None, true).unwrap();
    let got = drain(&store, &mut cur, &ctx);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].1.get("a"), Some(&Value::Text("BBBB".to_string())));

    // grow beyond the slot: the record moves, padding bumps up.
    let big = "X".repeat(4096);
    let doc3 = Doc::new().set("_id", 1_i64).set("a", big.as_str());
    let loc3 = store.update("c", loc, &doc3, &ctx).unwrap();
    assert_ne!(loc3, loc);
    let padding = store.stats("c").unwrap().padding;
    assert!((padding - 1.6).abs() < 1e-6, "padding {}", padding);

    // the old locator is gone from the table scan.
    let mut cur = store.scan("c", 1).unwrap();
    let got = drain(&store, &mut cur, &ctx);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0, loc3);

    // and the index knows only the new value.
    let mut cur = store.index_scan("c", "a_1", 1, None, None, true).unwrap();
    let got = drain(&store, &mut cur, &ctx);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0, loc3);
    assert_eq!(got[0].1.get("a"), Some(&Value::Text(big)));

    // padding over-allocates the moved record, so a small further
    // growth fits in place.
    let doc4 = Doc::new().set("_id", 1_i64).set("a", "X".repeat(4200).as_str());
    let loc4 = store.update("c", loc3, &doc4, &ctx).unwrap();
    assert_eq!(loc4, loc3);
}

#[test]
fn test_unique_index_duplicate() {
    let (store, ctx) = setup("recstore-store-unique");
    store.create_collection("c", CollOpts::default(), &ctx).unwrap();
    store
        .create_index("c", "a_1", &Doc::new().set("a", 1_i64), true, false, &ctx)
        .unwrap();

    let loc = store.insert("c", &Doc::new().set("a", 7_i64), &ctx).unwrap();
    match store.insert("c", &Doc::new().set("a", 7_i64), &ctx) {
        Err(Error::DuplicateKey(_, _)) => (),
        res => panic!("unexpected {:?}", res.err()),
    }
    // the failed insert left nothing behind.
    let mut cur = store.scan("c", 1).unwrap();
    assert_eq!(drain(&store, &mut cur, &ctx).len(), 1);
    assert_eq!(store.validate("c").unwrap().indexes[0].1.n_used, 1);

    // an update colliding with another record fails before any index
    // is touched.
    let loc2 = store.insert("c", &Doc::new().set("a", 8_i64), &ctx).unwrap();
    match store.update("c", loc2, &Doc::new().set("a", 7_i64), &ctx) {
        Err(Error::DuplicateKey(_, _)) => (),
        res => panic!("unexpected {:?}", res.err()),
    }
    assert_eq!(int_of(&store.fetch(loc2).unwrap(), "a"), 8);

    // updating a record over its own key is not a duplicate.
    store.update("c", loc, &Doc::new().set("a", 7_i64).set("b", 1_i64), &ctx).unwrap();
}

#[test]
fn test_model_scan_equals_index() {
    let seed: u64 = random();
    println!("test_model_scan_equals_index {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let (store, ctx) = setup("recstore-store-model");
    store.create_collection("c", CollOpts::default(), &ctx).unwrap();
    store
        .create_index("c", "k_1", &Doc::new().set("k", 1_i64), false, false, &ctx)
        .unwrap();

    // reference model: locator -> key value.
    let mut model: BTreeMap<u64, i64> = BTreeMap::new();
    let mut live: Vec<DiskLoc> = vec![];

    for _ in 0..2000 {
        match rng.gen::<u8>() % 10 {
            // inserts dominate.
            0..=5 => {
                let k = rng.gen_range(-1000..1000_i64);
                let loc = store.insert("c", &Doc::new().set("k", k), &ctx).unwrap();
                model.insert(loc.as_u64(), k);
                live.push(loc);
            }
            6..=7 if !live.is_empty() => {
                let i = rng.gen_range(0..live.len());
                let loc = live.swap_remove(i);
                store.delete("c", loc, &ctx).unwrap();
                model.remove(&loc.as_u64());
            }
            _ if !live.is_empty() => {
                let i = rng.gen_range(0..live.len());
                let loc = live[i];
                let k = rng.gen_range(-1000..1000_i64);
                let new_loc = store.update("c", loc, &Doc::new().set("k", k), &ctx).unwrap();
                if new_loc != loc {
                    model.remove(&loc.as_u64());
                    live[i] = new_loc;
                }
                model.insert(new_loc.as_u64(), k);
            }
            _ => (),
        }
    }

    // table scan yields exactly the live locators.
    let mut cur = store.scan("c", 1).unwrap();
    let table: Vec<u64> = drain(&store, &mut cur, &ctx).iter().map(|(l, _)| l.as_u64()).collect();
    {
        let mut sorted = table.clone();
        sorted.sort_unstable();
        let expect: Vec<u64> = model.keys().cloned().collect();
        assert_eq!(sorted, expect);
    }

    // full index traversal reaches the same set, in key order.
    let mut cur = store.index_scan("c", "k_1", 1, None, None, true).unwrap();
    let indexed = drain(&store, &mut cur, &ctx);
    assert_eq!(indexed.len(), model.len());
    let mut prev = i64::MIN;
    for (loc, doc) in indexed.iter() {
        let k = int_of(doc, "k");
        assert!(k >= prev);
        prev = k;
        assert_eq!(model.get(&loc.as_u64()), Some(&k));
    }

    // structure stays sound under the whole history.
    store.validate("c").unwrap();
}

#[test]
fn test_multikey_index() {
    let (store, ctx) = setup("recstore-store-multikey");
    store.create_collection("c", CollOpts::default(), &ctx).unwrap();
    store
        .create_index("c", "tags_1", &Doc::new().set("tags", 1_i64), false, false, &ctx)
        .unwrap();

    let doc = Doc::new().set(
        "tags",
        Value::Array(vec![
            Value::Text("b".to_string()),
            Value::Text("a".to_string()),
            Value::Text("c".to_string()),
        ]),
    );
    let loc = store.insert("c", &doc, &ctx).unwrap();
    store.insert("c", &Doc::new().set("tags", "z"), &ctx).unwrap();

    // the index holds one slot per element...
    assert_eq!(store.validate("c").unwrap().indexes[0].1.n_used, 4);

    // ...but the cursor suppresses duplicate documents.
    let mut cur = store.index_scan("c", "tags_1", 1, None, None, true).unwrap();
    let got = drain(&store, &mut cur, &ctx);
    assert_eq!(got.len(), 2);
    assert_eq!(got[0].0, loc);

    // the raw cursor surfaces the duplicate signal instead.
    let mut cur = store.index_scan("c", "tags_1", 1, None, None, true).unwrap();
    let mut dups = 0;
    store.with_inner(|inner| {
        while let Some((_, dup)) = cur.advance(inner).unwrap() {
            if dup {
                dups += 1;
            }
        }
    });
    assert_eq!(dups, 2);
}

#[test]
fn test_capped_ring() {
    let (store, ctx) = setup("recstore-store-capped");
    let opts = CollOpts { capped: true, max_bytes: 64 * 1024, max_docs: 0 };
    store.create_collection("ring", opts, &ctx).unwrap();

    // updates that grow are refused outright.
    let loc = store.insert("ring", &Doc::new().set("i", 0_i64).set("pad", "x"), &ctx).unwrap();
    let bigger = Doc::new().set("i", 0_i64).set("pad", "x".repeat(500).as_str());
    match store.update("ring", loc, &bigger, &ctx) {
        Err(Error::CappedGrow(_, _)) => (),
        res => panic!("unexpected {:?}", res.err()),
    }
    // deletes are refused.
    assert!(store.delete("ring", loc, &ctx).is_err());

    // overflow the ring several times; the byte cap holds throughout
    // and the scan stays in insertion order.
    let payload = "p".repeat(200);
    for i in 1..2000_i64 {
        store
            .insert("ring", &Doc::new().set("i", i).set("pad", payload.as_str()), &ctx)
            .unwrap();
        if i % 500 == 0 {
            let stats = store.stats("ring").unwrap();
            assert!(stats.data_size <= 64 * 1024);
        }
    }

    let mut cur = store.scan("ring", 1).unwrap();
    let got: Vec<i64> = drain(&store, &mut cur, &ctx).iter().map(|(_, d)| int_of(d, "i")).collect();
    assert!(!got.is_empty());
    // oldest-to-newest, contiguous, ending at the last insert.
    for w in got.windows(2) {
        assert_eq!(w[1], w[0] + 1);
    }
    assert_eq!(*got.last().unwrap(), 1999);

    // reverse order mirrors it.
    let mut cur = store.scan("ring", -1).unwrap();
    let rev: Vec<i64> = drain(&store, &mut cur, &ctx).iter().map(|(_, d)| int_of(d, "i")).collect();
    let mut expect = got.clone();
    expect.reverse();
    assert_eq!(rev, expect);
}

#[test]
fn test_capped_doc_cap() {
    let (store, ctx) = setup("recstore-store-capdocs");
    let opts = CollOpts { capped: true, max_bytes: 256 * 1024, max_docs: 10 };
    store.create_collection("ring", opts, &ctx).unwrap();

    for i in 0..25_i64 {
        store.insert("ring", &Doc::new().set("i", i), &ctx).unwrap();
        assert!(store.stats("ring").unwrap().n_records <= 10);
    }
    let mut cur = store.scan("ring", 1).unwrap();
    let got: Vec<i64> = drain(&store, &mut cur, &ctx).iter().map(|(_, d)| int_of(d, "i")).collect();
    assert_eq!(got, (15..25).collect::<Vec<i64>>());
}

#[test]
fn test_capped_oversize_insert() {
    let (store, ctx) = setup("recstore-store-capbig");
    let opts = CollOpts { capped: true, max_bytes: 8 * 1024, max_docs: 0 };
    store.create_collection("ring", opts, &ctx).unwrap();

    let doc = Doc::new().set("p", "x".repeat(16 * 1024).as_str());
    match store.insert("ring", &doc, &ctx) {
        Err(Error::CappedOverflow(_, _)) => (),
        res => panic!("unexpected {:?}", res.err()),
    }
}

#[test]
fn test_create_index_over_existing_data() {
    let (store, ctx) = setup("recstore-store-bulk");
    store.create_collection("c", CollOpts::default(), &ctx).unwrap();

    let n = 5000_i64;
    for i in 0..n {
        store.insert("c", &Doc::new().set("k", (i * 37) % 1000), &ctx).unwrap();
    }
    store
        .create_index("c", "k_1", &Doc::new().set("k", 1_i64), false, false, &ctx)
        .unwrap();

    let stats = store.validate("c").unwrap();
    assert_eq!(stats.indexes[0].1.n_used, n as usize);

    let mut cur = store.index_scan("c", "k_1", 1, None, None, true).unwrap();
    let got = drain(&store, &mut cur, &ctx);
    assert_eq!(got.len(), n as usize);
    let mut prev = i64::MIN;
    for (_, doc) in got.iter() {
        let k = int_of(doc, "k");
        assert!(k >= prev);
        prev = k;
    }
}

#[test]
fn test_create_index_drop_dups() {
    let (store, ctx) = setup("recstore-store-dropdups");
    store.create_collection("c", CollOpts::default(), &ctx).unwrap();

    for k in [1_i64, 2, 2, 3, 3, 3].iter() {
        store.insert("c", &Doc::new().set("k", *k), &ctx).unwrap();
    }
    // without drop_dups the unique build fails and leaves no index.
    match store.create_index("c", "k_u", &Doc::new().set("k", 1_i64), true, false, &ctx) {
        Err(Error::DuplicateKey(_, _)) => (),
        res => panic!("unexpected {:?}", res.err()),
    }
    assert!(store.stats("c").unwrap().indexes.is_empty());

    // with drop_dups the collisions are deleted from the collection.
    store.create_index("c", "k_u", &Doc::new().set("k", 1_i64), true, true, &ctx).unwrap();
    let mut cur = store.scan("c", 1).unwrap();
    let mut got: Vec<i64> =
        drain(&store, &mut cur, &ctx).iter().map(|(_, d)| int_of(d, "k")).collect();
    got.sort_unstable();
    assert_eq!(got, vec![1, 2, 3]);
    store.validate("c").unwrap();
}

#[test]
fn test_interrupted_bulk_build() {
    let (store, ctx) = setup("recstore-store-intr");
    store.create_collection("c", CollOpts::default(), &ctx).unwrap();
    for i in 0..200_i64 {
        store.insert("c", &Doc::new().set("k", i), &ctx).unwrap();
    }

    ctx.kill();
    match store.create_index("c", "k_1", &Doc::new().set("k", 1_i64), false, false, &ctx) {
        Err(Error::Interrupted(_, _)) => (),
        res => panic!("unexpected {:?}", res.err()),
    }

    // the failed index is not listed, and no temp sort files remain.
    let fresh = Opctx::new();
    assert!(store.stats("c").unwrap().indexes.is_empty());
    let dir = std::path::PathBuf::from(&store.to_config().dir);
    for entry in std::fs::read_dir(&dir).unwrap() {
        let name = entry.unwrap().file_name().into_string().unwrap();
        assert!(!name.contains(".sort."), "leftover {}", name);
    }

    // the collection still works and the index can be built later.
    store.create_index("c", "k_1", &Doc::new().set("k", 1_i64), false, false, &fresh).unwrap();
    assert_eq!(store.validate("c").unwrap().indexes[0].1.n_used, 200);
}

#[test]
fn test_compact() {
    let (store, ctx) = setup("recstore-store-compact");
    store.create_collection("c", CollOpts::default(), &ctx).unwrap();
    store.create_index("c", "k_1", &Doc::new().set("k", 1_i64), false, false, &ctx).unwrap();

    let mut live = vec![];
    for i in 0..500_i64 {
        let loc = store.insert("c", &Doc::new().set("k", i).set("pad", "p".repeat(64).as_str()), &ctx).unwrap();
        live.push((loc, i));
    }
    // punch holes.
    for (loc, _) in live.iter().step_by(2) {
        store.delete("c", *loc, &ctx).unwrap();
    }
    let extents_before = store.stats("c").unwrap().n_extents;

    store.compact("c", &ctx).unwrap();

    let stats = store.stats("c").unwrap();
    assert_eq!(stats.n_records, 250);
    assert_eq!(stats.padding, 1.0);
    // the old extents went to the free pool.
    assert!(store.with_inner(|inner| {
        let desc_loc = inner.desc_loc(FREELIST_NS).unwrap();
        let desc = inner.load_desc(desc_loc).unwrap();
        !desc.first_extent.is_null()
    }));
    let _ = extents_before;

    // data and index agree after the rebuild.
    let mut cur = store.index_scan("c", "k_1", 1, None, None, true).unwrap();
    let got: Vec<i64> = drain(&store, &mut cur, &ctx).iter().map(|(_, d)| int_of(d, "k")).collect();
    assert_eq!(got, (0..500).filter(|k| k % 2 == 1).collect::<Vec<i64>>());
    store.validate("c").unwrap();

    // system namespaces refuse to compact.
    assert!(store.compact(NAMESPACES_NS, &ctx).is_err());
}

#[test]
fn test_index_scan_bounds() {
    let (store, ctx) = setup("recstore-store-bounds");
    store.create_collection("c", CollOpts::default(), &ctx).unwrap();
    store.create_index("c", "k_1", &Doc::new().set("k", 1_i64), false, false, &ctx).unwrap();
    for i in 0..100_i64 {
        store.insert("c", &Doc::new().set("k", i), &ctx).unwrap();
    }

    let range = |dir: i8, start: Option<i64>, end: Option<i64>, incl: bool| -> Vec<i64> {
        let start = start.map(|x| vec![Value::Integer(x)]);
        let end = end.map(|x| vec![Value::Integer(x)]);
        let mut cur = store.index_scan("c", "k_1", dir, start, end, incl).unwrap();
        drain(&store, &mut cur, &ctx).iter().map(|(_, d)| int_of(d, "k")).collect()
    };

    assert_eq!(range(1, Some(10), Some(20), true), (10..=20).collect::<Vec<i64>>());
    assert_eq!(range(1, Some(10), Some(20), false), (10..20).collect::<Vec<i64>>());
    assert_eq!(range(1, None, Some(5), true), (0..=5).collect::<Vec<i64>>());
    assert_eq!(range(1, Some(95), None, true), (95..100).collect::<Vec<i64>>());

    let mut expect: Vec<i64> = (10..=20).collect();
    expect.reverse();
    assert_eq!(range(-1, Some(20), Some(10), true), expect);
    let mut expect: Vec<i64> = (11..=20).collect();
    expect.reverse();
    assert_eq!(range(-1, Some(20), Some(10), false), expect);
}

#[derive(Clone, Debug, Arbitrary)]
enum Op {
    Insert(i16),
    Update(u8, i16),
    Delete(u8),
    Fetch(u8),
    Scan,
    Validate,
}

// teacher-style op soup: every public entry point, driven by arbitrary
// bytes, checked against a BTreeMap model at the end.
#[test]
fn test_arbitrary_ops() {
    let seed: u64 = random();
    println!("test_arbitrary_ops {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let (store, ctx) = setup("recstore-store-arbops");
    store.create_collection("c", CollOpts::default(), &ctx).unwrap();
    store.create_index("c", "k_1", &Doc::new().set("k", 1_i64), false, false, &ctx).unwrap();

    let mut model: BTreeMap<u64, i64> = BTreeMap::new();
    let mut live: Vec<DiskLoc> = vec![];
    let mut counts = [0_usize; 6];

    for _i in 0..800 {
        let bytes = rng.gen::<[u8; 8]>();
        let mut uns = Unstructured::new(&bytes);
        let op: Op = uns.arbitrary().unwrap();
        match op {
            Op::Insert(k) => {
                counts[0] += 1;
                let k = i64::from(k);
                let loc = store.insert("c", &Doc::new().set("k", k), &ctx).unwrap();
                model.insert(loc.as_u64(), k);
                live.push(loc);
            }
            Op::Update(i, k) if !live.is_empty() => {
                counts[1] += 1;
                let i = i as usize % live.len();
                let k = i64::from(k);
                let loc = live[i];
                let new_loc = store.update("c", loc, &Doc::new().set("k", k), &ctx).unwrap();
                if new_loc != loc {
                    model.remove(&loc.as_u64());
                    live[i] = new_loc;
                }
                model.insert(new_loc.as_u64(), k);
            }
            Op::Delete(i) if !live.is_empty() => {
                counts[2] += 1;
                let i = i as usize % live.len();
                let loc = live.swap_remove(i);
                store.delete("c", loc, &ctx).unwrap();
                model.remove(&loc.as_u64());
            }
            Op::Fetch(i) if !live.is_empty() => {
                counts[3] += 1;
                let i = i as usize % live.len();
                let doc = store.fetch(live[i]).unwrap();
                assert_eq!(int_of(&doc, "k"), model[&live[i].as_u64()]);
            }
            Op::Scan => {
                counts[4] += 1;
                let mut cur = store.scan("c", 1).unwrap();
                let got = drain(&store, &mut cur, &ctx);
                assert_eq!(got.len(), model.len());
            }
            Op::Validate => {
                counts[5] += 1;
                store.validate("c").unwrap();
            }
            _ => (),
        }
    }
    println!("test_arbitrary_ops counts {:?}", counts);

    let mut cur = store.index_scan("c", "k_1", 1, None, None, true).unwrap();
    let indexed = drain(&store, &mut cur, &ctx);
    assert_eq!(indexed.len(), model.len());
    for (loc, doc) in indexed.iter() {
        assert_eq!(model.get(&loc.as_u64()), Some(&int_of(doc, "k")));
    }
    store.validate("c").unwrap();
}

#[test]
fn test_commit_now() {
    let (store, ctx) = setup("recstore-store-commit");
    store.create_collection("c", CollOpts::default(), &ctx).unwrap();
    store.insert("c", &Doc::new().set("x", 1_i64), &ctx).unwrap();
    store.commit_now().unwrap();
    store.commit_now().unwrap();
}
