use super::*;

use crate::{
    btree::IndexKey,
    ctx::Opctx,
    doc::{Doc, Value},
    store::{CollOpts, Config, Store},
};

fn setup(name: &str) -> (Store, Opctx) {
    let dir = std::env::temp_dir().join(name);
    std::fs::remove_dir_all(&dir).ok();
    let mut config = Config::new(dir.as_os_str(), "t");
    config.set_file_size(4 * 1024 * 1024, 32 * 1024 * 1024);
    let store = Store::create(config).unwrap();
    let ctx = Opctx::new();
    store.create_collection("c", CollOpts::default(), &ctx).unwrap();
    (store, ctx)
}

fn ints(store: &Store, cur: &mut Cursor, ctx: &Opctx, field: &str) -> Vec<i64> {
    let mut out = vec![];
    while let Some((_, doc)) = store.cursor_next(cur, ctx).unwrap() {
        match doc.get(field) {
            Some(Value::Integer(x)) => out.push(*x),
            v => panic!("field {:?} = {:?}", field, v),
        }
    }
    out
}

#[test]
fn test_table_scan_directions() {
    let (store, ctx) = setup("recstore-cursor-table");
    for i in 0..300_i64 {
        store.insert("c", &Doc::new().set("i", i), &ctx).unwrap();
    }

    let mut cur = store.scan("c", 1).unwrap();
    assert_eq!(ints(&store, &mut cur, &ctx, "i"), (0..300).collect::<Vec<i64>>());
    // exhausted cursors stay exhausted.
    assert!(store.cursor_next(&mut cur, &ctx).unwrap().is_none());

    let mut cur = store.scan("c", -1).unwrap();
    let mut expect: Vec<i64> = (0..300).collect();
    expect.reverse();
    assert_eq!(ints(&store, &mut cur, &ctx, "i"), expect);

    // empty collection scans cleanly.
    store.create_collection("empty", CollOpts::default(), &ctx).unwrap();
    let mut cur = store.scan("empty", 1).unwrap();
    assert!(store.cursor_next(&mut cur, &ctx).unwrap().is_none());
}

#[test]
fn test_table_scan_spans_extents() {
    let (store, ctx) = setup("recstore-cursor-extents");
    // large-ish payloads force several extents.
    let pad = "p".repeat(512);
    for i in 0..500_i64 {
        store.insert("c", &Doc::new().set("i", i).set("pad", pad.as_str()), &ctx).unwrap();
    }
    assert!(store.stats("c").unwrap().n_extents >= 2);

    let mut cur = store.scan("c", 1).unwrap();
    assert_eq!(ints(&store, &mut cur, &ctx, "i"), (0..500).collect::<Vec<i64>>());
}

#[test]
fn test_delete_under_table_cursor() {
    let (store, ctx) = setup("recstore-cursor-del");
    let mut locs = vec![];
    for i in 0..10_i64 {
        locs.push(store.insert("c", &Doc::new().set("i", i), &ctx).unwrap());
    }

    let mut cur = store.scan("c", 1).unwrap();
    // yield 0, 1, 2.
    for expect in 0..3_i64 {
        let (_, doc) = store.cursor_next(&mut cur, &ctx).unwrap().unwrap();
        assert_eq!(doc.get("i"), Some(&Value::Integer(expect)));
    }
    // the cursor rests on record 2; deleting it advances the cursor
    // before the slot vanishes.
    store.delete("c", locs[2], &ctx).unwrap();
    let (_, doc) = store.cursor_next(&mut cur, &ctx).unwrap().unwrap();
    assert_eq!(doc.get("i"), Some(&Value::Integer(3)));

    // deleting a record ahead of the cursor simply drops it from the
    // stream.
    store.delete("c", locs[5], &ctx).unwrap();
    let rest = ints(&store, &mut cur, &ctx, "i");
    assert_eq!(rest, vec![4, 6, 7, 8, 9]);
}

#[test]
fn test_index_cursor_survives_split() {
    let (store, ctx) = setup("recstore-cursor-split");
    store.create_index("c", "k_1", &Doc::new().set("k", 1_i64), false, false, &ctx).unwrap();

    // keys spaced by 10 so new keys fit between; enough of them that
    // one bucket holds the whole range and sits near full.
    for i in 0..200_i64 {
        store.insert("c", &Doc::new().set("k", i * 10), &ctx).unwrap();
    }

    let mut cur = store.index_scan("c", "k_1", 1, None, None, true).unwrap();
    // walk to key 500.
    loop {
        let (_, doc) = store.cursor_next(&mut cur, &ctx).unwrap().unwrap();
        if doc.get("k") == Some(&Value::Integer(500)) {
            break;
        }
    }

    // a burst of inserts between 500 and 510 splits buckets under the
    // cursor's feet.
    for j in 0..30_i64 {
        store.insert("c", &Doc::new().set("k", 501 + (j % 9)), &ctx).unwrap();
    }
    for i in 200..400_i64 {
        store.insert("c", &Doc::new().set("k", i * 10), &ctx).unwrap();
    }

    // the cursor neither repeats 500 nor skips 510.
    let rest = ints(&store, &mut cur, &ctx, "k");
    assert!(!rest.contains(&500));
    assert!(rest.contains(&510));
    assert!(rest.contains(&3990));
    let mut sorted = rest.clone();
    sorted.sort_unstable();
    assert_eq!(rest, sorted);
}

#[test]
fn test_index_cursor_survives_bucket_dealloc() {
    let (store, ctx) = setup("recstore-cursor-dealloc");
    store.create_index("c", "k_1", &Doc::new().set("k", 1_i64), false, false, &ctx).unwrap();

    let mut locs = vec![];
    for i in 0..600_i64 {
        locs.push(store.insert("c", &Doc::new().set("k", i), &ctx).unwrap());
    }

    let mut cur = store.index_scan("c", "k_1", 1, None, None, true).unwrap();
    let (_, doc) = store.cursor_next(&mut cur, &ctx).unwrap().unwrap();
    assert_eq!(doc.get("k"), Some(&Value::Integer(0)));

    // delete everything the leftmost leaf holds except key 0 is gone
    // too -- the leaf collapses while the cursor rests inside it.
    for loc in locs[0..250].iter() {
        store.delete("c", *loc, &ctx).unwrap();
    }

    // the cursor re-seeks from its saved key and carries on.
    let rest = ints(&store, &mut cur, &ctx, "k");
    assert_eq!(rest, (250..600).collect::<Vec<i64>>());
}

#[test]
fn test_multi_interval_scan() {
    let (store, ctx) = setup("recstore-cursor-multi");
    store.create_index("c", "k_1", &Doc::new().set("k", 1_i64), false, false, &ctx).unwrap();
    for i in 0..100_i64 {
        store.insert("c", &Doc::new().set("k", i), &ctx).unwrap();
    }

    let iv = |lo: i64, hi: i64, incl: bool| Interval {
        start: IndexKey::encode(&[Value::Integer(lo)]).unwrap().as_bytes().to_vec(),
        end: IndexKey::encode(&[Value::Integer(hi)]).unwrap().as_bytes().to_vec(),
        end_inclusive: incl,
    };

    // three intervals, supplied in scan direction.
    let mut cur = store
        .index_scan_intervals("c", "k_1", 1, vec![iv(5, 8, true), iv(40, 42, false), iv(90, 95, true)])
        .unwrap();
    let got = ints(&store, &mut cur, &ctx, "k");
    assert_eq!(got, vec![5, 6, 7, 8, 40, 41, 90, 91, 92, 93, 94, 95]);

    // an empty middle interval is skipped.
    let mut cur = store
        .index_scan_intervals("c", "k_1", 1, vec![iv(5, 6, true), iv(200, 300, true)])
        .unwrap();
    let got = ints(&store, &mut cur, &ctx, "k");
    assert_eq!(got, vec![5, 6]);
}

#[test]
fn test_cursor_batch_with_yield_hint() {
    let (store, ctx) = setup("recstore-cursor-batch");
    for i in 0..50_i64 {
        store.insert("c", &Doc::new().set("i", i), &ctx).unwrap();
    }

    let mut cur = store.scan("c", 1).unwrap();
    ctx.request_yield();
    let batch = store.cursor_next_batch(&mut cur, 20, &ctx).unwrap();
    assert_eq!(batch.len(), 20);
    ctx.request_yield();
    let batch = store.cursor_next_batch(&mut cur, 100, &ctx).unwrap();
    assert_eq!(batch.len(), 30);
}

#[test]
fn test_cursor_killed_by_drop_collection() {
    let (store, ctx) = setup("recstore-cursor-kill");
    for i in 0..10_i64 {
        store.insert("c", &Doc::new().set("i", i), &ctx).unwrap();
    }
    let mut cur = store.scan("c", 1).unwrap();
    store.cursor_next(&mut cur, &ctx).unwrap().unwrap();

    store.drop_collection("c", &ctx).unwrap();
    // position lost: the cursor reports exhaustion, the caller
    // re-queries.
    assert!(store.cursor_next(&mut cur, &ctx).unwrap().is_none());
}

#[test]
fn test_interrupted_cursor() {
    let (store, ctx) = setup("recstore-cursor-intr");
    for i in 0..10_i64 {
        store.insert("c", &Doc::new().set("i", i), &ctx).unwrap();
    }
    let mut cur = store.scan("c", 1).unwrap();
    store.cursor_next(&mut cur, &ctx).unwrap().unwrap();
    ctx.kill();
    match store.cursor_next(&mut cur, &ctx) {
        Err(Error::Interrupted(_, _)) => (),
        res => panic!("unexpected {:?}", res.err()),
    }
}
