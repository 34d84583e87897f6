use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;
use crate::btree::key::KeyOrder;
use crate::doc::Value;

fn order() -> KeyOrder {
    KeyOrder::new(vec![("x".to_string(), 1)]).unwrap()
}

fn temp_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(name);
    std::fs::remove_dir_all(&dir).ok();
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn key_of(x: i64) -> IndexKey {
    IndexKey::encode(&[Value::Integer(x)]).unwrap()
}

#[test]
fn test_sort_in_memory() {
    let seed: u64 = random();
    println!("test_sort_in_memory {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let dir = temp_dir("recstore-sort-mem");
    let ctx = Opctx::new();
    let mut sorter = ExtSorter::new(&dir, "mem", order(), SORT_BUDGET);

    let mut expect: Vec<i64> = (0..1000).map(|_| rng.gen_range(-500..500)).collect();
    for (i, x) in expect.iter().enumerate() {
        sorter.add(key_of(*x), DiskLoc::new(0, (i as u32) * 8), &ctx).unwrap();
    }
    expect.sort_unstable();

    let got: Vec<i64> = sorter
        .done(&ctx)
        .unwrap()
        .map(|item| match item.unwrap().0.to_values(1).unwrap().remove(0) {
            Value::Integer(x) => x,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(got, expect);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_sort_spill_and_merge() {
    let seed: u64 = random();
    println!("test_sort_spill_and_merge {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let dir = temp_dir("recstore-sort-spill");
    let ctx = Opctx::new();
    // tiny budget forces many runs.
    let mut sorter = ExtSorter::new(&dir, "spill", order(), 512);

    let mut expect: Vec<(i64, u32)> = vec![];
    for i in 0..5000_u32 {
        let x = rng.gen_range(-1000..1000);
        expect.push((x, i * 8));
        sorter.add(key_of(x), DiskLoc::new(0, i * 8), &ctx).unwrap();
    }
    expect.sort_unstable();

    let got: Vec<(i64, u32)> = sorter
        .done(&ctx)
        .unwrap()
        .map(|item| {
            let (key, loc) = item.unwrap();
            match key.to_values(1).unwrap().remove(0) {
                Value::Integer(x) => (x, loc.ofs),
                _ => unreachable!(),
            }
        })
        .collect();
    assert_eq!(got, expect);

    // run files are gone once the merge iterator drops.
    let leftovers = std::fs::read_dir(&dir).unwrap().count();
    assert_eq!(leftovers, 0);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_sort_duplicate_keys_locator_order() {
    let dir = temp_dir("recstore-sort-dups");
    let ctx = Opctx::new();
    let mut sorter = ExtSorter::new(&dir, "dups", order(), 256);

    for ofs in [0x300_u32, 0x100, 0x200].iter() {
        sorter.add(key_of(7), DiskLoc::new(0, *ofs), &ctx).unwrap();
    }
    let got: Vec<u32> =
        sorter.done(&ctx).unwrap().map(|item| item.unwrap().1.ofs).collect();
    // equal keys come out in locator order.
    assert_eq!(got, vec![0x100, 0x200, 0x300]);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_sort_interrupt() {
    let dir = temp_dir("recstore-sort-intr");
    let ctx = Opctx::new();
    let mut sorter = ExtSorter::new(&dir, "intr", order(), 128);

    for i in 0..10_u32 {
        sorter.add(key_of(i64::from(i)), DiskLoc::new(0, i * 8), &ctx).unwrap();
    }
    ctx.kill();
    match sorter.done(&ctx) {
        Err(Error::Interrupted(_, _)) => (),
        res => panic!("unexpected {:?}", res.err()),
    }
    // the sorter's drop unlinked its runs.
    let leftovers = std::fs::read_dir(&dir).unwrap().count();
    assert_eq!(leftovers, 0);
    std::fs::remove_dir_all(&dir).ok();
}
