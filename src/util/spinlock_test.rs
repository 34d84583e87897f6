use std::{sync::Arc, thread};

use super::*;

#[test]
fn test_spinlock_exclusion() {
    let spin = Arc::new(Spinlock::new(0_u64));
    let n_threads = 8;
    let n_incrs = 10_000;

    let mut handles = vec![];
    for _ in 0..n_threads {
        let spin = Arc::clone(&spin);
        handles.push(thread::spawn(move || {
            for _ in 0..n_incrs {
                let mut w = spin.write();
                *w += 1;
            }
        }));
    }
    for handle in handles.into_iter() {
        handle.join().unwrap();
    }

    assert_eq!(*spin.read(), n_threads * n_incrs);
    let stats = spin.to_stats();
    println!("test_spinlock_exclusion {}", stats);
    assert_eq!(stats.latchlock, 0);
    assert_eq!(u64::from(stats.n_writes), n_threads * n_incrs);
}

#[test]
fn test_spinlock_readers() {
    let spin = Arc::new(Spinlock::new(10_u32));
    let mut handles = vec![];
    for _ in 0..4 {
        let spin = Arc::clone(&spin);
        handles.push(thread::spawn(move || {
            for _ in 0..1000 {
                assert_eq!(*spin.read() % 2, 0);
            }
        }));
    }
    for _ in 0..1000 {
        let mut w = spin.write();
        *w += 2;
    }
    for handle in handles.into_iter() {
        handle.join().unwrap();
    }
    assert_eq!(*spin.read(), 10 + 2000);
}
