//! Zone worker threads running alongside a dispatcher that triages
//! sampled names.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use claudefs_index::{ChunkName, MasterIndex};
use common::{init_tracing, names, small_config, NONCE};

const ZONES: u32 = 4;
const CHAPTERS: u64 = 40;

fn names_by_zone(index: &MasterIndex, names: &[ChunkName]) -> Vec<Vec<ChunkName>> {
    let mut by_zone = vec![Vec::new(); ZONES as usize];
    for name in names {
        by_zone[index.get_zone(name) as usize].push(*name);
    }
    by_zone
}

#[test]
fn test_dispatcher_sees_consistent_chapters() {
    init_tracing();
    let index = Arc::new(MasterIndex::new(&small_config(), ZONES, NONCE).unwrap());
    let all = names(1200);
    let samples: Vec<ChunkName> = all.iter().copied().filter(|n| index.is_sample(n)).collect();
    assert!(!samples.is_empty());
    let by_zone = names_by_zone(&index, &all);

    let published: Arc<Vec<AtomicU64>> = Arc::new((0..ZONES).map(|_| AtomicU64::new(0)).collect());
    let done = Arc::new(AtomicBool::new(false));

    let owners: Vec<_> = by_zone
        .into_iter()
        .enumerate()
        .map(|(zone, zone_names)| {
            let index = Arc::clone(&index);
            let published = Arc::clone(&published);
            thread::spawn(move || {
                let zone = zone as u32;
                for chapter in 1..=CHAPTERS {
                    index.set_zone_open_chapter(zone, chapter).unwrap();
                    published[zone as usize].store(chapter, Ordering::SeqCst);
                    for name in &zone_names {
                        let record = index.get_record(name).unwrap();
                        assert_eq!(record.zone(), zone);
                        if record.is_found() {
                            record.set_chapter(chapter).unwrap();
                        } else {
                            record.put(chapter).unwrap();
                        }
                    }
                }
            })
        })
        .collect();

    let dispatcher = {
        let index = Arc::clone(&index);
        let published = Arc::clone(&published);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut lookups = 0u64;
            while !done.load(Ordering::SeqCst) {
                for name in &samples {
                    let zone = index.get_zone(name) as usize;
                    let before = published[zone].load(Ordering::SeqCst);
                    let triage = index.lookup_name(name).unwrap();
                    let after = published[zone].load(Ordering::SeqCst);
                    assert!(triage.is_sample);
                    assert_eq!(triage.zone as usize, zone);
                    if let Some(chapter) = triage.virtual_chapter {
                        assert!(triage.in_sampled_chapter);
                        assert!(
                            chapter + 1 >= before && chapter <= after,
                            "chapter {} outside {}..={}",
                            chapter,
                            before,
                            after
                        );
                    }
                    lookups += 1;
                }
            }
            lookups
        })
    };

    for owner in owners {
        owner.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    assert!(dispatcher.join().unwrap() > 0);

    for zone in 0..ZONES {
        assert_eq!(index.zone_open_chapter(zone).unwrap(), CHAPTERS);
    }
    for name in &all {
        let record = index.get_record(name).unwrap();
        assert!(record.is_found());
        assert_eq!(record.virtual_chapter(), CHAPTERS);
    }
    let stats = index.stats();
    assert_eq!(stats.dense.record_count + stats.sparse.record_count, all.len() as u64);
}

#[test]
fn test_zones_are_independent() {
    let index = Arc::new(MasterIndex::new(&small_config(), ZONES, NONCE).unwrap());
    let all = names(400);
    let sample = all
        .iter()
        .copied()
        .find(|n| index.is_sample(n))
        .unwrap();
    let held_zone = index.get_zone(&sample);
    let record = index.get_record(&sample).unwrap();
    assert!(record.holds_zone_lock());

    // Other zones keep moving while one zone's lock is held.
    let other = Arc::clone(&index);
    thread::spawn(move || {
        for zone in (0..ZONES).filter(|z| *z != held_zone) {
            other.set_zone_open_chapter(zone, 3).unwrap();
        }
    })
    .join()
    .unwrap();

    record.release();
    for zone in (0..ZONES).filter(|z| *z != held_zone) {
        assert_eq!(index.zone_open_chapter(zone).unwrap(), 3);
    }
    assert_eq!(index.zone_open_chapter(held_zone).unwrap(), 0);
}

#[test]
fn test_held_record_blocks_other_threads_until_released() {
    let index = Arc::new(MasterIndex::new(&small_config(), 1, NONCE).unwrap());
    let sample = names(400)
        .into_iter()
        .find(|n| index.is_sample(n))
        .unwrap();
    index.set_open_chapter(1).unwrap();

    let record = index.get_record(&sample).unwrap();
    let advanced = Arc::new(AtomicBool::new(false));
    let waiter = {
        let index = Arc::clone(&index);
        let advanced = Arc::clone(&advanced);
        thread::spawn(move || {
            index.set_zone_open_chapter(0, 2).unwrap();
            advanced.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(std::time::Duration::from_millis(50));
    assert!(!advanced.load(Ordering::SeqCst));
    record.put(1).unwrap();
    waiter.join().unwrap();
    assert!(advanced.load(Ordering::SeqCst));
    assert_eq!(index.zone_open_chapter(0).unwrap(), 2);
}
