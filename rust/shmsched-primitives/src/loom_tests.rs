#![cfg(all(test, loom))]

use crate::offset_list::{FixedSlots, LIST_END, ListHead, OffsetList};
use crate::region::HeapRegion;
use crate::sync::thread;
use alloc::vec::Vec;
use loom::sync::Arc;

const BASE: usize = 64;
const SLOT: u32 = 64;

struct Fixture {
    _owner: HeapRegion,
    slots: FixedSlots,
    free: ListHead,
    active: ListHead,
}

impl Fixture {
    fn new(count: u32) -> Arc<Self> {
        let owner = HeapRegion::new_zeroed(BASE + (SLOT * count) as usize);
        let slots = FixedSlots::new(owner.region(), BASE, SLOT, count);
        let free = ListHead::new(LIST_END);
        unsafe { slots.chain_all(&free) };
        Arc::new(Self {
            _owner: owner,
            slots,
            free,
            active: ListHead::new(LIST_END),
        })
    }

    fn free(&self) -> OffsetList<'_, FixedSlots> {
        OffsetList::new(&self.free, &self.slots)
    }

    fn active(&self) -> OffsetList<'_, FixedSlots> {
        OffsetList::new(&self.active, &self.slots)
    }
}

#[test]
fn concurrent_pops_never_share_a_node() {
    loom::model(|| {
        let fx = Fixture::new(2);

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let fx = fx.clone();
                thread::spawn(move || fx.free().pop())
            })
            .collect();

        let mut got: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(got.len(), 2);
        got.sort();
        got.dedup();
        assert_eq!(got.len(), 2);
        assert!(fx.free().is_empty());
    });
}

#[test]
fn concurrent_pushes_are_not_lost() {
    loom::model(|| {
        let fx = Fixture::new(2);
        let a = fx.free().pop().unwrap();
        let b = fx.free().pop().unwrap();

        let t1 = thread::spawn({
            let fx = fx.clone();
            move || fx.active().push(a)
        });
        let t2 = thread::spawn({
            let fx = fx.clone();
            move || fx.active().push(b)
        });
        t1.join().unwrap();
        t2.join().unwrap();

        let mut seen: Vec<_> = fx.active().iter().collect();
        seen.sort();
        assert_eq!(seen, [a, b]);
    });
}

/// One thread pops and re-pushes the head while another pops twice.
/// An untagged head would let the first pop install a link that is no
/// longer valid.
#[test]
fn pop_repush_aba() {
    loom::model(|| {
        let fx = Fixture::new(3);

        let t1 = thread::spawn({
            let fx = fx.clone();
            move || {
                if let Some(node) = fx.free().pop() {
                    thread::yield_now();
                    fx.free().push(node);
                }
            }
        });

        let t2 = thread::spawn({
            let fx = fx.clone();
            move || {
                let mut held = Vec::new();
                for _ in 0..2 {
                    if let Some(node) = fx.free().pop() {
                        held.push(node);
                    }
                }
                for node in held.into_iter().rev() {
                    fx.free().push(node);
                }
            }
        });

        t1.join().unwrap();
        t2.join().unwrap();

        let mut seen: Vec<_> = fx.free().iter().collect();
        seen.sort();
        let all: Vec<_> = fx.slots.offsets().collect();
        assert_eq!(seen, all);
    });
}

#[test]
fn enqueue_while_walking() {
    loom::model(|| {
        let fx = Fixture::new(2);
        let first = fx.free().pop().unwrap();
        fx.active().push(first);

        let producer = thread::spawn({
            let fx = fx.clone();
            move || {
                if let Some(node) = fx.free().pop() {
                    fx.active().push(node);
                }
            }
        });

        let walked: Vec<_> = fx.active().iter().collect();
        assert!(walked.contains(&first));
        assert!(walked.len() <= 2);

        producer.join().unwrap();
        assert_eq!(fx.active().len(), 2);
    });
}
