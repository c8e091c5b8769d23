//! Lock-free singly linked lists threaded through a shared region.
//!
//! Nodes are addressed by [`Offset`] rather than pointer, so a list built by
//! one process can be walked and modified by any other process that maps the
//! same memory. The head word packs the first node's offset (low 32 bits)
//! with a tag (high 32 bits) that changes on every successful update, which
//! keeps a pop that raced with a pop/push pair from installing a stale link.

use core::mem::size_of;

use crate::region::{Offset, Region};
use crate::sync::{AtomicU32, AtomicU64, Ordering, spin_loop};

/// Offset stored in a link word to terminate a list.
pub const LIST_END: Offset = Offset::NULL;

/// Head of an offset list: first node plus ABA tag in one 64-bit word.
#[repr(transparent)]
pub struct ListHead {
    packed: AtomicU64,
}

#[cfg(not(loom))]
const _: () = assert!(size_of::<ListHead>() == 8);

impl ListHead {
    pub fn new(first: Offset) -> Self {
        Self {
            packed: AtomicU64::new(pack_head(first, 0)),
        }
    }

    /// Resets the head to `first` with a fresh tag.
    ///
    /// Only valid while no other party can be using the list.
    pub fn reset(&self, first: Offset) {
        self.packed.store(pack_head(first, 0), Ordering::Release);
    }

    /// Returns the first node, or [`LIST_END`] for an empty list.
    #[inline]
    pub fn first(&self) -> Offset {
        unpack_head(self.packed.load(Ordering::Acquire)).0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.first().is_null()
    }

    /// Current tag, for diagnostics.
    pub fn tag(&self) -> u32 {
        unpack_head(self.packed.load(Ordering::Acquire)).1
    }
}

/// Access to the link word of each node in a list.
///
/// Implementors own the mapping from node offset to link storage; the list
/// itself only ever sees offsets.
pub trait OffsetLinks {
    /// Returns the successor of `node`, or [`LIST_END`].
    fn next(&self, node: Offset) -> Offset;

    /// Points `node` at `next`.
    fn set_next(&self, node: Offset, next: Offset);

    /// Upper bound on the number of nodes any list over these links holds.
    fn capacity(&self) -> u32;
}

/// A list view: a head plus the links its nodes are chained through.
pub struct OffsetList<'a, L: ?Sized> {
    head: &'a ListHead,
    links: &'a L,
}

impl<'a, L: OffsetLinks + ?Sized> OffsetList<'a, L> {
    pub fn new(head: &'a ListHead, links: &'a L) -> Self {
        Self { head, links }
    }

    /// Pushes `node` onto the front of the list.
    ///
    /// The caller must own `node` exclusively: it must not be on any list.
    pub fn push(&self, node: Offset) {
        debug_assert!(!node.is_null(), "cannot push the null offset");

        loop {
            let old = self.head.packed.load(Ordering::Acquire);
            let (first, tag) = unpack_head(old);

            self.links.set_next(node, first);

            let new = pack_head(node, tag.wrapping_add(1));
            if self
                .head
                .packed
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }

            spin_loop();
        }
    }

    /// Detaches and returns the first node, or `None` if the list is empty.
    pub fn pop(&self) -> Option<Offset> {
        loop {
            let old = self.head.packed.load(Ordering::Acquire);
            let (first, tag) = unpack_head(old);

            if first.is_null() {
                return None;
            }

            // May be stale if `first` was popped and re-pushed meanwhile; the
            // tag comparison below rejects the exchange in that case.
            let next = self.links.next(first);

            let new = pack_head(next, tag.wrapping_add(1));
            if self
                .head
                .packed
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(first);
            }

            spin_loop();
        }
    }

    /// Walks the list from the current head.
    ///
    /// Safe against concurrent pushes (new nodes are simply not seen). On a
    /// list that is also popped from, a walk can observe nodes that have
    /// since been detached; the walk is bounded by the link capacity either
    /// way.
    pub fn iter(&self) -> Iter<'a, L> {
        Iter {
            links: self.links,
            current: self.head.first(),
            remaining: self.links.capacity(),
        }
    }

    /// Approximate number of nodes on the list.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_empty()
    }
}

/// Iterator over node offsets, see [`OffsetList::iter`].
pub struct Iter<'a, L: ?Sized> {
    links: &'a L,
    current: Offset,
    remaining: u32,
}

impl<L: OffsetLinks + ?Sized> Iterator for Iter<'_, L> {
    type Item = Offset;

    fn next(&mut self) -> Option<Offset> {
        if self.current.is_null() || self.remaining == 0 {
            return None;
        }
        let node = self.current;
        self.current = self.links.next(node);
        self.remaining -= 1;
        Some(node)
    }
}

/// A run of equally sized slots inside a region, each starting with a
/// 32-bit link word.
///
/// Slot `i` lives at `base + i * slot_size`. `base` must be non-zero so that
/// no slot sits at the null offset.
#[derive(Clone, Copy)]
pub struct FixedSlots {
    region: Region,
    base: u32,
    slot_size: u32,
    slot_count: u32,
}

impl FixedSlots {
    /// Describe `slot_count` slots of `slot_size` bytes starting at `base`.
    ///
    /// Panics if the slots do not fit the region, overflow 32-bit offsets,
    /// or would place a slot at offset zero.
    pub fn new(region: Region, base: usize, slot_size: u32, slot_count: u32) -> Self {
        assert!(base > 0, "slots cannot start at the null offset");
        assert!(
            slot_size as usize >= size_of::<u32>() && slot_size.is_multiple_of(4),
            "slot_size must be a non-zero multiple of 4"
        );
        assert!(base.is_multiple_of(4), "base must be 4-byte aligned");
        let end = Self::required_size(base, slot_size, slot_count);
        assert!(
            end.is_some_and(|end| end <= region.len() && end <= u32::MAX as usize),
            "slots do not fit the region"
        );

        Self {
            region,
            base: base as u32,
            slot_size,
            slot_count,
        }
    }

    /// Bytes needed to hold the slots, counted from the region start.
    pub fn required_size(base: usize, slot_size: u32, slot_count: u32) -> Option<usize> {
        (slot_size as usize)
            .checked_mul(slot_count as usize)?
            .checked_add(base)
    }

    #[inline]
    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    #[inline]
    pub fn slot_size(&self) -> u32 {
        self.slot_size
    }

    #[inline]
    pub fn region(&self) -> Region {
        self.region
    }

    /// Offset of slot `index`.
    pub fn slot(&self, index: u32) -> Option<Offset> {
        (index < self.slot_count).then(|| Offset::new(self.base + index * self.slot_size))
    }

    /// Index of the slot starting at `node`, if `node` is a slot boundary.
    pub fn index_of(&self, node: Offset) -> Option<u32> {
        let rel = node.get().checked_sub(self.base)?;
        if !rel.is_multiple_of(self.slot_size) {
            return None;
        }
        let index = rel / self.slot_size;
        (index < self.slot_count).then_some(index)
    }

    #[inline]
    pub fn contains(&self, node: Offset) -> bool {
        self.index_of(node).is_some()
    }

    /// Offsets of every slot, in index order.
    pub fn offsets(&self) -> impl Iterator<Item = Offset> + '_ {
        (0..self.slot_count).filter_map(move |index| self.slot(index))
    }

    /// Chains every slot into one list and installs it at `head`.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the slots and `head`.
    pub unsafe fn chain_all(&self, head: &ListHead) {
        for index in 0..self.slot_count {
            let next = self.slot(index + 1).unwrap_or(LIST_END);
            let at = self.base as usize + (index * self.slot_size) as usize;
            unsafe {
                core::ptr::write(self.region.offset(at) as *mut AtomicU32, AtomicU32::new(next.get()));
            }
        }
        head.reset(self.slot(0).unwrap_or(LIST_END));
    }

    fn link(&self, node: Offset) -> Option<&AtomicU32> {
        self.contains(node)
            .then(|| unsafe { self.region.get::<AtomicU32>(node.as_usize()) })
    }
}

impl OffsetLinks for FixedSlots {
    fn next(&self, node: Offset) -> Offset {
        let Some(link) = self.link(node) else {
            debug_assert!(false, "next() on non-slot offset {node:?}");
            return LIST_END;
        };
        let next = Offset::new(link.load(Ordering::Acquire));
        if next.is_null() || self.contains(next) {
            next
        } else {
            // A torn or corrupted link ends the walk instead of leaving the
            // slot range.
            LIST_END
        }
    }

    fn set_next(&self, node: Offset, next: Offset) {
        let Some(link) = self.link(node) else {
            panic!("set_next() on non-slot offset {node:?}");
        };
        link.store(next.get(), Ordering::Release);
    }

    fn capacity(&self) -> u32 {
        self.slot_count
    }
}

#[inline]
fn pack_head(first: Offset, tag: u32) -> u64 {
    ((tag as u64) << 32) | (first.get() as u64)
}

#[inline]
fn unpack_head(packed: u64) -> (Offset, u32) {
    let first = Offset::new(packed as u32);
    let tag = (packed >> 32) as u32;
    (first, tag)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::region::HeapRegion;
    use alloc::vec::Vec;

    const BASE: usize = 64;
    const SLOT: u32 = 32;

    fn make_slots(count: u32) -> (HeapRegion, FixedSlots) {
        let size = FixedSlots::required_size(BASE, SLOT, count).unwrap();
        let owner = HeapRegion::new_zeroed(size);
        let slots = FixedSlots::new(owner.region(), BASE, SLOT, count);
        (owner, slots)
    }

    #[test]
    fn head_packing() {
        let head = ListHead::new(Offset::new(0x1234));
        assert_eq!(head.first(), Offset::new(0x1234));
        assert_eq!(head.tag(), 0);
        assert_eq!(unpack_head(pack_head(Offset::new(7), u32::MAX)), (Offset::new(7), u32::MAX));
    }

    #[test]
    fn slot_addressing() {
        let (_owner, slots) = make_slots(4);
        assert_eq!(slots.slot(0), Some(Offset::new(64)));
        assert_eq!(slots.slot(3), Some(Offset::new(64 + 3 * 32)));
        assert_eq!(slots.slot(4), None);
        assert_eq!(slots.index_of(Offset::new(96)), Some(1));
        assert_eq!(slots.index_of(Offset::new(100)), None);
        assert_eq!(slots.index_of(Offset::new(32)), None);
        assert_eq!(slots.index_of(Offset::new(64 + 4 * 32)), None);
        assert!(!slots.contains(LIST_END));
    }

    #[test]
    fn chain_all_then_drain() {
        let (_owner, slots) = make_slots(4);
        let head = ListHead::new(LIST_END);
        unsafe { slots.chain_all(&head) };
        let list = OffsetList::new(&head, &slots);

        assert_eq!(list.len(), 4);
        let popped: Vec<_> = core::iter::from_fn(|| list.pop()).collect();
        let expected: Vec<_> = slots.offsets().collect();
        assert_eq!(popped, expected);
        assert!(list.is_empty());
        assert_eq!(list.pop(), None);
    }

    #[test]
    fn push_is_lifo() {
        let (_owner, slots) = make_slots(3);
        let head = ListHead::new(LIST_END);
        let list = OffsetList::new(&head, &slots);

        for node in slots.offsets() {
            list.push(node);
        }
        let walked: Vec<_> = list.iter().collect();
        let mut expected: Vec<_> = slots.offsets().collect();
        expected.reverse();
        assert_eq!(walked, expected);
    }

    #[test]
    fn tag_advances_on_every_update() {
        let (_owner, slots) = make_slots(2);
        let head = ListHead::new(LIST_END);
        let list = OffsetList::new(&head, &slots);
        let node = slots.slot(0).unwrap();

        list.push(node);
        assert_eq!(head.tag(), 1);
        assert_eq!(list.pop(), Some(node));
        assert_eq!(head.tag(), 2);
        list.push(node);
        assert_eq!(head.first(), node);
        assert_eq!(head.tag(), 3);
    }

    #[test]
    fn move_between_lists() {
        let (_owner, slots) = make_slots(4);
        let free = ListHead::new(LIST_END);
        let active = ListHead::new(LIST_END);
        unsafe { slots.chain_all(&free) };
        let free = OffsetList::new(&free, &slots);
        let active = OffsetList::new(&active, &slots);

        while let Some(node) = free.pop() {
            active.push(node);
        }
        assert!(free.is_empty());
        assert_eq!(active.len(), 4);

        let mut seen: Vec<_> = active.iter().collect();
        seen.sort();
        let all: Vec<_> = slots.offsets().collect();
        assert_eq!(seen, all);
    }

    #[test]
    fn walk_stops_on_corrupt_link() {
        let (_owner, slots) = make_slots(3);
        let head = ListHead::new(LIST_END);
        unsafe { slots.chain_all(&head) };
        let first = head.first();

        let region = slots.region();
        let link = unsafe { region.get::<AtomicU32>(first.as_usize()) };
        link.store(5, Ordering::Relaxed);

        let list = OffsetList::new(&head, &slots);
        assert_eq!(list.iter().collect::<Vec<_>>(), [first]);
    }

    #[test]
    fn walk_is_bounded_on_cycles() {
        let (_owner, slots) = make_slots(2);
        let head = ListHead::new(LIST_END);
        let a = slots.slot(0).unwrap();
        let b = slots.slot(1).unwrap();
        slots.set_next(a, b);
        slots.set_next(b, a);
        head.reset(a);

        let list = OffsetList::new(&head, &slots);
        assert_eq!(list.iter().count(), 2);
    }

    #[test]
    #[should_panic(expected = "do not fit")]
    fn slots_must_fit_region() {
        let owner = HeapRegion::new_zeroed(100);
        FixedSlots::new(owner.region(), 64, 32, 2);
    }
}
