use core::fmt;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;

/// Position of a value inside a [`Region`], in bytes from the region base.
///
/// Offsets stay meaningful in every process that maps the same memory,
/// whatever address the mapping lands at. Offset zero is reserved as the
/// null offset: layouts built on this crate keep a header at the start of
/// the region so no linked value ever lives there.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct Offset(u32);

impl Offset {
    /// The null offset, used as the end-of-list sentinel.
    pub const NULL: Offset = Offset(0);

    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("Offset(null)")
        } else {
            write!(f, "Offset({:#x})", self.0)
        }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A contiguous region of memory addressed by offset.
///
/// # Safety
///
/// The caller must ensure:
/// - `base` is valid for `len` bytes and properly aligned for all contained types
/// - the memory remains valid for the lifetime of this Region
#[derive(Clone, Copy)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

impl Region {
    /// Create a region from a raw pointer and length.
    ///
    /// # Safety
    ///
    /// - `base` must be valid for `len` bytes
    /// - `base` must be aligned for all contained types
    /// - the memory must remain valid for the lifetime of this Region
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        let Some(base) = NonNull::new(base) else {
            panic!("region base must be non-null");
        };
        Self { base, len }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns true if a `T` fits at `off` and `off` is aligned for it.
    #[inline]
    pub fn fits<T>(&self, off: usize) -> bool {
        off.is_multiple_of(align_of::<T>())
            && off
                .checked_add(size_of::<T>())
                .is_some_and(|end| end <= self.len)
    }

    /// Returns a pointer to offset `off` within the region.
    #[inline]
    pub fn offset(&self, off: usize) -> *mut u8 {
        assert!(
            off < self.len,
            "offset {off} out of bounds (len={})",
            self.len
        );
        unsafe { self.as_ptr().add(off) }
    }

    /// Translates a pointer into this region back to its offset.
    ///
    /// Returns `None` for pointers outside the region or beyond `u32` range.
    pub fn offset_of<T>(&self, ptr: *const T) -> Option<Offset> {
        let addr = ptr as usize;
        let base = self.as_ptr() as usize;
        let off = addr.checked_sub(base)?;
        if off >= self.len {
            return None;
        }
        u32::try_from(off).ok().map(Offset::new)
    }

    /// Returns a reference to a `T` at the given byte offset.
    ///
    /// # Safety
    ///
    /// The offset must be aligned for `T` and within bounds, and the bytes
    /// there must be a valid `T`.
    #[inline]
    pub unsafe fn get<T>(&self, off: usize) -> &T {
        debug_assert!(self.fits::<T>(off));
        unsafe { &*(self.offset(off) as *const T) }
    }

    /// Returns a mutable reference to a `T` at the given byte offset.
    ///
    /// # Safety
    ///
    /// Same as [`Region::get`], and no other reference to those bytes may be
    /// live in this process.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut<T>(&self, off: usize) -> &mut T {
        debug_assert!(self.fits::<T>(off));
        unsafe { &mut *(self.offset(off) as *mut T) }
    }

    /// Zero the whole region.
    ///
    /// # Safety
    ///
    /// No reference into the region may be live, and no other process may be
    /// using the memory.
    pub unsafe fn zero(&self) {
        unsafe { core::ptr::write_bytes(self.as_ptr(), 0, self.len) };
    }
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

#[cfg(any(test, feature = "alloc"))]
mod heap {
    use super::Region;
    use alloc::alloc::{Layout, alloc_zeroed, dealloc};
    use core::ptr::NonNull;

    /// Heap-backed region, used where a layout needs exercising without a
    /// shared mapping.
    pub struct HeapRegion {
        base: NonNull<u8>,
        len: usize,
        layout: Layout,
    }

    impl HeapRegion {
        /// Allocate a zeroed heap region aligned to 64 bytes.
        pub fn new_zeroed(size: usize) -> Self {
            let layout =
                Layout::from_size_align(size.max(1), 64).expect("invalid heap region layout");
            let ptr = unsafe { alloc_zeroed(layout) };
            let base = NonNull::new(ptr).expect("heap region allocation failed");
            Self {
                base,
                len: size,
                layout,
            }
        }

        #[inline]
        pub fn region(&self) -> Region {
            unsafe { Region::from_raw(self.base.as_ptr(), self.len) }
        }

        #[inline]
        pub fn len(&self) -> usize {
            self.len
        }

        #[inline]
        pub fn is_empty(&self) -> bool {
            self.len == 0
        }
    }

    impl Drop for HeapRegion {
        fn drop(&mut self) {
            unsafe { dealloc(self.base.as_ptr(), self.layout) };
        }
    }

    unsafe impl Send for HeapRegion {}
    unsafe impl Sync for HeapRegion {}
}

#[cfg(any(test, feature = "alloc"))]
pub use heap::HeapRegion;
