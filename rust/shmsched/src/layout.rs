//! Binary layout of a scheduler region.
//!
//! ```text
//! offset 0     RegionHeader (128 bytes)
//! offset 128   CommandRecord[slot_count] (1024 bytes each)
//! ```
//!
//! Every cross-process reference is an [`Offset`](shmsched_primitives::Offset) from the region base. The
//! header sits at offset 0, so offset 0 doubles as the end-of-list marker.

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU16, AtomicU32, Ordering, fence};

use nix::unistd::Pid;
use shmsched_primitives::{LIST_END, ListHead};

use crate::wake::WakeMode;

pub const MAGIC: [u8; 8] = *b"SHMSCHD\x01";
pub const LAYOUT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 128;

pub const COMMAND_SIZE: usize = 1024;
pub const COMMAND_HEADER_SIZE: usize = 32;
/// Bytes available in one slot for name, code and dependency text.
pub const COMMAND_TEXT_SIZE: usize = COMMAND_SIZE - COMMAND_HEADER_SIZE;

/// Lifecycle of the region as a whole.
///
/// Stored in [`RegionHeader::state`]. Transitions only move forward, except
/// that a new region starts again at `Reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RegionState {
    Reset = 0,
    Booted = 1,
    Inited = 2,
    Terminating = 3,
    Draining = 4,
    Terminated = 5,
}

impl RegionState {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Reset,
            1 => Self::Booted,
            2 => Self::Inited,
            3 => Self::Terminating,
            4 => Self::Draining,
            5 => Self::Terminated,
            _ => return None,
        })
    }

    /// Commands are no longer admitted once shutdown has been requested.
    pub fn is_closing(self) -> bool {
        matches!(self, Self::Terminating | Self::Draining | Self::Terminated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reset => "reset",
            Self::Booted => "booted",
            Self::Inited => "inited",
            Self::Terminating => "terminating",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for RegionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one command record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandState {
    Reset = 0,
    Waiting = 1,
    Active = 2,
    Complete = 3,
}

impl CommandState {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Reset,
            1 => Self::Waiting,
            2 => Self::Active,
            3 => Self::Complete,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reset => "reset",
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a header failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    /// The creator has not finished writing the header yet.
    Uninitialized,
    /// The header does not describe a region this build can use.
    Mismatch(&'static str),
}

/// Fixed-size header at offset 0 of every region.
///
/// `version` is written last during initialization, so a non-zero version
/// means every other field is in place.
#[repr(C)]
pub struct RegionHeader {
    pub magic: [u8; 8],
    pub version: AtomicU32,
    pub header_size: u32,
    /// Key the region was created under.
    pub token: i32,
    pub slot_size: u32,
    pub total_size: u64,
    pub slot_count: u32,
    /// Raw [`RegionState`].
    pub state: AtomicU32,
    /// Process to notify after an enqueue, 0 when none is armed.
    pub driver_pid: AtomicI32,
    /// Raw [`WakeMode`] matching `driver_pid`, 0 until the driver arms.
    pub wake_mode: AtomicU32,
    pub free_list: ListHead,
    pub active_list: ListHead,
    /// Reserved for a not-yet-swept staging list. Always empty today.
    pub unseen_list: ListHead,
    _reserved: [u8; 56],
}

const _: () = assert!(core::mem::size_of::<RegionHeader>() == HEADER_SIZE);

/// Values fixed at creation time.
#[derive(Debug, Clone, Copy)]
pub struct HeaderInit {
    pub token: i32,
    pub total_size: u64,
    pub slot_count: u32,
}

impl RegionHeader {
    /// Write every field except `version`.
    ///
    /// The region must be zeroed and exclusively owned. Call
    /// [`RegionHeader::publish`] once the command slots are in place.
    pub fn init(&mut self, init: HeaderInit) {
        self.magic = MAGIC;
        self.header_size = HEADER_SIZE as u32;
        self.token = init.token;
        self.slot_size = COMMAND_SIZE as u32;
        self.total_size = init.total_size;
        self.slot_count = init.slot_count;
        self.state = AtomicU32::new(RegionState::Reset as u32);
        self.driver_pid = AtomicI32::new(0);
        self.wake_mode = AtomicU32::new(0);
        self.free_list.reset(LIST_END);
        self.active_list.reset(LIST_END);
        self.unseen_list.reset(LIST_END);
        self._reserved = [0; 56];
    }

    /// Mark the header complete. Attachers spin on this.
    pub fn publish(&self) {
        fence(Ordering::Release);
        self.version.store(LAYOUT_VERSION, Ordering::Release);
    }

    /// Check that this header describes a region created under `token`
    /// whose segment is `len` bytes long.
    pub fn validate(&self, token: i32, len: usize) -> Result<(), HeaderError> {
        let version = self.version.load(Ordering::Acquire);
        if version == 0 {
            return Err(HeaderError::Uninitialized);
        }
        if self.magic != MAGIC {
            return Err(HeaderError::Mismatch("invalid magic"));
        }
        if version != LAYOUT_VERSION {
            return Err(HeaderError::Mismatch("unsupported layout version"));
        }
        if self.header_size as usize != HEADER_SIZE {
            return Err(HeaderError::Mismatch("invalid header size"));
        }
        if self.token != token {
            return Err(HeaderError::Mismatch("token mismatch"));
        }
        if self.total_size != len as u64 {
            return Err(HeaderError::Mismatch("segment size mismatch"));
        }
        if self.slot_size as usize != COMMAND_SIZE {
            return Err(HeaderError::Mismatch("command slot size mismatch"));
        }
        let expected = HEADER_SIZE as u64 + self.slot_count as u64 * COMMAND_SIZE as u64;
        if self.slot_count == 0 || expected != self.total_size {
            return Err(HeaderError::Mismatch("slot count does not match segment size"));
        }
        Ok(())
    }

    pub fn state(&self) -> RegionState {
        // Unknown values only appear in a corrupted region; treat those as
        // finished so nobody waits on them.
        RegionState::from_u32(self.state.load(Ordering::Acquire))
            .unwrap_or(RegionState::Terminated)
    }

    pub fn set_state(&self, state: RegionState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Move to `to` if the current state is one of `from`.
    ///
    /// Returns the state that was replaced, or the current state when it is
    /// not in `from`.
    pub fn transition(
        &self,
        from: &[RegionState],
        to: RegionState,
    ) -> Result<RegionState, RegionState> {
        let mut current = self.state();
        loop {
            if !from.contains(&current) {
                return Err(current);
            }
            match self.state.compare_exchange_weak(
                current as u32,
                to as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current),
                Err(raw) => {
                    current = RegionState::from_u32(raw).unwrap_or(RegionState::Terminated)
                }
            }
        }
    }

    /// Leave `Reset` for `to`, the state a creator announces once its
    /// region is ready for a driver.
    ///
    /// A shutdown requested while the region was still `Reset` is kept:
    /// state never moves back. Returns the state the region ends up in.
    pub fn open(&self, to: RegionState) -> RegionState {
        match self.transition(&[RegionState::Reset], to) {
            Ok(_) => to,
            Err(current) => current,
        }
    }

    /// Make `pid` the process clients notify, using `mode`.
    pub fn publish_driver(&self, pid: Pid, mode: WakeMode) {
        self.wake_mode.store(mode.to_raw(), Ordering::Release);
        self.driver_pid.store(pid.as_raw(), Ordering::Release);
    }

    pub fn driver_pid(&self) -> Option<Pid> {
        match self.driver_pid.load(Ordering::Acquire) {
            0 => None,
            raw => Some(Pid::from_raw(raw)),
        }
    }

    /// Clear the published pid, returning what was there.
    pub fn take_driver_pid(&self) -> Option<Pid> {
        match self.driver_pid.swap(0, Ordering::AcqRel) {
            0 => None,
            raw => Some(Pid::from_raw(raw)),
        }
    }

    pub fn wake_mode(&self) -> Option<WakeMode> {
        WakeMode::from_raw(self.wake_mode.load(Ordering::Acquire))
    }
}

/// One command slot.
///
/// `next` must stay the first field: it is the link word the offset lists
/// thread through. Everything but `text` is atomic because a slot is read by
/// other processes as soon as it is pushed onto the active list. `text` is
/// written only while the slot is owned by the enqueuing client, and never
/// again once published.
#[repr(C)]
pub struct CommandRecord {
    pub next: AtomicU32,
    /// Raw [`CommandState`].
    pub state: AtomicU32,
    /// Child pid once started, 0 before.
    pub pid: AtomicI32,
    /// Exit code, or 128 + signal for a child killed by a signal.
    pub completion: AtomicI32,
    pub name_off: AtomicU16,
    pub code_off: AtomicU16,
    /// 0 when the command has no dependencies.
    pub deps_off: AtomicU16,
    pub text_len: AtomicU16,
    /// Pid of the client that enqueued this command.
    pub enqueued_by: AtomicI32,
    _pad: u32,
    pub text: std::cell::UnsafeCell<[u8; COMMAND_TEXT_SIZE]>,
}

const _: () = assert!(core::mem::size_of::<CommandRecord>() == COMMAND_SIZE);
const _: () = assert!(core::mem::offset_of!(CommandRecord, text) == COMMAND_HEADER_SIZE);
const _: () = assert!(core::mem::offset_of!(CommandRecord, next) == 0);

/// Offsets of the three strings inside a record's text, plus its used length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextLayout {
    pub name_off: u16,
    pub code_off: u16,
    pub deps_off: u16,
    pub text_len: u16,
}

impl CommandRecord {
    pub fn state(&self) -> CommandState {
        CommandState::from_u32(self.state.load(Ordering::Acquire)).unwrap_or(CommandState::Reset)
    }

    pub fn set_state(&self, state: CommandState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub fn text_layout(&self) -> TextLayout {
        TextLayout {
            name_off: self.name_off.load(Ordering::Relaxed),
            code_off: self.code_off.load(Ordering::Relaxed),
            deps_off: self.deps_off.load(Ordering::Relaxed),
            text_len: self.text_len.load(Ordering::Relaxed),
        }
    }

    /// Fill a freshly allocated slot.
    ///
    /// # Safety
    ///
    /// The caller must own the slot: popped from the free list and not yet
    /// pushed anywhere.
    pub unsafe fn fill(&self, layout: TextLayout, text: &[u8], enqueued_by: Pid) {
        debug_assert!(text.len() <= COMMAND_TEXT_SIZE);
        debug_assert_eq!(text.len(), layout.text_len as usize);
        unsafe {
            let dst = self.text.get() as *mut u8;
            core::ptr::write_bytes(dst, 0, COMMAND_TEXT_SIZE);
            core::ptr::copy_nonoverlapping(text.as_ptr(), dst, text.len());
        }
        self.name_off.store(layout.name_off, Ordering::Relaxed);
        self.code_off.store(layout.code_off, Ordering::Relaxed);
        self.deps_off.store(layout.deps_off, Ordering::Relaxed);
        self.text_len.store(layout.text_len, Ordering::Relaxed);
        self.enqueued_by.store(enqueued_by.as_raw(), Ordering::Relaxed);
        self.pid.store(0, Ordering::Relaxed);
        self.completion.store(0, Ordering::Relaxed);
        self.set_state(CommandState::Reset);
    }

    /// The used part of the text area.
    pub fn text(&self) -> &[u8] {
        let len = (self.text_len.load(Ordering::Relaxed) as usize).min(COMMAND_TEXT_SIZE);
        // Published text is immutable, see the type docs.
        let all = unsafe { &*self.text.get() };
        &all[..len]
    }
}

/// Bytes needed for a region with `slot_count` command slots, if that fits
/// in 32-bit offsets.
pub fn region_size(slot_count: u32) -> Option<usize> {
    let size = (slot_count as usize)
        .checked_mul(COMMAND_SIZE)?
        .checked_add(HEADER_SIZE)?;
    (slot_count > 0 && size <= u32::MAX as usize).then_some(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shmsched_primitives::HeapRegion;

    fn make_header() -> (HeapRegion, &'static mut RegionHeader) {
        let owner = HeapRegion::new_zeroed(HEADER_SIZE);
        let header = unsafe { &mut *(owner.region().as_ptr() as *mut RegionHeader) };
        (owner, header)
    }

    fn init(header: &mut RegionHeader, slots: u32) {
        header.init(HeaderInit {
            token: 0x5151,
            total_size: region_size(slots).unwrap() as u64,
            slot_count: slots,
        });
    }

    #[test]
    fn sizes() {
        assert_eq!(core::mem::size_of::<RegionHeader>(), 128);
        assert_eq!(core::mem::size_of::<CommandRecord>(), 1024);
        assert_eq!(COMMAND_TEXT_SIZE, 992);
        assert_eq!(region_size(256), Some(128 + 256 * 1024));
        assert_eq!(region_size(0), None);
        assert_eq!(region_size(u32::MAX), None);
    }

    #[test]
    fn unpublished_header_is_uninitialized() {
        let (_owner, header) = make_header();
        init(header, 4);
        let len = region_size(4).unwrap();
        assert_eq!(header.validate(0x5151, len), Err(HeaderError::Uninitialized));
        header.publish();
        assert_eq!(header.validate(0x5151, len), Ok(()));
    }

    #[test]
    fn validate_rejects_mismatches() {
        let (_owner, header) = make_header();
        init(header, 4);
        header.publish();
        let len = region_size(4).unwrap();

        assert_eq!(
            header.validate(0x5152, len),
            Err(HeaderError::Mismatch("token mismatch"))
        );
        assert_eq!(
            header.validate(0x5151, len + 1),
            Err(HeaderError::Mismatch("segment size mismatch"))
        );

        header.magic = *b"NOTSCHED";
        assert_eq!(
            header.validate(0x5151, len),
            Err(HeaderError::Mismatch("invalid magic"))
        );
        header.magic = MAGIC;

        header.version.store(9, Ordering::Relaxed);
        assert_eq!(
            header.validate(0x5151, len),
            Err(HeaderError::Mismatch("unsupported layout version"))
        );
    }

    #[test]
    fn state_transitions() {
        let (_owner, header) = make_header();
        init(header, 1);
        assert_eq!(header.state(), RegionState::Reset);

        header.set_state(RegionState::Booted);
        let open = [RegionState::Booted, RegionState::Inited];
        assert_eq!(
            header.transition(&open, RegionState::Draining),
            Ok(RegionState::Booted)
        );
        assert_eq!(
            header.transition(&open, RegionState::Terminating),
            Err(RegionState::Draining)
        );
        assert!(header.state().is_closing());
    }

    #[test]
    fn open_keeps_an_earlier_shutdown() {
        let (_owner, header) = make_header();
        init(header, 1);
        assert_eq!(header.open(RegionState::Booted), RegionState::Booted);
        // Only a fresh region can be opened.
        assert_eq!(header.open(RegionState::Inited), RegionState::Booted);

        let (_owner, header) = make_header();
        init(header, 1);
        let open = [RegionState::Reset, RegionState::Booted, RegionState::Inited];
        assert_eq!(
            header.transition(&open, RegionState::Terminating),
            Ok(RegionState::Reset)
        );
        assert_eq!(header.open(RegionState::Booted), RegionState::Terminating);
        assert_eq!(header.state(), RegionState::Terminating);
    }

    #[test]
    fn driver_pid_publish_and_take() {
        let (_owner, header) = make_header();
        init(header, 1);
        assert_eq!(header.driver_pid(), None);
        assert_eq!(header.wake_mode(), None);

        header.publish_driver(Pid::from_raw(4242), WakeMode::Placeholder);
        assert_eq!(header.driver_pid(), Some(Pid::from_raw(4242)));
        assert_eq!(header.wake_mode(), Some(WakeMode::Placeholder));

        assert_eq!(header.take_driver_pid(), Some(Pid::from_raw(4242)));
        assert_eq!(header.take_driver_pid(), None);
    }
}
