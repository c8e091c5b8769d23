//! The command pool: a region's header, its command slots and the lists
//! threaded through them.
//!
//! Works over any [`Region`]; [`crate::region::SharedRegion`] puts one in a
//! System V segment.

use std::fmt;

use nix::unistd::getpid;
use shmsched_primitives::{FixedSlots, Offset, OffsetList, Region};

use crate::command::{CommandSpec, CommandView};
use crate::error::{Result, SchedError};
use crate::layout::{
    COMMAND_SIZE, CommandRecord, CommandState, HEADER_SIZE, HeaderError, HeaderInit,
    RegionHeader, RegionState, region_size,
};

pub struct CommandPool {
    region: Region,
    slots: FixedSlots,
}

impl CommandPool {
    /// Bytes a region with `slot_count` slots occupies.
    pub fn required_size(slot_count: u32) -> Result<usize> {
        region_size(slot_count).ok_or_else(|| {
            SchedError::Config(format!(
                "{slot_count} command slots do not fit a region (1..={})",
                (u32::MAX as usize - HEADER_SIZE) / COMMAND_SIZE
            ))
        })
    }

    /// Lay out a fresh region: header, then every slot on the free list.
    ///
    /// # Safety
    ///
    /// The region must be exclusively owned: nobody else may be reading it
    /// until this returns.
    pub unsafe fn init(region: Region, token: i32, slot_count: u32) -> Result<Self> {
        let required = Self::required_size(slot_count)?;
        if region.len() < required {
            return Err(SchedError::Corrupt {
                reason: "segment smaller than its layout",
            });
        }

        unsafe { region.zero() };
        let header = unsafe { region.get_mut::<RegionHeader>(0) };
        header.init(HeaderInit {
            token,
            total_size: required as u64,
            slot_count,
        });

        let slots = FixedSlots::new(region, HEADER_SIZE, COMMAND_SIZE as u32, slot_count);
        unsafe { slots.chain_all(&header.free_list) };
        header.publish();

        Ok(Self { region, slots })
    }

    /// View an existing region.
    ///
    /// # Safety
    ///
    /// The region must stay mapped for the lifetime of the pool.
    pub unsafe fn attach(region: Region, token: i32) -> Result<Self, HeaderError> {
        if region.len() < HEADER_SIZE {
            return Err(HeaderError::Mismatch("segment smaller than a header"));
        }
        let header = unsafe { region.get::<RegionHeader>(0) };
        header.validate(token, region.len())?;
        let slots = FixedSlots::new(region, HEADER_SIZE, COMMAND_SIZE as u32, header.slot_count);
        Ok(Self { region, slots })
    }

    #[inline]
    pub fn header(&self) -> &RegionHeader {
        unsafe { self.region.get::<RegionHeader>(0) }
    }

    #[inline]
    pub fn state(&self) -> RegionState {
        self.header().state()
    }

    #[inline]
    pub fn slot_count(&self) -> u32 {
        self.slots.slot_count()
    }

    pub fn free_list(&self) -> OffsetList<'_, FixedSlots> {
        OffsetList::new(&self.header().free_list, &self.slots)
    }

    pub fn active_list(&self) -> OffsetList<'_, FixedSlots> {
        OffsetList::new(&self.header().active_list, &self.slots)
    }

    pub fn unseen_list(&self) -> OffsetList<'_, FixedSlots> {
        OffsetList::new(&self.header().unseen_list, &self.slots)
    }

    /// Every slot offset, whatever list it is on.
    pub fn slot_offsets(&self) -> impl Iterator<Item = Offset> + '_ {
        self.slots.offsets()
    }

    /// The command at `offset`, if `offset` is a slot boundary.
    pub fn command(&self, offset: Offset) -> Option<CommandView<'_>> {
        self.record(offset)
            .map(|record| CommandView::new(offset, record))
    }

    /// Published commands, most recently enqueued first.
    pub fn commands(&self) -> impl Iterator<Item = CommandView<'_>> + '_ {
        self.active_list()
            .iter()
            .filter_map(move |offset| self.command(offset))
    }

    /// Copy `spec` into a free slot and publish it on the active list.
    ///
    /// The command is WAITING by the time it becomes visible. Waking the
    /// driver is the caller's job.
    ///
    /// A shutdown requested between the admission check and the push can
    /// let the driver finish its last sweep without seeing the command. The
    /// state is read again after the push and such a command is logged; it
    /// stays in the final report as WAITING.
    pub fn enqueue(&self, spec: &CommandSpec) -> Result<Offset> {
        let text = spec.encode()?;

        let state = self.state();
        if state.is_closing() {
            return Err(SchedError::Closed { state });
        }

        let Some(offset) = self.free_list().pop() else {
            return Err(SchedError::ResourceExhausted {
                detail: format!("all {} command slots are in use", self.slot_count()),
            });
        };
        let Some(record) = self.record(offset) else {
            return Err(SchedError::Corrupt {
                reason: "free list holds a non-slot offset",
            });
        };

        // Popped from the free list and not yet pushed: ours alone.
        unsafe { record.fill(text.layout, &text.bytes, getpid()) };
        record.set_state(CommandState::Waiting);
        self.active_list().push(offset);

        trace!(%offset, name = %spec.name, "command enqueued");
        self.admitted_late(&spec.name);
        Ok(offset)
    }

    /// True, with a warning, if shutdown was requested by the time a
    /// command named `name` was published.
    fn admitted_late(&self, name: &str) -> bool {
        let state = self.state();
        if !state.is_closing() {
            return false;
        }
        warn!(%name, %state, "command enqueued while the scheduler was shutting down; it may never start");
        true
    }

    /// Snapshot of every published command, in enqueue order.
    pub fn report(&self) -> Vec<CommandReport> {
        let mut report: Vec<_> = self.commands().map(CommandReport::from).collect();
        report.reverse();
        report
    }

    fn record(&self, offset: Offset) -> Option<&CommandRecord> {
        self.slots
            .contains(offset)
            .then(|| unsafe { self.region.get::<CommandRecord>(offset.as_usize()) })
    }
}

/// One line of a status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReport {
    pub name: String,
    pub state: CommandState,
    pub pid: Option<i32>,
    pub completion: Option<i32>,
    pub deps: Vec<String>,
}

impl From<CommandView<'_>> for CommandReport {
    fn from(cmd: CommandView<'_>) -> Self {
        Self {
            name: cmd.name_lossy().into_owned(),
            state: cmd.state(),
            pid: cmd.pid().map(|pid| pid.as_raw()),
            completion: cmd.completion(),
            deps: cmd
                .dependencies()
                .map(|dep| String::from_utf8_lossy(dep).into_owned())
                .collect(),
        }
    }
}

impl fmt::Display for CommandReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}\t", self.name, self.state)?;
        match self.pid {
            Some(pid) => write!(f, "{pid}\t")?,
            None => f.write_str("-\t")?,
        }
        match self.completion {
            Some(code) => write!(f, "{code}"),
            None => f.write_str("-"),
        }
    }
}
