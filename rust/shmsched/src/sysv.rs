//! System V shared memory segments and semaphore sets.
//!
//! Thin owners around the raw `shm*` / `sem*` calls. Errors come back as
//! [`Errno`] so callers can tell "not there" from "not allowed" from "out of
//! resources".

use std::mem;
use std::ptr::{self, NonNull};

use nix::errno::Errno;
use shmsched_primitives::Region;

const MODE: libc::c_int = 0o600;

/// An attached shared memory segment. Detached on drop; removal is explicit.
pub struct SysvSegment {
    id: libc::c_int,
    base: NonNull<u8>,
    len: usize,
}

unsafe impl Send for SysvSegment {}
unsafe impl Sync for SysvSegment {}

impl SysvSegment {
    /// Create a new segment of `size` bytes under `key` and attach it.
    ///
    /// Fails with `EEXIST` if a segment already exists for the key. A
    /// segment that was created but could not be attached is removed again.
    pub fn create(key: libc::key_t, size: usize) -> Result<Self, Errno> {
        let id = Errno::result(unsafe {
            libc::shmget(key, size, libc::IPC_CREAT | libc::IPC_EXCL | MODE)
        })?;
        match Self::attach_id(id, size) {
            Ok(segment) => Ok(segment),
            Err(errno) => {
                let _ = remove_id(id);
                Err(errno)
            }
        }
    }

    /// Attach the existing segment for `key`, at whatever size it has.
    pub fn open(key: libc::key_t) -> Result<Self, Errno> {
        let id = Self::lookup(key)?;
        let size = segment_size(id)?;
        Self::attach_id(id, size)
    }

    /// Segment id for `key`, without attaching.
    pub fn lookup(key: libc::key_t) -> Result<libc::c_int, Errno> {
        Errno::result(unsafe { libc::shmget(key, 0, MODE) })
    }

    /// Mark the segment for `id` for removal.
    ///
    /// The memory stays valid for every process still attached; it goes away
    /// after the last detach.
    pub fn remove_id(id: libc::c_int) -> Result<(), Errno> {
        remove_id(id)
    }

    fn attach_id(id: libc::c_int, size: usize) -> Result<Self, Errno> {
        let ptr = unsafe { libc::shmat(id, ptr::null(), 0) };
        if ptr as isize == -1 {
            return Err(Errno::last());
        }
        let Some(base) = NonNull::new(ptr as *mut u8) else {
            return Err(Errno::EFAULT);
        };
        Ok(Self { id, base, len: size })
    }

    #[inline]
    pub fn id(&self) -> libc::c_int {
        self.id
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The attached memory as a [`Region`], valid while `self` is alive.
    pub fn region(&self) -> Region {
        unsafe { Region::from_raw(self.base.as_ptr(), self.len) }
    }

    pub fn remove(&self) -> Result<(), Errno> {
        remove_id(self.id)
    }
}

impl Drop for SysvSegment {
    fn drop(&mut self) {
        let ret = unsafe { libc::shmdt(self.base.as_ptr() as *const libc::c_void) };
        if ret == -1 {
            debug!(id = self.id, error = %Errno::last(), "shmdt failed");
        }
    }
}

fn remove_id(id: libc::c_int) -> Result<(), Errno> {
    Errno::result(unsafe { libc::shmctl(id, libc::IPC_RMID, ptr::null_mut()) }).map(drop)
}

fn segment_size(id: libc::c_int) -> Result<usize, Errno> {
    let mut ds: libc::shmid_ds = unsafe { mem::zeroed() };
    Errno::result(unsafe { libc::shmctl(id, libc::IPC_STAT, &mut ds) })?;
    Ok(ds.shm_segsz as usize)
}

/// Index of a semaphore inside a [`SemaphoreSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Semaphore {
    /// Posted by clients after an enqueue or shutdown request.
    Startup = 0,
    /// Posted once by the driver when its loop has finished.
    Terminator = 1,
}

/// Number of semaphores in a scheduler's set.
pub const SEMAPHORE_COUNT: libc::c_int = 2;

/// A System V semaphore set. Nothing happens on drop.
#[derive(Debug)]
pub struct SemaphoreSet {
    id: libc::c_int,
}

impl SemaphoreSet {
    /// Create a set of `count` semaphores under `key`, all at zero.
    pub fn create(key: libc::key_t, count: libc::c_int) -> Result<Self, Errno> {
        let id = Errno::result(unsafe {
            libc::semget(key, count, libc::IPC_CREAT | libc::IPC_EXCL | MODE)
        })?;
        let set = Self { id };
        for num in 0..count {
            if let Err(errno) = set.set_value(num, 0) {
                let _ = set.remove();
                return Err(errno);
            }
        }
        Ok(set)
    }

    pub fn open(key: libc::key_t) -> Result<Self, Errno> {
        let id = Errno::result(unsafe { libc::semget(key, 0, MODE) })?;
        Ok(Self { id })
    }

    #[inline]
    pub fn id(&self) -> libc::c_int {
        self.id
    }

    /// Number of semaphores in the set.
    pub fn len(&self) -> Result<usize, Errno> {
        let mut ds: libc::semid_ds = unsafe { mem::zeroed() };
        Errno::result(unsafe { libc::semctl(self.id, 0, libc::IPC_STAT, &mut ds as *mut _) })?;
        Ok(ds.sem_nsems as usize)
    }

    pub fn post(&self, sem: Semaphore) -> Result<(), Errno> {
        self.op(sem, 1, 0).map(drop)
    }

    /// Block until `sem` can be decremented.
    ///
    /// Interrupted waits are retried. `EIDRM`/`EINVAL` mean the set was
    /// removed while waiting.
    pub fn wait(&self, sem: Semaphore) -> Result<(), Errno> {
        loop {
            match self.op(sem, -1, 0) {
                Err(Errno::EINTR) => continue,
                other => return other.map(drop),
            }
        }
    }

    /// Decrement `sem` if that would not block. Returns whether it did.
    pub fn try_wait(&self, sem: Semaphore) -> Result<bool, Errno> {
        loop {
            match self.op(sem, -1, libc::IPC_NOWAIT as libc::c_short) {
                Ok(_) => return Ok(true),
                Err(Errno::EAGAIN) => return Ok(false),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno),
            }
        }
    }

    /// Consume every pending post on `sem`, returning how many there were.
    pub fn drain(&self, sem: Semaphore) -> Result<u32, Errno> {
        let mut drained = 0;
        while self.try_wait(sem)? {
            drained += 1;
        }
        Ok(drained)
    }

    pub fn value(&self, sem: Semaphore) -> Result<i32, Errno> {
        Errno::result(unsafe { libc::semctl(self.id, sem as libc::c_int, libc::GETVAL) })
    }

    pub fn remove(&self) -> Result<(), Errno> {
        Errno::result(unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) }).map(drop)
    }

    fn set_value(&self, num: libc::c_int, value: libc::c_int) -> Result<(), Errno> {
        Errno::result(unsafe { libc::semctl(self.id, num, libc::SETVAL, value) }).map(drop)
    }

    fn op(&self, sem: Semaphore, delta: libc::c_short, flags: libc::c_short) -> Result<i32, Errno> {
        let mut buf = libc::sembuf {
            sem_num: sem as libc::c_ushort,
            sem_op: delta,
            sem_flg: flags,
        };
        Errno::result(unsafe { libc::semop(self.id, &mut buf, 1) })
    }
}

/// True for the errors a semaphore or segment call returns once the object
/// has been removed.
pub fn is_removed(errno: Errno) -> bool {
    matches!(errno, Errno::EIDRM | Errno::EINVAL)
}
