//! A scheduler region living in System V IPC objects: one shared memory
//! segment holding the [`CommandPool`], and one semaphore set.

use std::ops::Deref;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;

use crate::error::{Result, SchedError};
use crate::layout::{HeaderError, RegionState};
use crate::pool::CommandPool;
use crate::sysv::{SEMAPHORE_COUNT, Semaphore, SemaphoreSet, SysvSegment, is_removed};
use crate::token::RegionToken;
use crate::wake;

/// How long `attach` waits for a creator that is still writing the header.
const INIT_WAIT: Duration = Duration::from_millis(10);
const INIT_ATTEMPTS: u32 = 200;

pub struct SharedRegion {
    // Field order matters: the pool points into the segment.
    pool: CommandPool,
    segment: SysvSegment,
    semaphores: SemaphoreSet,
    token: RegionToken,
}

impl SharedRegion {
    /// Create the segment and semaphores for `token` and lay out a pool of
    /// `slot_count` commands.
    ///
    /// Fails with [`SchedError::AlreadyExists`] if either object exists.
    /// Nothing is left behind on failure.
    pub fn create(token: &RegionToken, slot_count: u32) -> Result<Self> {
        let size = CommandPool::required_size(slot_count)?;
        let key = token.key();

        let semaphores = SemaphoreSet::create(key, SEMAPHORE_COUNT)
            .map_err(|errno| create_error(token, "semget", errno))?;

        let segment = match SysvSegment::create(key, size) {
            Ok(segment) => segment,
            Err(errno) => {
                let _ = semaphores.remove();
                return Err(create_error(token, "shmget", errno));
            }
        };

        let pool = match unsafe { CommandPool::init(segment.region(), key, slot_count) } {
            Ok(pool) => pool,
            Err(err) => {
                let _ = segment.remove();
                let _ = semaphores.remove();
                return Err(err);
            }
        };

        info!(%token, slot_count, size, "region created");
        Ok(Self {
            pool,
            segment,
            semaphores,
            token: token.clone(),
        })
    }

    /// Attach to the existing region for `token`.
    pub fn attach(token: &RegionToken) -> Result<Self> {
        let key = token.key();

        let semaphores = SemaphoreSet::open(key).map_err(|errno| attach_error(token, "semget", errno))?;
        match semaphores.len() {
            Ok(n) if n == SEMAPHORE_COUNT as usize => {}
            Ok(_) => {
                return Err(SchedError::Corrupt {
                    reason: "semaphore set has the wrong size",
                });
            }
            Err(errno) => return Err(attach_error(token, "semctl", errno)),
        }

        let segment = SysvSegment::open(key).map_err(|errno| attach_error(token, "shmget", errno))?;

        let mut attempts = 0;
        let pool = loop {
            match unsafe { CommandPool::attach(segment.region(), key) } {
                Ok(pool) => break pool,
                Err(HeaderError::Uninitialized) if attempts < INIT_ATTEMPTS => {
                    attempts += 1;
                    thread::sleep(INIT_WAIT);
                }
                Err(HeaderError::Uninitialized) => {
                    return Err(SchedError::Corrupt {
                        reason: "region header never finished initializing",
                    });
                }
                Err(HeaderError::Mismatch(reason)) => return Err(SchedError::Corrupt { reason }),
            }
        };

        debug!(%token, state = %pool.state(), "region attached");
        Ok(Self {
            pool,
            segment,
            semaphores,
            token: token.clone(),
        })
    }

    /// Mark the region TERMINATED, detach, and remove both IPC objects.
    ///
    /// Objects that are already gone are not an error, so two processes may
    /// both destroy the same region.
    pub fn destroy(self) -> Result<()> {
        self.pool.header().set_state(RegionState::Terminated);

        let Self {
            pool,
            segment,
            semaphores,
            token,
        } = self;
        drop(pool);

        let shm = segment.remove();
        drop(segment);
        let sem = semaphores.remove();

        for (op, result) in [("shmctl", shm), ("semctl", sem)] {
            match result {
                Ok(()) => {}
                Err(errno) if is_removed(errno) => {}
                Err(errno) => return Err(SchedError::os(op, errno)),
            }
        }
        info!(%token, "region destroyed");
        Ok(())
    }

    /// Remove whatever IPC objects exist for `token`, without validating
    /// them. Returns whether anything was removed.
    pub fn purge(token: &RegionToken) -> Result<bool> {
        let key = token.key();
        let mut removed = false;

        match SemaphoreSet::open(key) {
            Ok(set) => match set.remove() {
                Ok(()) => removed = true,
                Err(errno) if is_removed(errno) => {}
                Err(errno) => return Err(SchedError::os("semctl", errno)),
            },
            Err(Errno::ENOENT) => {}
            Err(errno) => return Err(SchedError::os("semget", errno)),
        }

        match SysvSegment::lookup(key) {
            Ok(id) => match SysvSegment::remove_id(id) {
                Ok(()) => removed = true,
                Err(errno) if is_removed(errno) => {}
                Err(errno) => return Err(SchedError::os("shmctl", errno)),
            },
            Err(Errno::ENOENT) => {}
            Err(errno) => return Err(SchedError::os("shmget", errno)),
        }

        if removed {
            warn!(%token, "purged scheduler IPC objects");
        }
        Ok(removed)
    }

    #[inline]
    pub fn pool(&self) -> &CommandPool {
        &self.pool
    }

    #[inline]
    pub fn semaphores(&self) -> &SemaphoreSet {
        &self.semaphores
    }

    #[inline]
    pub fn token(&self) -> &RegionToken {
        &self.token
    }

    pub fn segment_id(&self) -> libc::c_int {
        self.segment.id()
    }

    /// Tell the driver something changed: post STARTUP, then signal it.
    ///
    /// A lost notification only delays the driver until its next wake, so
    /// failures are logged rather than returned.
    pub fn notify(&self) {
        if let Err(errno) = self.semaphores.post(Semaphore::Startup) {
            warn!(token = %self.token, error = %errno, "failed to post startup semaphore");
        }
        if let Err(err) = wake::notify_driver(&self.pool) {
            warn!(token = %self.token, error = %err, "failed to wake driver");
        }
    }

    /// Block until the driver posts TERMINATOR.
    ///
    /// Returns false if the semaphores were removed while waiting.
    pub fn wait_terminated(&self) -> Result<bool> {
        match self.semaphores.wait(Semaphore::Terminator) {
            Ok(()) => Ok(true),
            Err(errno) if is_removed(errno) => Ok(false),
            Err(errno) => Err(SchedError::os("semop", errno)),
        }
    }
}

impl Deref for SharedRegion {
    type Target = CommandPool;

    fn deref(&self) -> &CommandPool {
        &self.pool
    }
}

fn create_error(token: &RegionToken, op: &'static str, errno: Errno) -> SchedError {
    match errno {
        Errno::EEXIST => SchedError::AlreadyExists {
            token: token.to_string(),
        },
        Errno::ENOSPC | Errno::ENOMEM | Errno::EINVAL => SchedError::ResourceExhausted {
            detail: format!("{op}: {}", errno.desc()),
        },
        errno => SchedError::os(op, errno),
    }
}

fn attach_error(token: &RegionToken, op: &'static str, errno: Errno) -> SchedError {
    match errno {
        Errno::ENOENT | Errno::EIDRM | Errno::EINVAL => SchedError::NotFound {
            token: token.to_string(),
        },
        errno => SchedError::os(op, errno),
    }
}
