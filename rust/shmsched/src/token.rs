//! Naming a scheduler region.
//!
//! A token is a System V IPC key. Users normally pass a path, which is
//! turned into a key with `ftok(3)`; every process that uses the same path
//! reaches the same region. A raw key can be given as `0x...` instead.

use std::ffi::CString;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;

use crate::error::{Result, SchedError};

/// Project id mixed into the `ftok` key.
pub const PROJECT_ID: u8 = b'S';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionToken {
    key: libc::key_t,
    path: Option<PathBuf>,
}

impl RegionToken {
    /// Derive a token from an existing filesystem path.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let invalid = |reason: String| SchedError::InvalidToken {
            token: path.display().to_string(),
            reason,
        };

        let c_path =
            CString::new(path.as_os_str().as_bytes()).map_err(|_| invalid("contains a NUL byte".into()))?;
        let key = unsafe { libc::ftok(c_path.as_ptr(), PROJECT_ID as libc::c_int) };
        if key == -1 {
            return Err(invalid(Errno::last().desc().to_string()));
        }

        Ok(Self {
            key,
            path: Some(path.to_path_buf()),
        })
    }

    /// Use a raw IPC key.
    pub fn from_key(key: libc::key_t) -> Result<Self> {
        if key == libc::IPC_PRIVATE {
            return Err(SchedError::InvalidToken {
                token: format!("{key:#x}"),
                reason: "IPC_PRIVATE cannot name a shared region".into(),
            });
        }
        Ok(Self { key, path: None })
    }

    /// Parse a command-line token: `0x` followed by hex digits is a raw key,
    /// anything else a path.
    pub fn parse(arg: &str) -> Result<Self> {
        if let Some(hex) = arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")) {
            let key = u32::from_str_radix(hex, 16).map_err(|err| SchedError::InvalidToken {
                token: arg.to_string(),
                reason: err.to_string(),
            })?;
            return Self::from_key(key as libc::key_t);
        }
        if arg.is_empty() {
            return Err(SchedError::InvalidToken {
                token: String::new(),
                reason: "empty".into(),
            });
        }
        Self::from_path(arg)
    }

    #[inline]
    pub fn key(&self) -> libc::key_t {
        self.key
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl fmt::Display for RegionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{} (key {:#x})", path.display(), self.key),
            None => write!(f, "key {:#x}", self.key),
        }
    }
}
