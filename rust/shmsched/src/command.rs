//! Commands: what clients submit, and how a published record reads back.

use std::borrow::Cow;
use std::ffi::CStr;
use std::fmt;
use std::sync::atomic::Ordering;

use nix::unistd::Pid;
use shmsched_primitives::Offset;

use crate::error::{Result, SchedError};
use crate::layout::{COMMAND_TEXT_SIZE, CommandRecord, CommandState, TextLayout};

/// Name given to commands nobody can depend on.
pub const UNNAMED: &str = ".";

/// A command as submitted by a client, before it is written to a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: String,
    pub code: String,
    pub deps: Vec<String>,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
            deps: Vec::new(),
        }
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Parse the command-line form of a submission.
    ///
    /// Accepted shapes, where any further arguments are dependency names:
    ///
    /// ```text
    /// name=code [dep...]
    /// name='code with spaces' [dep...]
    /// name= code [dep...]
    /// name code [dep...]
    /// ```
    ///
    /// A dependency argument may itself hold several space-separated names.
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        let mut args = args.iter().map(AsRef::as_ref);
        let Some(first) = args.next() else {
            return Err(SchedError::InvalidCommand("no command specified".into()));
        };

        let (name, code) = match first.split_once('=') {
            Some((name, code)) if !code.is_empty() => (name, unquote(code)),
            Some((name, _)) => (name, next_code(&mut args, name)?),
            None => (first, next_code(&mut args, first)?),
        };

        let deps = args
            .flat_map(str::split_whitespace)
            .map(str::to_string)
            .collect();

        let spec = Self {
            name: name.to_string(),
            code: code.to_string(),
            deps,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn is_named(&self) -> bool {
        self.name != UNNAMED
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(SchedError::InvalidCommand(msg));

        if self.name.is_empty() {
            return invalid("empty command name".into());
        }
        if self.name.contains(|c: char| c.is_whitespace() || c == '\0' || c == '=') {
            return invalid(format!("bad command name {:?}", self.name));
        }
        if self.code.trim().is_empty() {
            return invalid(format!("command {} has no code", self.name));
        }
        if self.code.contains('\0') {
            return invalid(format!("command {} code contains a NUL byte", self.name));
        }
        for dep in &self.deps {
            if dep.is_empty() || dep.contains(|c: char| c.is_whitespace() || c == '\0') {
                return invalid(format!("bad dependency name {dep:?}"));
            }
        }
        Ok(())
    }

    /// Lay the strings out as they will sit in a slot's text area:
    /// `name\0code\0[deps\0]`, with dependency names separated by spaces.
    pub fn encode(&self) -> Result<EncodedText> {
        self.validate()?;

        let mut bytes = Vec::with_capacity(self.name.len() + self.code.len() + 2);
        bytes.extend_from_slice(self.name.as_bytes());
        bytes.push(0);
        let code_off = bytes.len();
        bytes.extend_from_slice(self.code.as_bytes());
        bytes.push(0);
        let deps_off = if self.deps.is_empty() {
            0
        } else {
            let off = bytes.len();
            bytes.extend_from_slice(self.deps.join(" ").as_bytes());
            bytes.push(0);
            off
        };

        if bytes.len() > COMMAND_TEXT_SIZE {
            return Err(SchedError::TooLarge {
                needed: bytes.len(),
                capacity: COMMAND_TEXT_SIZE,
            });
        }

        // Bounded by COMMAND_TEXT_SIZE, which fits u16.
        let layout = TextLayout {
            name_off: 0,
            code_off: code_off as u16,
            deps_off: deps_off as u16,
            text_len: bytes.len() as u16,
        };
        Ok(EncodedText { layout, bytes })
    }
}

fn next_code<'a>(args: &mut impl Iterator<Item = &'a str>, name: &str) -> Result<&'a str> {
    args.next()
        .map(unquote)
        .ok_or_else(|| SchedError::InvalidCommand(format!("no code given for command {name}")))
}

/// Strip one pair of matching surrounding quotes.
fn unquote(code: &str) -> &str {
    for quote in ['\'', '"'] {
        if let Some(inner) = code
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    code
}

/// Encoded text ready to be copied into a slot.
#[derive(Debug, Clone)]
pub struct EncodedText {
    pub layout: TextLayout,
    pub bytes: Vec<u8>,
}

/// A published command record, read in place.
#[derive(Clone, Copy)]
pub struct CommandView<'a> {
    offset: Offset,
    record: &'a CommandRecord,
}

impl<'a> CommandView<'a> {
    pub(crate) fn new(offset: Offset, record: &'a CommandRecord) -> Self {
        Self { offset, record }
    }

    #[inline]
    pub fn offset(&self) -> Offset {
        self.offset
    }

    #[inline]
    pub fn state(&self) -> CommandState {
        self.record.state()
    }

    /// Pid of the child running (or that ran) this command.
    pub fn pid(&self) -> Option<Pid> {
        match self.record.pid.load(Ordering::Acquire) {
            0 => None,
            raw => Some(Pid::from_raw(raw)),
        }
    }

    /// Completion code, once the command is complete.
    pub fn completion(&self) -> Option<i32> {
        (self.state() == CommandState::Complete)
            .then(|| self.record.completion.load(Ordering::Acquire))
    }

    pub fn enqueued_by(&self) -> Pid {
        Pid::from_raw(self.record.enqueued_by.load(Ordering::Relaxed))
    }

    pub fn name(&self) -> &'a [u8] {
        self.string_at(self.record.text_layout().name_off)
    }

    pub fn name_lossy(&self) -> Cow<'a, str> {
        String::from_utf8_lossy(self.name())
    }

    /// True unless the command was submitted as unnamed.
    pub fn is_named(&self) -> bool {
        self.name() != UNNAMED.as_bytes()
    }

    /// The shell code, NUL-terminated for handing to `exec`.
    pub fn code(&self) -> &'a CStr {
        let off = self.record.text_layout().code_off as usize;
        let text = self.record_text();
        text.get(off..)
            .and_then(|rest| CStr::from_bytes_until_nul(rest).ok())
            .unwrap_or(c"")
    }

    /// Dependency names, in submission order.
    pub fn dependencies(&self) -> impl Iterator<Item = &'a [u8]> + use<'a> {
        let layout = self.record.text_layout();
        let deps = if layout.deps_off == 0 {
            &[][..]
        } else {
            self.string_at(layout.deps_off)
        };
        deps.split(|&b| b == b' ').filter(|dep| !dep.is_empty())
    }

    pub(crate) fn record(&self) -> &'a CommandRecord {
        self.record
    }

    fn record_text(&self) -> &'a [u8] {
        self.record.text()
    }

    fn string_at(&self, off: u16) -> &'a [u8] {
        let text = self.record_text();
        let Some(rest) = text.get(off as usize..) else {
            return &[];
        };
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        &rest[..end]
    }
}

impl fmt::Debug for CommandView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandView")
            .field("offset", &self.offset)
            .field("name", &self.name_lossy())
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish()
    }
}
