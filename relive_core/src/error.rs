use std::fmt;
use std::time::Duration;

use relive_rela::ParseError;
use relive_types::{Addr, Mode, TaskId};
use thiserror::Error;

use crate::host::{RewriteError, StackError};

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid patch: {0}")]
    InvalidPatch(String),
    #[error("patch {0} is already registered")]
    AlreadyRegistered(String),
    #[error("patch {0} is not registered")]
    NotRegistered(String),
    #[error("patch {0} is still enabled")]
    StillEnabled(String),
    #[error("patch {0} is already enabled")]
    AlreadyEnabled(String),
    #[error("patch {0} is already disabled")]
    AlreadyDisabled(String),
    #[error("another patch is in transition")]
    Busy,
    #[error("patch {0} is not in transition")]
    NotInTransition(String),
    #[error("symbol {name} not found in {unit}")]
    SymbolNotFound { unit: String, name: String },
    #[error("unresolvable ambiguity for symbol {name} in {unit}: {count} matches")]
    AmbiguousSymbol {
        unit: String,
        name: String,
        count: usize,
    },
    #[error("symbol position {sympos} for {name} in {unit} not found, only {count} matches")]
    SymposMismatch {
        unit: String,
        name: String,
        sympos: u64,
        count: usize,
    },
    #[error("section {section} may not reference base image symbol {symbol}")]
    CrossScopeReference { section: String, symbol: String },
    #[error("task {task:?} {conflict}")]
    ActivenessConflict { task: TaskId, conflict: Conflict },
    #[error("{0}")]
    StackOrderViolation(String),
    #[error("failed to rewrite text at {addr}")]
    RewriteFailed {
        addr: Addr,
        #[source]
        source: RewriteError,
    },
    #[error("out of memory")]
    OutOfMemory,
    #[error("processing units failed to rendezvous within {0:?}")]
    QuiesceTimeout(Duration),
    #[error("callback of object {object} failed: {msg}")]
    Callback { object: String, msg: String },
    #[error("bad relocation section")]
    BadRelocation(#[from] ParseError),
    #[error("no such attribute: {0}")]
    NoSuchAttribute(String),
    #[error("invalid value: {0:?}")]
    InvalidValue(String),
    #[error("not available with the {0:?} strategy")]
    WrongMode(Mode),
}

/// What made the activeness check refuse a switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// A return address inside code about to change.
    Frame { func: String, pc: Addr },
    /// The stack could not be inspected.
    Stack(StackError),
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::Frame { func, pc } => write!(f, "is active in {} at {}", func, pc),
            Conflict::Stack(err) => write!(f, "can't be checked: {}", err),
        }
    }
}

impl Error {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Busy | Error::ActivenessConflict { .. } | Error::QuiesceTimeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
