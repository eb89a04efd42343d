//! Interfaces to the system being patched.
//!
//! The engine never touches text, symbol tables or stacks itself. A host
//! supplies one implementation of each trait here, bundled in a [`Host`].

use std::sync::Arc;
use std::time::Duration;

use relive_types::{Addr, TaskId};
use thiserror::Error;

use crate::error::Result;

/// Looks up symbols of the running system.
pub trait SymbolResolver: Send + Sync {
    /// Calls `f` with the address of every symbol named `name` in `unit`
    /// (`None` for the base image), in symbol table order, until `f`
    /// returns `true`.
    fn each_match(&self, unit: Option<&str>, name: &str, f: &mut dyn FnMut(Addr) -> bool);

    /// Size of the symbol starting at `addr`.
    fn symbol_size(&self, addr: Addr) -> Option<u64>;

    fn unit_loaded(&self, unit: &str) -> bool;

    /// Whether `unit` was built as a patch and may register one.
    fn is_patch_unit(&self, unit: &str) -> bool;
}

/// Original bytes of a function entry, as saved before the first rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedCode(pub Vec<u8>);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RewriteError {
    #[error("{0} is not mapped text")]
    Unmapped(Addr),
    #[error("text at {0} is write-protected")]
    Protected(Addr),
    #[error("relocation type {kind} is not supported")]
    UnsupportedReloc { kind: u32 },
    #[error("{0}")]
    Other(String),
}

/// Writes function entries and relocations.
pub trait CodeRewriter: Send + Sync {
    fn save_original(&self, addr: Addr, len: u64) -> std::result::Result<SavedCode, RewriteError>;

    /// Splices a redirect to `target` into the entry at `addr`.
    fn install(&self, addr: Addr, target: Addr) -> std::result::Result<(), RewriteError>;

    fn restore(&self, addr: Addr, saved: &SavedCode) -> std::result::Result<(), RewriteError>;

    fn write_reloc(&self, place: Addr, kind: u32, value: u64)
        -> std::result::Result<(), RewriteError>;

    /// Whether `[start, end]` overlaps text owned by another patching
    /// mechanism (static keys, static calls).
    fn text_reserved(&self, start: Addr, end: Addr) -> bool;
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    #[error("task is running")]
    Running,
    #[error("stack is unreliable")]
    Unreliable,
}

/// Inspects call stacks.
pub trait Calltrace: Send + Sync {
    /// Every task whose stack the stop-machine check must look at.
    fn tasks(&self) -> Vec<TaskId>;

    /// Calls `f` with each return address on `task`'s stack, innermost
    /// first, until `f` returns `false`.
    fn walk(
        &self,
        task: TaskId,
        f: &mut dyn FnMut(Addr) -> bool,
    ) -> std::result::Result<(), StackError>;
}

/// Global quiescence: stop every processing unit but the caller.
pub trait Quiesce: Send + Sync {
    /// Runs `f` while all other units are parked. Fails with
    /// `Error::QuiesceTimeout` if they don't park within `timeout`.
    fn stop_machine(&self, timeout: Duration, f: &mut dyn FnMut() -> Result<()>) -> Result<()>;
}

#[derive(Clone)]
pub struct Host {
    pub symbols: Arc<dyn SymbolResolver>,
    pub text: Arc<dyn CodeRewriter>,
    pub calltrace: Arc<dyn Calltrace>,
    pub quiesce: Arc<dyn Quiesce>,
}
