//! In-memory host for tests and embedders without real text to patch.

use std::collections::{BTreeMap, HashMap, HashSet};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::RwLock;
use relive_types::layout::{JMP_REL32_OPCODE, REPLACE_WINDOW};
use relive_types::{Addr, TaskId};

use crate::host::{Calltrace, CodeRewriter, RewriteError, SavedCode, StackError, SymbolResolver};

#[derive(Debug, Clone)]
struct SimSymbol {
    unit: Option<String>,
    name: String,
    addr: Addr,
    size: u64,
}

/// Symbol table of the base image plus any number of units.
#[derive(Debug, Default)]
pub struct SimSymbols {
    symbols: RwLock<Vec<SimSymbol>>,
    loaded: RwLock<HashSet<String>>,
    patch_units: RwLock<HashSet<String>>,
}

impl SimSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, unit: Option<&str>, name: &str, addr: Addr, size: u64) {
        self.symbols.write().push(SimSymbol {
            unit: unit.map(str::to_owned),
            name: name.to_owned(),
            addr,
            size,
        });
    }

    pub fn load_unit(&self, unit: &str) {
        self.loaded.write().insert(unit.to_owned());
    }

    pub fn unload_unit(&self, unit: &str) {
        self.loaded.write().remove(unit);
    }

    /// Registers `unit` as a loaded patch unit.
    pub fn add_patch_unit(&self, unit: &str) {
        self.patch_units.write().insert(unit.to_owned());
        self.load_unit(unit);
    }
}

impl SymbolResolver for SimSymbols {
    fn each_match(&self, unit: Option<&str>, name: &str, f: &mut dyn FnMut(Addr) -> bool) {
        for sym in self.symbols.read().iter() {
            if sym.unit.as_deref() == unit && sym.name == name && f(sym.addr) {
                break;
            }
        }
    }

    fn symbol_size(&self, addr: Addr) -> Option<u64> {
        self.symbols
            .read()
            .iter()
            .find(|s| s.addr == addr)
            .map(|s| s.size)
    }

    fn unit_loaded(&self, unit: &str) -> bool {
        self.loaded.read().contains(unit)
    }

    fn is_patch_unit(&self, unit: &str) -> bool {
        self.patch_units.read().contains(unit)
    }
}

/// Text as a set of mapped regions. Redirects are encoded the way x86 does
/// it, `jmp rel32` relative to the end of the instruction.
#[derive(Debug, Default)]
pub struct SimText {
    regions: RwLock<BTreeMap<u64, Vec<u8>>>,
    protected: RwLock<HashSet<Addr>>,
    reserved: RwLock<Vec<(Addr, Addr)>>,
    relocs: RwLock<HashMap<Addr, (u32, u64)>>,
}

impl SimText {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `len` bytes of text at `addr`, filled with a recognisable
    /// prologue.
    pub fn map(&self, addr: Addr, len: u64) {
        let bytes = (0..len).map(|i| (addr.0.wrapping_add(i) & 0x7f) as u8).collect();
        self.regions.write().insert(addr.0, bytes);
    }

    /// Makes writes to the entry at `addr` fail.
    pub fn protect(&self, addr: Addr) {
        self.protected.write().insert(addr);
    }

    pub fn unprotect(&self, addr: Addr) {
        self.protected.write().remove(&addr);
    }

    pub fn reserve(&self, start: Addr, end: Addr) {
        self.reserved.write().push((start, end));
    }

    pub fn read(&self, addr: Addr, len: u64) -> Option<Vec<u8>> {
        let regions = self.regions.read();
        let (&start, bytes) = regions.range(..=addr.0).next_back()?;
        let off = (addr.0 - start) as usize;
        let end = off.checked_add(len as usize)?;
        bytes.get(off..end).map(<[u8]>::to_vec)
    }

    fn write(&self, addr: Addr, data: &[u8]) -> Result<(), RewriteError> {
        if self.protected.read().contains(&addr) {
            return Err(RewriteError::Protected(addr));
        }
        let mut regions = self.regions.write();
        let (&start, bytes) = regions
            .range_mut(..=addr.0)
            .next_back()
            .ok_or(RewriteError::Unmapped(addr))?;
        let off = (addr.0 - start) as usize;
        let dst = bytes
            .get_mut(off..off + data.len())
            .ok_or(RewriteError::Unmapped(addr))?;
        dst.copy_from_slice(data);
        Ok(())
    }

    /// Destination of the redirect at `addr`, if one is installed.
    pub fn jump_target(&self, addr: Addr) -> Option<Addr> {
        let entry = self.read(addr, REPLACE_WINDOW)?;
        if entry[0] != JMP_REL32_OPCODE {
            return None;
        }
        let rel = LittleEndian::read_i32(&entry[1..5]);
        Some((addr + REPLACE_WINDOW).offset(rel as i64))
    }

    /// Where a call to `addr` ends up.
    pub fn route(&self, addr: Addr) -> Addr {
        self.jump_target(addr).unwrap_or(addr)
    }

    pub fn reloc_at(&self, place: Addr) -> Option<(u32, u64)> {
        self.relocs.read().get(&place).copied()
    }
}

impl CodeRewriter for SimText {
    fn save_original(&self, addr: Addr, len: u64) -> Result<SavedCode, RewriteError> {
        self.read(addr, len)
            .map(SavedCode)
            .ok_or(RewriteError::Unmapped(addr))
    }

    fn install(&self, addr: Addr, target: Addr) -> Result<(), RewriteError> {
        let rel = target - (addr + REPLACE_WINDOW);
        let rel = i32::try_from(rel)
            .map_err(|_| RewriteError::Other(format!("{} is out of jump range of {}", target, addr)))?;

        let mut insn = [0u8; REPLACE_WINDOW as usize];
        insn[0] = JMP_REL32_OPCODE;
        LittleEndian::write_i32(&mut insn[1..], rel);
        self.write(addr, &insn)
    }

    fn restore(&self, addr: Addr, saved: &SavedCode) -> Result<(), RewriteError> {
        self.write(addr, &saved.0)
    }

    fn write_reloc(&self, place: Addr, kind: u32, value: u64) -> Result<(), RewriteError> {
        self.relocs.write().insert(place, (kind, value));
        Ok(())
    }

    fn text_reserved(&self, start: Addr, end: Addr) -> bool {
        self.reserved
            .read()
            .iter()
            .any(|&(s, e)| s <= end && start <= e)
    }
}

#[derive(Debug, Clone, Default)]
struct SimStack {
    frames: Vec<Addr>,
    error: Option<StackError>,
}

/// Hand-built call stacks.
#[derive(Debug, Default)]
pub struct FrameSet {
    tasks: RwLock<BTreeMap<TaskId, SimStack>>,
}

impl FrameSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&self, task: TaskId) {
        self.tasks.write().entry(task).or_default();
    }

    pub fn remove_task(&self, task: TaskId) {
        self.tasks.write().remove(&task);
    }

    pub fn push_frame(&self, task: TaskId, pc: Addr) {
        self.tasks.write().entry(task).or_default().frames.push(pc);
    }

    pub fn clear_frames(&self, task: TaskId) {
        if let Some(stack) = self.tasks.write().get_mut(&task) {
            stack.frames.clear();
        }
    }

    /// Makes walks of `task` fail with `error` until cleared with `None`.
    pub fn set_error(&self, task: TaskId, error: Option<StackError>) {
        self.tasks.write().entry(task).or_default().error = error;
    }
}

impl Calltrace for FrameSet {
    fn tasks(&self) -> Vec<TaskId> {
        self.tasks.read().keys().copied().collect()
    }

    fn walk(&self, task: TaskId, f: &mut dyn FnMut(Addr) -> bool) -> Result<(), StackError> {
        let tasks = self.tasks.read();
        let stack = match tasks.get(&task) {
            Some(stack) => stack,
            None => return Ok(()),
        };
        if let Some(err) = stack.error {
            return Err(err);
        }
        // innermost frame was pushed last
        for &pc in stack.frames.iter().rev() {
            if !f(pc) {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_encoding() {
        let text = SimText::new();
        text.map(Addr(0x1000), 0x40);
        let saved = text.save_original(Addr(0x1000), 5).unwrap();

        text.install(Addr(0x1000), Addr(0x800)).unwrap();
        let entry = text.read(Addr(0x1000), 5).unwrap();
        assert_eq!(entry[0], 0xe9);
        assert_eq!(LittleEndian::read_i32(&entry[1..]), 0x800 - 0x1005);
        assert_eq!(text.route(Addr(0x1000)), Addr(0x800));

        text.restore(Addr(0x1000), &saved).unwrap();
        assert_eq!(text.read(Addr(0x1000), 5).unwrap(), saved.0);
        assert_eq!(text.route(Addr(0x1000)), Addr(0x1000));
    }

    #[test]
    fn protected_and_unmapped() {
        let text = SimText::new();
        text.map(Addr(0x1000), 0x10);
        text.protect(Addr(0x1000));
        assert_eq!(
            text.install(Addr(0x1000), Addr(0x2000)),
            Err(RewriteError::Protected(Addr(0x1000)))
        );
        assert_eq!(
            text.install(Addr(0x5000), Addr(0x2000)),
            Err(RewriteError::Unmapped(Addr(0x5000)))
        );
        assert!(text.save_original(Addr(0x100e), 5).is_err());
    }

    #[test]
    fn frames_innermost_first() {
        let frames = FrameSet::new();
        let task = TaskId::new(3);
        frames.push_frame(task, Addr(1));
        frames.push_frame(task, Addr(2));

        let mut seen = Vec::new();
        frames.walk(task, &mut |pc| {
            seen.push(pc);
            true
        })
        .unwrap();
        assert_eq!(seen, vec![Addr(2), Addr(1)]);

        frames.set_error(task, Some(StackError::Running));
        assert_eq!(frames.walk(task, &mut |_| true), Err(StackError::Running));
    }
}
