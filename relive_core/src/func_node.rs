//! Per-address replacement stacks.
//!
//! Nodes live on an RCU-style singly linked list:
//! 1. Readers pin an epoch and walk the list without taking any lock
//! 2. Writers insert at the head and unlink in place, one at a time
//! 3. Unlinked nodes and replaced stacks are destroyed only once every
//!    reader pinned before the unlink has gone
//!
//! A node's stack is an immutable vector swapped as a whole, most recent
//! func first.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};
use parking_lot::Mutex;
use relive_types::Addr;
use tracing::debug;

use crate::error::{Error, Result};
use crate::host::SavedCode;
use crate::patch::LiveFunc;

pub type Stack = Vec<Arc<LiveFunc>>;

pub struct FuncNode {
    old_addr: Addr,
    saved: Option<SavedCode>,
    stack: Atomic<Stack>,
}

impl FuncNode {
    fn new(old_addr: Addr, saved: Option<SavedCode>) -> Self {
        Self {
            old_addr,
            saved,
            stack: Atomic::new(Vec::new()),
        }
    }

    pub fn old_addr(&self) -> Addr {
        self.old_addr
    }

    /// Entry bytes from before the first rewrite, stop-machine mode only.
    pub fn saved(&self) -> Option<&SavedCode> {
        self.saved.as_ref()
    }

    pub fn stack<'g>(&self, guard: &'g Guard) -> &'g [Arc<LiveFunc>] {
        let stack = self.stack.load(Ordering::Acquire, guard);
        // never null, a node is created with an empty stack
        unsafe { stack.as_ref() }.map_or(&[], |s| s.as_slice())
    }

    pub fn top<'g>(&self, guard: &'g Guard) -> Option<&'g Arc<LiveFunc>> {
        self.stack(guard).first()
    }

    pub fn is_empty(&self, guard: &Guard) -> bool {
        self.stack(guard).is_empty()
    }

    /// Publishes `stack` and returns the one it replaced.
    pub(crate) fn swap_stack(&self, stack: Stack, guard: &Guard) -> Stack {
        let old = self.stack.swap(Owned::new(stack), Ordering::AcqRel, guard);
        let prev = unsafe { old.as_ref() }.cloned().unwrap_or_default();
        if !old.is_null() {
            unsafe { guard.defer_destroy(old) };
        }
        prev
    }

    /// Puts `func` on top of the stack.
    pub(crate) fn push(&self, func: Arc<LiveFunc>, guard: &Guard) -> Result<()> {
        let stack = pushed(self.stack(guard), func)?;
        self.swap_stack(stack, guard);
        Ok(())
    }

    /// Takes `func` off the stack wherever it sits. Returns whether the
    /// stack is now empty.
    pub(crate) fn pop(&self, func: &LiveFunc, guard: &Guard) -> bool {
        let stack = removed(self.stack(guard), func);
        let empty = stack.is_empty();
        self.swap_stack(stack, guard);
        empty
    }
}

/// Copy of `stack` with `func` on top.
pub(crate) fn pushed(stack: &[Arc<LiveFunc>], func: Arc<LiveFunc>) -> Result<Stack> {
    let mut next = Vec::new();
    next.try_reserve_exact(stack.len() + 1)
        .map_err(|_| Error::OutOfMemory)?;
    next.push(func);
    next.extend(stack.iter().cloned());
    Ok(next)
}

/// Copy of `stack` without `func`.
pub(crate) fn removed(stack: &[Arc<LiveFunc>], func: &LiveFunc) -> Stack {
    stack
        .iter()
        .filter(|f| !std::ptr::eq(f.as_ref(), func))
        .cloned()
        .collect()
}

impl Drop for FuncNode {
    fn drop(&mut self) {
        // only reached once no reader can see the node
        unsafe {
            let guard = epoch::unprotected();
            let stack = self.stack.load(Ordering::Relaxed, guard);
            if !stack.is_null() {
                drop(stack.into_owned());
            }
        }
    }
}

struct Link {
    node: FuncNode,
    next: Atomic<Link>,
}

pub struct FuncNodes {
    head: Atomic<Link>,
    writer: Mutex<()>,
    len: AtomicUsize,
    unlinked: AtomicUsize,
    reclaimed: Arc<AtomicUsize>,
}

impl Default for FuncNodes {
    fn default() -> Self {
        Self::new()
    }
}

impl FuncNodes {
    pub fn new() -> Self {
        Self {
            head: Atomic::null(),
            writer: Mutex::new(()),
            len: AtomicUsize::new(0),
            unlinked: AtomicUsize::new(0),
            reclaimed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn find<'g>(&self, old_addr: Addr, guard: &'g Guard) -> Option<&'g FuncNode> {
        let mut cur = self.head.load(Ordering::Acquire, guard);
        while let Some(link) = unsafe { cur.as_ref() } {
            if link.node.old_addr == old_addr {
                return Some(&link.node);
            }
            cur = link.next.load(Ordering::Acquire, guard);
        }
        None
    }

    /// Returns the node for `old_addr`, creating it if needed. `save` runs
    /// only for a new node and provides its saved entry bytes.
    pub(crate) fn find_or_create<'g, F>(
        &self,
        old_addr: Addr,
        save: F,
        guard: &'g Guard,
    ) -> Result<(&'g FuncNode, bool)>
    where
        F: FnOnce() -> Result<Option<SavedCode>>,
    {
        let _writer = self.writer.lock();
        if let Some(node) = self.find(old_addr, guard) {
            return Ok((node, false));
        }

        let head = self.head.load(Ordering::Acquire, guard);
        let link = Owned::new(Link {
            node: FuncNode::new(old_addr, save()?),
            next: Atomic::from(head),
        });
        let link = link.into_shared(guard);
        self.head.store(link, Ordering::Release);
        self.len.fetch_add(1, Ordering::Relaxed);
        debug!(addr = %old_addr, "allocated func node");

        // just stored, so non-null
        let node = unsafe { link.deref() };
        Ok((&node.node, true))
    }

    /// Unlinks the node for `old_addr` if its stack is empty. Its memory is
    /// reclaimed once no pinned reader can still reach it.
    pub(crate) fn unlink_if_empty(&self, old_addr: Addr, guard: &Guard) -> bool {
        let _writer = self.writer.lock();

        let mut prev = &self.head;
        loop {
            let cur = prev.load(Ordering::Acquire, guard);
            let link = match unsafe { cur.as_ref() } {
                Some(link) => link,
                None => return false,
            };

            if link.node.old_addr != old_addr {
                prev = &link.next;
                continue;
            }
            if !link.node.is_empty(guard) {
                return false;
            }

            let next = link.next.load(Ordering::Acquire, guard);
            prev.store(next, Ordering::Release);
            self.len.fetch_sub(1, Ordering::Relaxed);
            self.unlinked.fetch_add(1, Ordering::Relaxed);

            let reclaimed = self.reclaimed.clone();
            unsafe {
                guard.defer_unchecked(move || {
                    drop(cur.into_owned());
                    reclaimed.fetch_add(1, Ordering::Relaxed);
                });
            }
            debug!(addr = %old_addr, "unlinked func node");
            return true;
        }
    }

    /// Snapshot of the stack at `old_addr`, most recent first.
    pub fn stack_of(&self, old_addr: Addr) -> Vec<Arc<LiveFunc>> {
        let guard = &epoch::pin();
        self.find(old_addr, guard)
            .map(|node| node.stack(guard).to_vec())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nodes unlinked so far.
    pub fn unlinked(&self) -> usize {
        self.unlinked.load(Ordering::Relaxed)
    }

    /// Unlinked nodes whose memory has been freed.
    pub fn reclaimed(&self) -> usize {
        self.reclaimed.load(Ordering::Relaxed)
    }
}

/// Waits until every reader pinned before the call has unpinned. The
/// caller must not be pinned itself, or the epoch never advances.
pub(crate) fn synchronize() {
    debug_assert!(!epoch::is_pinned());
    let done = Arc::new(AtomicBool::new(false));
    {
        let guard = epoch::pin();
        let flag = done.clone();
        guard.defer(move || flag.store(true, Ordering::Release));
        guard.flush();
    }
    while !done.load(Ordering::Acquire) {
        epoch::pin().flush();
        thread::yield_now();
    }
}

impl Drop for FuncNodes {
    fn drop(&mut self) {
        unsafe {
            let guard = epoch::unprotected();
            let mut cur = self.head.load(Ordering::Relaxed, guard);
            while !cur.is_null() {
                let link = cur.into_owned();
                cur = link.next.load(Ordering::Relaxed, guard);
                drop(link);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relive_types::{FuncId, PatchId};
    use std::sync::mpsc;
    use std::time::Duration;

    fn live(patch: usize, addr: u64) -> Arc<LiveFunc> {
        Arc::new(LiveFunc::new(
            PatchId::new(patch),
            FuncId::new(patch),
            false,
            Addr(addr),
            16,
        ))
    }

    #[test]
    fn push_and_unlink() {
        let nodes = FuncNodes::new();
        let guard = &epoch::pin();

        let (node, created) = nodes.find_or_create(Addr(0x100), || Ok(None), guard).unwrap();
        assert!(created);
        let f1 = live(1, 0x900);
        let f2 = live(2, 0xa00);
        node.push(f1.clone(), guard).unwrap();
        node.push(f2.clone(), guard).unwrap();
        assert_eq!(node.top(guard).unwrap().new_addr(), Addr(0xa00));

        let (again, created) = nodes
            .find_or_create(Addr(0x100), || panic!("saved twice"), guard)
            .unwrap();
        assert!(!created);
        assert_eq!(again.stack(guard).len(), 2);

        assert!(!nodes.unlink_if_empty(Addr(0x100), guard));
        assert!(!node.pop(&f2, guard));
        assert_eq!(node.top(guard).unwrap().new_addr(), Addr(0x900));
        assert!(node.pop(&f1, guard));

        assert!(nodes.unlink_if_empty(Addr(0x100), guard));
        assert!(nodes.find(Addr(0x100), guard).is_none());
        assert_eq!(nodes.len(), 0);
        assert_eq!(nodes.unlinked(), 1);
    }

    #[test]
    fn unlinks_from_middle() {
        let nodes = FuncNodes::new();
        let guard = &epoch::pin();
        for addr in [0x10, 0x20, 0x30] {
            nodes.find_or_create(Addr(addr), || Ok(None), guard).unwrap();
        }
        assert!(nodes.unlink_if_empty(Addr(0x20), guard));
        assert!(nodes.find(Addr(0x10), guard).is_some());
        assert!(nodes.find(Addr(0x30), guard).is_some());
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn readers_never_see_freed_nodes() {
        let nodes = Arc::new(FuncNodes::new());
        let stop = Arc::new(AtomicBool::new(false));
        let addrs: Vec<Addr> = (0..8).map(|i| Addr(0x1000 + i * 0x40)).collect();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let nodes = nodes.clone();
                let stop = stop.clone();
                let addrs = addrs.clone();
                thread::spawn(move || {
                    let mut seen = 0usize;
                    while !stop.load(Ordering::Relaxed) {
                        for &addr in &addrs {
                            let guard = &epoch::pin();
                            if let Some(node) = nodes.find(addr, guard) {
                                assert_eq!(node.old_addr(), addr);
                                for func in node.stack(guard) {
                                    assert_eq!(func.new_size(), 16);
                                    seen += 1;
                                }
                            }
                        }
                    }
                    seen
                })
            })
            .collect();

        for round in 0..2000 {
            let guard = &epoch::pin();
            let func = live(round, 0x8000 + round as u64);
            for &addr in &addrs {
                let (node, _) = nodes.find_or_create(addr, || Ok(None), guard).unwrap();
                node.push(func.clone(), guard).unwrap();
            }
            for &addr in &addrs {
                let node = nodes.find(addr, guard).unwrap();
                node.pop(&func, guard);
                assert!(nodes.unlink_if_empty(addr, guard));
            }
        }

        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }

        assert!(nodes.is_empty());
        assert_eq!(nodes.unlinked(), 2000 * addrs.len());
        assert!(nodes.reclaimed() <= nodes.unlinked());
    }

    #[test]
    fn synchronize_waits_for_pinned_readers() {
        let released = Arc::new(AtomicBool::new(false));
        let (pinned_tx, pinned_rx) = mpsc::channel();
        let reader = {
            let released = released.clone();
            thread::spawn(move || {
                let guard = epoch::pin();
                pinned_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                released.store(true, Ordering::Release);
                drop(guard);
            })
        };

        pinned_rx.recv().unwrap();
        synchronize();
        assert!(released.load(Ordering::Acquire));
        reader.join().unwrap();

        // nobody pinned, returns right away
        synchronize();
    }
}
