//! Stop-the-world replace.
//!
//! Entries are rewritten in place while every other processing unit is
//! parked. Preparation happens under the registry lock, the barrier wait
//! does not hold it.

use crossbeam_epoch::{self as epoch, Guard};
use relive_types::{Addr, FuncId, Mode, PatchId, PatchState};
use tracing::{info, warn};

use super::{
    check_stack_order, discard_nops, move_to_tail, post_patch, post_unpatch, pre_patch,
    pre_unpatch, private, save_entry, sync_entry, Direction, Strategy,
};
use crate::activeness::{check_calltrace, stop_machine_ranges};
use crate::error::{Error, Result};
use crate::func_node::{pushed, removed, FuncNode, Stack};
use crate::registry::{Core, Inner};

/// Rewrite entries under a global quiescence barrier.
#[derive(Debug, Clone, Copy)]
pub enum StopMachine {}

impl private::Sealed for StopMachine {}

impl Strategy for StopMachine {
    const MODE: Mode = Mode::StopMachine;

    fn enable(core: &Core, id: PatchId) -> Result<()> {
        switch(core, id, Direction::Enable)
    }

    fn disable(core: &Core, id: PatchId) -> Result<()> {
        switch(core, id, Direction::Disable)
    }
}

/// What a committed switch touched.
#[derive(Debug, Default)]
struct Committed {
    addrs: Vec<Addr>,
}

fn switch(core: &Core, id: PatchId, dir: Direction) -> Result<()> {
    let prepared = {
        let mut inner = core.inner.lock();
        let patch = inner.patch(id)?;
        if inner.transition.is_some() {
            return Err(Error::Busy);
        }
        match dir {
            Direction::Enable if patch.enabled => {
                return Err(Error::AlreadyEnabled(patch.name.clone()))
            }
            Direction::Disable if !patch.enabled => {
                return Err(Error::AlreadyDisabled(patch.name.clone()))
            }
            _ => {}
        }
        check_stack_order(core, &inner, id, dir)?;

        let prepared = match dir {
            Direction::Enable => prepare(core, &mut inner, id)?,
            Direction::Disable => {
                for obj in inner.objects_of(id) {
                    if inner.object(obj).patched {
                        pre_unpatch(&inner, obj);
                    }
                }
                Vec::new()
            }
        };

        info!(patch = %inner.patch(id)?.name, ?dir, "switching patch");
        inner.transition = Some(id);
        prepared
    };

    let window = core.config.replace_window;
    let mut committed = None;
    let res = core
        .host
        .quiesce
        .stop_machine(core.config.quiesce_timeout(), &mut || -> Result<()> {
            let mut inner = core.inner.lock();
            let ranges = stop_machine_ranges(&inner, &core.nodes, window, id, dir);
            check_calltrace(&*core.host.calltrace, &ranges)?;
            committed = Some(commit(core, &mut inner, id, dir)?);
            Ok(())
        });

    let mut inner = core.inner.lock();
    inner.transition = None;
    core.idle.notify_all();

    let guard = &epoch::pin();
    match res {
        Ok(()) => {
            let committed = committed.unwrap_or_default();
            finish(core, &mut inner, id, dir)?;
            for addr in committed.addrs {
                core.nodes.unlink_if_empty(addr, guard);
            }
            info!(patch = %inner.patch(id)?.name, "patch {}", inner.patch(id)?.state.as_str());
            Ok(())
        }
        Err(err) => {
            warn!(patch = %inner.patch(id)?.name, %err, "switch aborted");
            // close whichever callback pair was opened above
            for obj in inner.objects_of(id) {
                match dir {
                    Direction::Enable => post_unpatch(&mut inner, obj),
                    Direction::Disable if inner.object(obj).patched => post_patch(&inner, obj),
                    Direction::Disable => {}
                }
            }
            for addr in prepared {
                core.nodes.unlink_if_empty(addr, guard);
            }
            Err(err)
        }
    }
}

/// Allocates the nodes the switch will need, saving their entries, and
/// runs the pre-patch callbacks. Returns the nodes created.
fn prepare(core: &Core, inner: &mut Inner, id: PatchId) -> Result<Vec<Addr>> {
    let guard = &epoch::pin();
    let mut created = Vec::new();

    let res = match alloc_nodes(core, inner, id, &mut created, guard) {
        Ok(()) => pre_patch_loaded(inner, id),
        Err(err) => Err(err),
    };
    if let Err(err) = res {
        for obj in inner.objects_of(id) {
            post_unpatch(inner, obj);
        }
        for &addr in &created {
            core.nodes.unlink_if_empty(addr, guard);
        }
        return Err(err);
    }
    Ok(created)
}

fn alloc_nodes(
    core: &Core,
    inner: &Inner,
    id: PatchId,
    created: &mut Vec<Addr>,
    guard: &Guard,
) -> Result<()> {
    for (func, _) in inner.loaded_funcs(id) {
        let old_addr = match func.old_addr {
            Some(addr) if !func.is_nop() => addr,
            _ => continue,
        };
        let (_, new) = core
            .nodes
            .find_or_create(old_addr, || save_entry(core, old_addr), guard)?;
        if new {
            created.push(old_addr);
        }
    }
    Ok(())
}

fn pre_patch_loaded(inner: &mut Inner, id: PatchId) -> Result<()> {
    for obj in inner.objects_of(id) {
        if inner.object(obj).loaded {
            pre_patch(inner, obj)?;
        }
    }
    Ok(())
}

/// Staged stacks, published together.
#[derive(Default)]
struct Staging {
    stacks: Vec<(Addr, Stack)>,
}

impl Staging {
    fn get(&mut self, core: &Core, addr: Addr, guard: &Guard) -> &mut Stack {
        let pos = match self.stacks.iter().position(|(a, _)| *a == addr) {
            Some(pos) => pos,
            None => {
                let current = core
                    .nodes
                    .find(addr, guard)
                    .map(|node| node.stack(guard).to_vec())
                    .unwrap_or_default();
                self.stacks.push((addr, current));
                self.stacks.len() - 1
            }
        };
        &mut self.stacks[pos].1
    }
}

/// Runs inside the barrier. Either every entry ends up switched or none
/// does.
fn commit(core: &Core, inner: &mut Inner, id: PatchId, dir: Direction) -> Result<Committed> {
    let guard = &epoch::pin();
    let mut staging = Staging::default();
    let mut patched: Vec<FuncId> = Vec::new();
    let mut unpatched: Vec<FuncId> = Vec::new();
    let mut replaced: Vec<PatchId> = Vec::new();

    match dir {
        Direction::Enable => {
            for obj in inner.objects_of(id) {
                let object = inner.object(obj);
                if !object.loaded {
                    continue;
                }
                for &fid in &object.funcs {
                    let func = inner.func(fid);
                    // nops only shadow older patches, which are unpatched below
                    if func.patched || func.is_nop() {
                        continue;
                    }
                    if let Some(addr) = func.old_addr {
                        let stack = staging.get(core, addr, guard);
                        *stack = pushed(stack, func.live.clone())?;
                        patched.push(fid);
                    }
                }
            }

            if inner.patch(id)?.replace {
                for &other in &inner.order {
                    if other == id || !inner.patch(other)?.enabled {
                        continue;
                    }
                    for (func, _) in inner.funcs_of(other) {
                        if let (true, Some(addr)) = (func.patched, func.old_addr) {
                            let stack = staging.get(core, addr, guard);
                            *stack = removed(stack, &func.live);
                            unpatched.push(func.live.func);
                        }
                    }
                    replaced.push(other);
                }
            }
        }
        Direction::Disable => {
            for (func, _) in inner.funcs_of(id) {
                if let (true, Some(addr)) = (func.patched, func.old_addr) {
                    let stack = staging.get(core, addr, guard);
                    *stack = removed(stack, &func.live);
                    unpatched.push(func.live.func);
                }
            }
        }
    }

    let mut published: Vec<(&FuncNode, Stack)> = Vec::with_capacity(staging.stacks.len());
    let mut addrs = Vec::with_capacity(staging.stacks.len());
    for (addr, stack) in staging.stacks {
        let res = core
            .nodes
            .find_or_create(addr, || save_entry(core, addr), guard)
            .and_then(|(node, _)| {
                published.push((node, node.swap_stack(stack, guard)));
                sync_entry(core, node, guard)
            });
        if let Err(err) = res {
            rollback(core, published, guard);
            return Err(err);
        }
        addrs.push(addr);
    }

    for fid in patched {
        inner.func_mut(fid).patched = true;
    }
    for fid in unpatched {
        inner.func_mut(fid).patched = false;
    }
    for other in replaced {
        for obj in inner.objects_of(other) {
            inner.object_mut(obj).patched = false;
        }
        let patch = inner.patch_mut(other)?;
        patch.state = PatchState::Disabled;
        patch.enabled = false;
        info!(patch = %patch.name, "replaced patch");
    }

    let enabled = dir == Direction::Enable;
    for obj in inner.objects_of(id) {
        let object = inner.object_mut(obj);
        object.patched = enabled && object.loaded;
    }
    let patch = inner.patch_mut(id)?;
    patch.enabled = enabled;
    patch.state = if enabled {
        PatchState::Enabled
    } else {
        PatchState::Disabled
    };

    Ok(Committed { addrs })
}

fn rollback(core: &Core, published: Vec<(&FuncNode, Stack)>, guard: &Guard) {
    for (node, prev) in published.into_iter().rev() {
        node.swap_stack(prev, guard);
        if let Err(err) = sync_entry(core, node, guard) {
            warn!(addr = %node.old_addr(), %err, "failed to roll back entry");
        }
    }
}

/// Post-barrier bookkeeping of a successful switch.
fn finish(core: &Core, inner: &mut Inner, id: PatchId, dir: Direction) -> Result<()> {
    match dir {
        Direction::Enable => {
            for obj in inner.objects_of(id) {
                if inner.object(obj).loaded {
                    post_patch(inner, obj);
                }
            }
            if inner.patch(id)?.replace {
                discard_nops(core, inner, id)?;
            }
            move_to_tail(core, inner, id);
        }
        Direction::Disable => {
            for obj in inner.objects_of(id) {
                post_unpatch(inner, obj);
            }
        }
    }
    Ok(())
}
