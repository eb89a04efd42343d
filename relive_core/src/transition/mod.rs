//! Switching patches on and off.
//!
//! The strategy is chosen when the registry is built, as the type parameter
//! of [`Registry`](crate::Registry). The helpers here are shared by both:
//! stack maintenance, callbacks and ordering rules.

use crossbeam_epoch::{self as epoch, Guard};
use relive_types::{Addr, FuncId, Mode, ObjectId, PatchId};
use tracing::warn;

use crate::error::{Error, Result};
use crate::func_node::FuncNode;
use crate::host::SavedCode;
use crate::patch::ObjectInfo;
use crate::registry::{Core, Inner};

pub mod atomic;
pub mod gradual;

pub use atomic::StopMachine;
pub use gradual::Gradual;

mod private {
    pub trait Sealed {}
}

/// A way of switching a patch on and off.
pub trait Strategy: private::Sealed + Send + Sync + 'static {
    const MODE: Mode;

    #[doc(hidden)]
    fn enable(core: &Core, id: PatchId) -> Result<()>;

    #[doc(hidden)]
    fn disable(core: &Core, id: PatchId) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Enable,
    Disable,
}

/// Only the earliest disabled patch may be enabled and only the latest
/// enabled one may be disabled.
pub(crate) fn check_stack_order(
    core: &Core,
    inner: &Inner,
    id: PatchId,
    dir: Direction,
) -> Result<()> {
    if !core.config.stack_discipline {
        return Ok(());
    }
    let pos = match inner.order.iter().position(|&p| p == id) {
        Some(pos) => pos,
        None => return Ok(()),
    };

    match dir {
        Direction::Enable if pos > 0 => {
            let prev = inner.patch(inner.order[pos - 1])?;
            if !prev.enabled {
                return Err(Error::StackOrderViolation(format!(
                    "only the first disabled patch can be enabled, {} comes first",
                    prev.name
                )));
            }
        }
        Direction::Disable => {
            if let Some(&next) = inner.order.get(pos + 1) {
                let next = inner.patch(next)?;
                if next.enabled {
                    return Err(Error::StackOrderViolation(format!(
                        "only the last enabled patch can be disabled, {} is enabled",
                        next.name
                    )));
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Moves a freshly enabled patch to the end of the list.
pub(crate) fn move_to_tail(core: &Core, inner: &mut Inner, id: PatchId) {
    if core.config.stack_discipline {
        return;
    }
    inner.order.retain(|&p| p != id);
    inner.order.push(id);
}

fn with_info<R>(inner: &Inner, obj: ObjectId, f: impl FnOnce(&ObjectInfo<'_>, &crate::patch::Callbacks) -> R) -> R {
    let object = inner.object(obj);
    let patch = inner
        .patches
        .get(object.patch)
        .and_then(Option::as_ref)
        .map_or("", |p| p.name.as_str());
    let info = ObjectInfo {
        patch,
        object: object.display_name(),
    };
    f(&info, &object.callbacks)
}

pub(crate) fn pre_patch(inner: &mut Inner, obj: ObjectId) -> Result<()> {
    let res = with_info(inner, obj, |info, cb| match &cb.pre_patch {
        Some(pre) => pre(info).map_err(|msg| Error::Callback {
            object: info.object.to_owned(),
            msg,
        }),
        None => Ok(()),
    });
    if res.is_ok() {
        inner.object_mut(obj).callbacks_enabled = true;
    }
    res
}

pub(crate) fn post_patch(inner: &Inner, obj: ObjectId) {
    if inner.object(obj).callbacks_enabled {
        with_info(inner, obj, |info, cb| cb.post_patch.as_ref().map(|f| f(info)));
    }
}

pub(crate) fn pre_unpatch(inner: &Inner, obj: ObjectId) {
    if inner.object(obj).callbacks_enabled {
        with_info(inner, obj, |info, cb| cb.pre_unpatch.as_ref().map(|f| f(info)));
    }
}

pub(crate) fn post_unpatch(inner: &mut Inner, obj: ObjectId) {
    if inner.object(obj).callbacks_enabled {
        with_info(inner, obj, |info, cb| cb.post_unpatch.as_ref().map(|f| f(info)));
    }
    inner.object_mut(obj).callbacks_enabled = false;
}

/// Entry bytes to keep for a new node. Only rewritten text needs them.
pub(crate) fn save_entry(core: &Core, addr: Addr) -> Result<Option<SavedCode>> {
    if core.mode == Mode::Gradual {
        return Ok(None);
    }
    core.host
        .text
        .save_original(addr, core.config.replace_window)
        .map(Some)
        .map_err(|source| Error::RewriteFailed { addr, source })
}

/// Points the entry of `node` at its top func, or back at the original
/// code. A no-op when calls are redirected rather than rewritten.
pub(crate) fn sync_entry(core: &Core, node: &FuncNode, guard: &Guard) -> Result<()> {
    if core.mode == Mode::Gradual {
        return Ok(());
    }
    let addr = node.old_addr();
    let res = match node.top(guard).filter(|top| !top.is_nop()) {
        Some(top) => core.host.text.install(addr, top.new_addr()),
        None => match node.saved() {
            Some(saved) => core.host.text.restore(addr, saved),
            None => Ok(()),
        },
    };
    res.map_err(|source| Error::RewriteFailed { addr, source })
}

fn patch_func(core: &Core, inner: &mut Inner, fid: FuncId, guard: &Guard) -> Result<()> {
    let func = inner.func(fid);
    let old_addr = func
        .old_addr
        .ok_or_else(|| Error::InvalidPatch(format!("{} is not resolved", func.old_name)))?;

    let (node, _) = core
        .nodes
        .find_or_create(old_addr, || save_entry(core, old_addr), guard)?;
    node.push(func.live.clone(), guard)?;
    if let Err(err) = sync_entry(core, node, guard) {
        node.pop(&func.live, guard);
        core.nodes.unlink_if_empty(old_addr, guard);
        return Err(err);
    }

    inner.func_mut(fid).patched = true;
    Ok(())
}

pub(crate) fn unpatch_func(core: &Core, inner: &mut Inner, fid: FuncId, guard: &Guard) {
    let func = inner.func(fid);
    let old_addr = match (func.patched, func.old_addr) {
        (true, Some(addr)) => addr,
        _ => return,
    };

    if let Some(node) = core.nodes.find(old_addr, guard) {
        node.pop(&func.live, guard);
        if let Err(err) = sync_entry(core, node, guard) {
            warn!(
                object = inner.object(func.object).display_name(),
                func = %func.old_name,
                %err,
                "failed to revert entry"
            );
        }
    }
    core.nodes.unlink_if_empty(old_addr, guard);
    inner.func_mut(fid).patched = false;
}

/// Puts every func of `obj` on its stack. On failure the object is left
/// as it was.
pub(crate) fn patch_object(core: &Core, inner: &mut Inner, obj: ObjectId) -> Result<()> {
    let guard = &epoch::pin();
    let funcs = inner.object(obj).funcs.clone();
    let mut done = Vec::with_capacity(funcs.len());

    for fid in funcs {
        if inner.func(fid).patched {
            continue;
        }
        if let Err(err) = patch_func(core, inner, fid, guard) {
            for &fid in done.iter().rev() {
                unpatch_func(core, inner, fid, guard);
            }
            return Err(err);
        }
        done.push(fid);
    }

    inner.object_mut(obj).patched = true;
    Ok(())
}

pub(crate) fn unpatch_object(core: &Core, inner: &mut Inner, obj: ObjectId) {
    let guard = &epoch::pin();
    let funcs = inner.object(obj).funcs.clone();
    for fid in funcs.into_iter().rev() {
        unpatch_func(core, inner, fid, guard);
    }
    inner.object_mut(obj).patched = false;
}

/// Frees the nops of a replace patch, and the objects made only for them.
pub(crate) fn discard_nops(core: &Core, inner: &mut Inner, id: PatchId) -> Result<()> {
    let guard = &epoch::pin();
    let objects = inner.patch(id)?.objects.clone();

    for obj in objects {
        let funcs = inner.object(obj).funcs.clone();
        for fid in funcs {
            if !inner.func(fid).is_nop() {
                continue;
            }
            unpatch_func(core, inner, fid, guard);
            inner.object_mut(obj).funcs.retain(|&f| f != fid);
            inner.funcs[fid] = None;
        }

        let object = inner.object(obj);
        if object.dynamic && object.funcs.is_empty() {
            inner.patch_mut(id)?.objects.retain(|&o| o != obj);
            inner.objects[obj] = None;
        }
    }
    Ok(())
}
