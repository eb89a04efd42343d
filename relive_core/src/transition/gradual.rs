//! Consistency-model transition.
//!
//! No text is rewritten. Every call to a patched function goes through
//! [`Registry::redirect`], which picks a body from the function's stack
//! according to the calling task's state. A transition moves tasks one by
//! one once their stacks are clear of the code being retired, and completes
//! when none is left pending.

use std::sync::atomic::{fence, Ordering};
use std::time::{Duration, Instant};

use crossbeam_epoch as epoch;
use relive_types::{Addr, Mode, PatchId, PatchState, TaskId, TaskState};
use tracing::{debug, info, warn};

use super::{
    check_stack_order, discard_nops, move_to_tail, patch_object, post_patch, post_unpatch,
    pre_patch, pre_unpatch, private, unpatch_object, Direction, Strategy,
};
use crate::activeness::{check_task, gradual_ranges};
use crate::error::{Error, Result};
use crate::func_node::synchronize;
use crate::registry::{Core, Inner, Registry};
use crate::task::TaskHandle;

/// Switch tasks over one at a time through per-call redirection.
#[derive(Debug, Clone, Copy)]
pub enum Gradual {}

impl private::Sealed for Gradual {}

impl Strategy for Gradual {
    const MODE: Mode = Mode::Gradual;

    fn enable(core: &Core, id: PatchId) -> Result<()> {
        let mut inner = core.inner.lock();
        enable(core, &mut inner, id)
    }

    fn disable(core: &Core, id: PatchId) -> Result<()> {
        let mut inner = core.inner.lock();
        disable(core, &mut inner, id)
    }
}

fn enable(core: &Core, inner: &mut Inner, id: PatchId) -> Result<()> {
    let patch = inner.patch(id)?;
    match inner.transition {
        Some(t) if t == id && patch.state.heading_enabled() => {
            return Err(Error::AlreadyEnabled(patch.name.clone()))
        }
        Some(t) if t == id => {
            reverse(core, inner);
            return Ok(());
        }
        Some(_) => return Err(Error::Busy),
        None => {}
    }
    if patch.enabled {
        return Err(Error::AlreadyEnabled(patch.name.clone()));
    }
    check_stack_order(core, inner, id, Direction::Enable)?;

    info!(patch = %patch.name, "enabling patch");
    init_transition(core, inner, id, TaskState::Patched);

    // flags and task states must be visible before any func is reachable
    fence(Ordering::Release);

    for obj in inner.objects_of(id) {
        if !inner.object(obj).loaded {
            continue;
        }
        let res = match pre_patch(inner, obj) {
            Ok(()) => patch_object(core, inner, obj),
            Err(err) => Err(err),
        };
        if let Err(err) = res {
            warn!(
                object = inner.object(obj).display_name(),
                %err,
                "failed to patch object"
            );
            cancel_transition(core, inner);
            return Err(err);
        }
    }

    inner.patch_mut(id)?.state = PatchState::Enabling;
    core.tasks.start();
    try_complete(core, inner);
    Ok(())
}

fn disable(core: &Core, inner: &mut Inner, id: PatchId) -> Result<()> {
    let patch = inner.patch(id)?;
    match inner.transition {
        Some(t) if t == id && !patch.state.heading_enabled() => {
            return Err(Error::AlreadyDisabled(patch.name.clone()))
        }
        Some(t) if t == id => {
            reverse(core, inner);
            return Ok(());
        }
        Some(_) => return Err(Error::Busy),
        None => {}
    }
    if !patch.enabled {
        return Err(Error::AlreadyDisabled(patch.name.clone()));
    }
    check_stack_order(core, inner, id, Direction::Disable)?;

    info!(patch = %patch.name, "disabling patch");
    init_transition(core, inner, id, TaskState::Unpatched);

    for obj in inner.objects_of(id) {
        if inner.object(obj).patched {
            pre_unpatch(inner, obj);
        }
    }

    // order the transition flags before the pending flags
    fence(Ordering::Release);

    inner.patch_mut(id)?.state = PatchState::Disabling;
    core.tasks.start();
    try_complete(core, inner);
    Ok(())
}

fn init_transition(core: &Core, inner: &mut Inner, id: PatchId, target: TaskState) {
    inner.transition = Some(id);
    core.tasks.init(target);
    for (func, _) in inner.funcs_of(id) {
        func.live.set_transition(true);
    }
}

/// Backs out of an enable that failed before any task was switched.
fn cancel_transition(core: &Core, inner: &mut Inner) {
    core.tasks.retarget(TaskState::Unpatched);
    complete_transition(core, inner);
}

/// Points the running transition the other way. Tasks already switched
/// become pending again.
fn reverse(core: &Core, inner: &mut Inner) {
    let id = match inner.transition {
        Some(id) => id,
        None => return,
    };
    let target = core.tasks.target().flip();

    if let Ok(patch) = inner.patch_mut(id) {
        patch.state = match patch.state {
            PatchState::Enabling => PatchState::Disabling,
            _ => PatchState::Enabling,
        };
        info!(patch = %patch.name, ?target, "reversing transition");
    }

    core.tasks.retarget(target);
    fence(Ordering::SeqCst);
    core.tasks.start();
    try_complete(core, inner);
}

/// One pass over the pending tasks. Completes the transition once none
/// is left.
fn try_complete(core: &Core, inner: &mut Inner) -> bool {
    let id = match inner.transition {
        Some(id) => id,
        None => return true,
    };
    let target = core.tasks.target();
    let ranges = gradual_ranges(inner, &core.nodes, id, target);

    let mut complete = true;
    for task in core.tasks.pending() {
        if task.state() == target {
            task.set_pending(false);
            continue;
        }
        match check_task(&*core.host.calltrace, task.id(), &ranges) {
            Ok(()) => {
                task.switch(target);
                debug!(task = ?task.id(), ?target, "switched task");
            }
            Err(err) => {
                debug!(task = ?task.id(), %err, "task not switched yet");
                complete = false;
            }
        }
    }

    if complete {
        complete_transition(core, inner);
    }
    complete
}

fn complete_transition(core: &Core, inner: &mut Inner) {
    let id = match inner.transition {
        Some(id) => id,
        None => return,
    };
    let target = core.tasks.target();
    let replace = inner.patch(id).map_or(false, |p| p.replace);

    if target == TaskState::Patched && replace {
        unpatch_replaced(core, inner, id);
        if let Err(err) = discard_nops(core, inner, id) {
            warn!(%err, "failed to discard nops");
        }
    }

    // off the stacks before the flags clear, and no reader still holding
    // the old stack may see a cleared flag
    if target == TaskState::Unpatched {
        for obj in inner.objects_of(id) {
            if inner.object(obj).patched {
                unpatch_object(core, inner, obj);
            }
        }
        synchronize();
    }

    for (func, _) in inner.funcs_of(id) {
        func.live.set_transition(false);
    }
    // readers that saw a set flag must be done with the task states
    if target == TaskState::Patched {
        synchronize();
    }
    core.tasks.reset();

    for obj in inner.objects_of(id) {
        if !inner.object(obj).loaded {
            continue;
        }
        match target {
            TaskState::Patched => post_patch(inner, obj),
            _ => post_unpatch(inner, obj),
        }
    }

    inner.transition = None;
    let state = match target {
        TaskState::Patched => PatchState::Enabled,
        _ => PatchState::Disabled,
    };
    if let Ok(patch) = inner.patch_mut(id) {
        patch.state = state;
        patch.enabled = state == PatchState::Enabled;
        info!(patch = %patch.name, forced = patch.forced, "patch {}", state.as_str());
    }
    if state == PatchState::Enabled {
        move_to_tail(core, inner, id);
    }
}

fn unpatch_replaced(core: &Core, inner: &mut Inner, id: PatchId) {
    for other in inner.order.clone() {
        if other == id || !inner.patch(other).map_or(false, |p| p.enabled) {
            continue;
        }
        for obj in inner.objects_of(other) {
            if inner.object(obj).patched {
                unpatch_object(core, inner, obj);
            }
        }
        if let Ok(patch) = inner.patch_mut(other) {
            patch.state = PatchState::Disabled;
            patch.enabled = false;
            info!(patch = %patch.name, "replaced patch");
        }
    }
}

pub(crate) fn force(core: &Core, inner: &mut Inner, id: PatchId) -> Result<()> {
    let in_transition = inner.transition == Some(id);
    let patch = inner.patch_mut(id)?;
    if !in_transition {
        return Err(Error::NotInTransition(patch.name.clone()));
    }
    patch.forced = true;
    warn!(patch = %patch.name, "forcing transition, task stacks are not verified");

    let target = core.tasks.target();
    for task in core.tasks.all() {
        task.switch(target);
    }
    complete_transition(core, inner);
    Ok(())
}

impl Registry<Gradual> {
    /// Starts tracking a task. Tasks created during a transition start in
    /// its target state.
    pub fn attach_task(&self, id: TaskId) -> TaskHandle {
        self.core.tasks.attach(id)
    }

    pub fn detach_task(&self, id: TaskId) {
        self.core.tasks.detach(id);
    }

    pub fn task(&self, id: TaskId) -> Option<TaskHandle> {
        self.core.tasks.get(id)
    }

    /// Where a call to `addr` made by `task` goes.
    pub fn redirect(&self, task: &TaskHandle, addr: Addr) -> Addr {
        let guard = &epoch::pin();
        let stack = match self.core.nodes.find(addr, guard) {
            Some(node) => node.stack(guard),
            None => return addr,
        };
        let mut func = match stack.first() {
            Some(func) => func,
            None => return addr,
        };

        // pairs with the fence taken before the stack was published
        fence(Ordering::Acquire);
        if func.in_transition() {
            fence(Ordering::Acquire);
            if task.state() == TaskState::Unpatched {
                func = match stack.get(1) {
                    Some(prev) => prev,
                    None => return addr,
                };
            }
        }

        if func.is_nop() {
            addr
        } else {
            func.new_addr()
        }
    }

    /// Switches `task` at a point where it holds no patched frame.
    pub fn update_patch_state(&self, task: &TaskHandle) {
        if task.pending() {
            task.switch(self.core.tasks.target());
        }
    }

    pub fn in_transition(&self) -> Option<PatchId> {
        self.core.inner.lock().transition
    }

    /// Runs one pass. Returns whether no transition is left.
    pub fn try_complete_transition(&self) -> bool {
        let mut inner = self.core.inner.lock();
        try_complete(&self.core, &mut inner)
    }

    /// Runs passes until the transition completes or `timeout` elapses.
    /// The registry lock is not held while sleeping.
    pub fn wait_transition(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_complete_transition() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(self.core.config.poll_interval());
        }
    }

    /// Completes the transition of `id` without checking any stack.
    pub fn force_transition(&self, id: PatchId) -> Result<()> {
        let mut inner = self.core.inner.lock();
        force(&self.core, &mut inner, id)
    }
}
