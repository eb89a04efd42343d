//! Decides whether a switch may be committed given the call stacks.

use crossbeam_epoch as epoch;
use relive_types::{Addr, ForceLevel, PatchId, TaskId, TaskState};
use tracing::debug;

use crate::error::{Conflict, Error, Result};
use crate::func_node::FuncNodes;
use crate::host::Calltrace;
use crate::registry::Inner;
use crate::transition::Direction;

/// Code that must not hold a return address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Range {
    pub start: Addr,
    pub len: u64,
    pub func: String,
}

fn size_to_check(size: u64, force: ForceLevel, window: u64) -> u64 {
    match force {
        ForceLevel::Window => size.min(window),
        _ => size,
    }
}

/// Ranges for a stop-machine switch of `patch`.
///
/// Enabling rewrites the entry of whatever is active now, the old function
/// or the top of its stack. Disabling retires the patch's own bodies and
/// rewrites the old entry once more.
pub(crate) fn stop_machine_ranges(
    inner: &Inner,
    nodes: &FuncNodes,
    window: u64,
    patch: PatchId,
    dir: Direction,
) -> Vec<Range> {
    let guard = &epoch::pin();
    let mut ranges = Vec::new();

    for (func, _) in inner.loaded_funcs(patch) {
        let old_addr = match func.old_addr {
            Some(addr) => addr,
            None => continue,
        };

        match dir {
            Direction::Enable => {
                if func.patched || func.force == ForceLevel::Waive {
                    continue;
                }
                let top = nodes
                    .find(old_addr, guard)
                    .and_then(|node| node.top(guard))
                    .filter(|top| !top.is_nop());
                let (start, size) = match top {
                    Some(top) => (top.new_addr(), top.new_size()),
                    None => (old_addr, func.old_size),
                };
                ranges.push(Range {
                    start,
                    len: size_to_check(size, func.force, window),
                    func: func.old_name.clone(),
                });
            }
            Direction::Disable => {
                if !func.patched {
                    continue;
                }
                if !func.is_nop() {
                    ranges.push(Range {
                        start: func.live.new_addr(),
                        len: func.live.new_size(),
                        func: func.old_name.clone(),
                    });
                }
                ranges.push(Range {
                    start: old_addr,
                    len: func.old_size.min(window),
                    func: func.old_name.clone(),
                });
            }
        }
    }
    ranges
}

/// Ranges a task must be out of before it may switch to `target`.
pub(crate) fn gradual_ranges(
    inner: &Inner,
    nodes: &FuncNodes,
    patch: PatchId,
    target: TaskState,
) -> Vec<Range> {
    let guard = &epoch::pin();
    let mut ranges = Vec::new();

    for (func, _) in inner.loaded_funcs(patch) {
        let old_addr = match func.old_addr {
            Some(addr) => addr,
            None => continue,
        };

        let (start, len) = if target == TaskState::Unpatched {
            (func.live.new_addr(), func.live.new_size())
        } else {
            // whatever this func shadows on the stack
            let prev = nodes.find(old_addr, guard).and_then(|node| {
                let stack = node.stack(guard);
                let pos = stack.iter().position(|f| f.func == func.live.func)?;
                stack.get(pos + 1).cloned()
            });
            match prev {
                Some(prev) if !prev.is_nop() => (prev.new_addr(), prev.new_size()),
                _ => (old_addr, func.old_size),
            }
        };
        ranges.push(Range {
            start,
            len,
            func: func.old_name.clone(),
        });
    }
    ranges
}

/// Walks `task`'s stack against `ranges`.
pub(crate) fn check_task(calltrace: &dyn Calltrace, task: TaskId, ranges: &[Range]) -> Result<()> {
    let mut hit = None;
    calltrace
        .walk(task, &mut |pc| {
            hit = ranges.iter().find(|r| pc.within(r.start, r.len)).map(|r| Conflict::Frame {
                func: r.func.clone(),
                pc,
            });
            hit.is_none()
        })
        .map_err(|err| Error::ActivenessConflict {
            task,
            conflict: Conflict::Stack(err),
        })?;

    match hit {
        Some(conflict) => {
            debug!(?task, %conflict, "activeness conflict");
            Err(Error::ActivenessConflict { task, conflict })
        }
        None => Ok(()),
    }
}

/// Checks every task the host knows about.
pub(crate) fn check_calltrace(calltrace: &dyn Calltrace, ranges: &[Range]) -> Result<()> {
    if ranges.is_empty() {
        return Ok(());
    }
    for task in calltrace.tasks() {
        check_task(calltrace, task, ranges)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::FrameSet;
    use crate::host::StackError;

    fn ranges() -> Vec<Range> {
        vec![Range {
            start: Addr(0x1000),
            len: 5,
            func: "do_work".into(),
        }]
    }

    #[test]
    fn frame_inside_window_conflicts() {
        let frames = FrameSet::new();
        let task = TaskId::new(1);
        frames.push_frame(task, Addr(0x5000));
        frames.push_frame(task, Addr(0x1004));

        let err = check_calltrace(&frames, &ranges()).unwrap_err();
        match err {
            Error::ActivenessConflict {
                task: t,
                conflict: Conflict::Frame { func, pc },
            } => {
                assert_eq!(t, task);
                assert_eq!(func, "do_work");
                assert_eq!(pc, Addr(0x1004));
            }
            other => panic!("unexpected {:?}", other),
        }

        frames.clear_frames(task);
        frames.push_frame(task, Addr(0x1005));
        check_calltrace(&frames, &ranges()).unwrap();
    }

    #[test]
    fn unreliable_stack_conflicts() {
        let frames = FrameSet::new();
        let task = TaskId::new(2);
        frames.set_error(task, Some(StackError::Unreliable));
        assert!(matches!(
            check_calltrace(&frames, &ranges()),
            Err(Error::ActivenessConflict {
                conflict: Conflict::Stack(StackError::Unreliable),
                ..
            })
        ));
        // nothing to check, nothing to walk
        check_calltrace(&frames, &[]).unwrap();
    }
}
