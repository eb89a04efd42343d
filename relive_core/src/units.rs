//! Code units coming and going while patches are registered.

use relive_types::layout::BASE_OBJECT_NAME;
use relive_types::{Mode, ObjectId, PatchId, PatchState};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::registry::{Inner, Registry};
use crate::transition::{self, Strategy};

impl<S: Strategy> Registry<S> {
    /// Called by the loader once `unit` is in memory and before it runs.
    /// Every registered patch with an object for the unit gets it resolved,
    /// and patched if the patch is live. On failure no patch keeps the unit.
    pub fn unit_coming(&self, unit: &str) -> Result<()> {
        if unit == BASE_OBJECT_NAME {
            return Err(Error::InvalidValue(unit.to_owned()));
        }

        let mut inner = self.core.inner.lock();
        self.wait_idle(&mut inner);

        let mut done = Vec::new();
        for pid in inner.order.clone() {
            for obj in inner.objects_of(pid) {
                let object = inner.object(obj);
                if object.name.as_deref() != Some(unit) || object.loaded {
                    continue;
                }

                inner.object_mut(obj).loaded = true;
                if let Err(err) = self.coming_object(&mut inner, pid, obj) {
                    warn!(
                        patch = inner.patch(pid).map_or("", |p| p.name.as_str()),
                        unit,
                        %err,
                        "failed to apply patch to unit"
                    );
                    self.core.free_object_loaded(&mut inner, obj);
                    for &(pid, obj) in done.iter().rev() {
                        self.going_object(&mut inner, pid, obj);
                    }
                    return Err(err);
                }
                done.push((pid, obj));
            }
        }

        if !done.is_empty() {
            info!(unit, patches = done.len(), "unit patched");
        }
        Ok(())
    }

    /// Called by the loader before `unit` is torn down.
    pub fn unit_going(&self, unit: &str) {
        let mut inner = self.core.inner.lock();
        self.wait_idle(&mut inner);

        for pid in inner.order.clone() {
            for obj in inner.objects_of(pid) {
                let object = inner.object(obj);
                if object.name.as_deref() == Some(unit) && object.loaded {
                    self.going_object(&mut inner, pid, obj);
                }
            }
        }
    }

    // a stop-machine switch runs without the lock, don't change objects
    // under it
    fn wait_idle(&self, inner: &mut parking_lot::MutexGuard<'_, Inner>) {
        if S::MODE == Mode::StopMachine {
            while inner.transition.is_some() {
                self.core.idle.wait(inner);
            }
        }
    }

    fn is_live(inner: &Inner, pid: PatchId) -> bool {
        inner
            .patch(pid)
            .map_or(false, |p| p.state != PatchState::Disabled)
    }

    fn coming_object(&self, inner: &mut Inner, pid: PatchId, obj: ObjectId) -> Result<()> {
        self.core.init_object_loaded(inner, obj)?;
        if !Self::is_live(inner, pid) {
            return Ok(());
        }

        transition::pre_patch(inner, obj)?;
        if let Err(err) = transition::patch_object(&self.core, inner, obj) {
            transition::post_unpatch(inner, obj);
            return Err(err);
        }
        // a transition in progress runs post-patch on completion
        if inner.transition != Some(pid) {
            transition::post_patch(inner, obj);
        }
        Ok(())
    }

    fn going_object(&self, inner: &mut Inner, pid: PatchId, obj: ObjectId) {
        if inner.object(obj).patched {
            if inner.transition != Some(pid) {
                transition::pre_unpatch(inner, obj);
            }
            transition::unpatch_object(&self.core, inner, obj);
            transition::post_unpatch(inner, obj);
        }
        self.core.free_object_loaded(inner, obj);
    }
}
