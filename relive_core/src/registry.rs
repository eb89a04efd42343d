use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use index_vec::IndexVec;
use parking_lot::{Condvar, Mutex};
use relive_types::layout::{BASE_OBJECT_NAME, SYMBOL_NAME_LEN, UNIT_NAME_LEN};
use relive_types::{Addr, FuncId, Mode, ObjectId, PatchId, PatchState};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::func_node::FuncNodes;
use crate::host::Host;
use crate::patch::{Callbacks, Func, LiveFunc, Object, ObjectDesc, ObjectInfo, Patch, PatchDesc};
use crate::resolve::{apply_section, find_symbol, sections_for};
use crate::status::{FuncStatus, ObjectStatus, PatchStatus, StateRow, StateTable};
use crate::task::TaskTable;
use crate::transition::Strategy;

/// Arena state, guarded by the registry lock.
pub struct Inner {
    pub(crate) patches: IndexVec<PatchId, Option<Patch>>,
    pub(crate) objects: IndexVec<ObjectId, Option<Object>>,
    pub(crate) funcs: IndexVec<FuncId, Option<Func>>,
    /// Registration order, adjusted by enables when stacking is off.
    pub(crate) order: Vec<PatchId>,
    /// The patch being switched, if any.
    pub(crate) transition: Option<PatchId>,
}

impl Inner {
    fn new() -> Self {
        Self {
            patches: IndexVec::new(),
            objects: IndexVec::new(),
            funcs: IndexVec::new(),
            order: Vec::new(),
            transition: None,
        }
    }

    pub(crate) fn patch(&self, id: PatchId) -> Result<&Patch> {
        self.patches
            .get(id)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::NotRegistered(format!("#{}", id.index())))
    }

    pub(crate) fn patch_mut(&mut self, id: PatchId) -> Result<&mut Patch> {
        self.patches
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::NotRegistered(format!("#{}", id.index())))
    }

    // objects and funcs are only reachable through a live patch
    pub(crate) fn object(&self, id: ObjectId) -> &Object {
        self.objects[id].as_ref().expect("dangling object id")
    }

    pub(crate) fn object_mut(&mut self, id: ObjectId) -> &mut Object {
        self.objects[id].as_mut().expect("dangling object id")
    }

    pub(crate) fn func(&self, id: FuncId) -> &Func {
        self.funcs[id].as_ref().expect("dangling func id")
    }

    pub(crate) fn func_mut(&mut self, id: FuncId) -> &mut Func {
        self.funcs[id].as_mut().expect("dangling func id")
    }

    pub(crate) fn find(&self, name: &str) -> Option<PatchId> {
        self.order
            .iter()
            .copied()
            .find(|&id| matches!(self.patch(id), Ok(p) if p.name == name))
    }

    pub(crate) fn objects_of(&self, id: PatchId) -> Vec<ObjectId> {
        self.patch(id).map(|p| p.objects.clone()).unwrap_or_default()
    }

    pub(crate) fn funcs_of(&self, id: PatchId) -> impl Iterator<Item = (&Func, &Object)> + '_ {
        let objects = self.patch(id).map_or(&[][..], |p| p.objects.as_slice());
        objects.iter().flat_map(move |&obj| {
            let object = self.object(obj);
            object.funcs.iter().map(move |&f| (self.func(f), object))
        })
    }

    pub(crate) fn loaded_funcs(&self, id: PatchId) -> impl Iterator<Item = (&Func, &Object)> + '_ {
        self.funcs_of(id).filter(|(_, obj)| obj.loaded)
    }

    /// Drops a patch with its objects and funcs. The slots stay behind as
    /// `None` and are never handed out again, so an id kept by a caller
    /// can't come to name a newer patch. Each one costs an `Option` per
    /// arena entry for the life of the registry.
    fn free_patch(&mut self, id: PatchId) {
        if let Some(patch) = self.patches.get_mut(id).and_then(Option::take) {
            for obj in patch.objects {
                if let Some(object) = self.objects[obj].take() {
                    for func in object.funcs {
                        self.funcs[func] = None;
                    }
                }
            }
        }
    }
}

/// State shared by the registry and its strategy.
pub struct Core {
    pub(crate) config: Config,
    pub(crate) host: Host,
    pub(crate) mode: Mode,
    pub(crate) inner: Mutex<Inner>,
    /// Signalled whenever a stop-machine attempt ends.
    pub(crate) idle: Condvar,
    pub(crate) nodes: FuncNodes,
    pub(crate) tasks: TaskTable,
}

impl Core {
    /// Resolves the funcs of a loaded object and applies the relocations
    /// scoped to its unit.
    pub(crate) fn init_object_loaded(&self, inner: &mut Inner, obj: ObjectId) -> Result<()> {
        let symbols = &*self.host.symbols;
        let window = self.config.replace_window;
        let object = inner.object(obj);
        let patch = inner.patch(object.patch)?;

        if let Some(unit) = object.name.as_deref() {
            for section in sections_for(&patch.relocs, Some(unit)) {
                apply_section(symbols, &*self.host.text, section)?;
            }
        }

        let mut resolved = Vec::with_capacity(object.funcs.len());
        for &fid in &object.funcs {
            let func = inner.func(fid);
            let addr = find_symbol(symbols, object.name.as_deref(), &func.old_name, func.old_sympos)?;
            let size = symbols.symbol_size(addr).ok_or_else(|| Error::SymbolNotFound {
                unit: object.display_name().to_owned(),
                name: func.old_name.clone(),
            })?;

            if self.mode == Mode::StopMachine && size < window {
                return Err(Error::InvalidPatch(format!(
                    "{} is {} bytes, smaller than the {}-byte replace window",
                    func.old_name, size, window
                )));
            }
            if self.host.text.text_reserved(addr, addr + window.saturating_sub(1)) {
                return Err(Error::InvalidPatch(format!(
                    "{} has reserved text in its first {} bytes",
                    func.old_name, window
                )));
            }
            resolved.push((fid, addr, size));
        }

        for (fid, addr, size) in resolved {
            let func = inner.func_mut(fid);
            func.old_addr = Some(addr);
            func.old_size = size;
            if func.is_nop() {
                func.live.set_new(addr, size);
            }
            debug!(func = %func.old_name, %addr, size, "resolved");
        }
        Ok(())
    }

    /// Forgets everything resolved for a unit that went away.
    pub(crate) fn free_object_loaded(&self, inner: &mut Inner, obj: ObjectId) {
        let funcs = inner.object(obj).funcs.clone();
        for fid in funcs {
            let func = inner.func_mut(fid);
            func.old_addr = None;
            func.old_size = 0;
            if func.is_nop() {
                func.live.set_new(Addr::NULL, 0);
            }
        }
        inner.object_mut(obj).loaded = false;
    }
}

/// The catalog of registered patches.
///
/// `S` picks how patches are switched, see [`Gradual`](crate::Gradual) and
/// [`StopMachine`](crate::StopMachine).
pub struct Registry<S: Strategy> {
    pub(crate) core: Core,
    _strategy: PhantomData<S>,
}

#[cfg(feature = "gradual")]
pub type DefaultRegistry = Registry<crate::transition::Gradual>;
#[cfg(not(feature = "gradual"))]
pub type DefaultRegistry = Registry<crate::transition::StopMachine>;

impl<S: Strategy> Registry<S> {
    pub fn init(config: Config, host: Host) -> Self {
        info!(mode = ?S::MODE, "livepatch registry initialized");
        Self {
            core: Core {
                config,
                host,
                mode: S::MODE,
                inner: Mutex::new(Inner::new()),
                idle: Condvar::new(),
                nodes: FuncNodes::new(),
                tasks: TaskTable::new(),
            },
            _strategy: PhantomData,
        }
    }

    /// Unregisters every patch. Fails while any of them is enabled.
    pub fn shutdown(&self) -> Result<()> {
        let mut inner = self.core.inner.lock();
        for &id in &inner.order {
            let patch = inner.patch(id)?;
            if patch.state != PatchState::Disabled || inner.transition == Some(id) {
                return Err(Error::StillEnabled(patch.name.clone()));
            }
        }
        for id in inner.order.clone() {
            unregister_locked(&mut inner, id)?;
        }
        info!("livepatch registry shut down");
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    pub fn mode(&self) -> Mode {
        S::MODE
    }

    pub fn register(&self, desc: PatchDesc) -> Result<PatchId> {
        self.core.config.validate()?;
        validate(&desc)?;
        let symbols = &*self.core.host.symbols;
        if !symbols.is_patch_unit(&desc.unit) {
            return Err(Error::InvalidPatch(format!(
                "unit {} is not marked as a livepatch unit",
                desc.unit
            )));
        }

        let mut inner = self.core.inner.lock();
        if inner.find(&desc.name).is_some() {
            return Err(Error::AlreadyRegistered(desc.name));
        }

        let id = self.build(&mut inner, desc)?;
        if let Err(err) = self.init_patch(&mut inner, id) {
            inner.free_patch(id);
            return Err(err);
        }

        for obj in inner.objects_of(id) {
            run_hook(&inner, obj, |cb| cb.on_register.as_ref());
        }
        inner.order.push(id);

        let patch = inner.patch(id)?;
        info!(patch = %patch.name, replace = patch.replace, "registered patch");
        Ok(id)
    }

    fn build(&self, inner: &mut Inner, desc: PatchDesc) -> Result<PatchId> {
        let symbols = &*self.core.host.symbols;
        let id = inner.patches.push(Some(Patch {
            name: desc.name,
            unit: desc.unit,
            replace: desc.replace,
            forced: false,
            state: PatchState::Disabled,
            enabled: false,
            objects: Vec::new(),
            relocs: desc.relocs,
        }));

        for ObjectDesc {
            name,
            funcs,
            callbacks,
        } in desc.objects
        {
            let obj = push_object(inner, id, name, callbacks, false);
            for f in funcs {
                let new_size = match f.new_size.or_else(|| symbols.symbol_size(f.new_addr)) {
                    Some(size) => size,
                    None => {
                        inner.free_patch(id);
                        return Err(Error::InvalidPatch(format!(
                            "size of the new body of {} is unknown",
                            f.old_name
                        )));
                    }
                };
                let fid = inner.funcs.next_idx();
                inner.funcs.push(Some(Func {
                    object: obj,
                    old_name: f.old_name,
                    old_sympos: f.old_sympos,
                    old_addr: None,
                    old_size: 0,
                    force: f.force,
                    patched: false,
                    live: Arc::new(LiveFunc::new(id, fid, false, f.new_addr, new_size)),
                }));
                inner.object_mut(obj).funcs.push(fid);
            }
        }
        Ok(id)
    }

    fn init_patch(&self, inner: &mut Inner, id: PatchId) -> Result<()> {
        if inner.patch(id)?.replace {
            add_nops(inner, id)?;
        }

        // base image relocations go in right away, it's always there
        let patch = inner.patch(id)?;
        for section in sections_for(&patch.relocs, None) {
            apply_section(&*self.core.host.symbols, &*self.core.host.text, section)?;
        }

        for obj in inner.objects_of(id) {
            let loaded = match &inner.object(obj).name {
                None => true,
                Some(unit) => self.core.host.symbols.unit_loaded(unit),
            };
            if loaded {
                inner.object_mut(obj).loaded = true;
                self.core.init_object_loaded(inner, obj)?;
            }
        }
        Ok(())
    }

    pub fn unregister(&self, id: PatchId) -> Result<()> {
        let mut inner = self.core.inner.lock();
        let patch = inner.patch(id)?;
        if patch.state != PatchState::Disabled {
            return Err(Error::StillEnabled(patch.name.clone()));
        }
        if inner.transition == Some(id) {
            return Err(Error::Busy);
        }
        unregister_locked(&mut inner, id)
    }

    pub fn enable(&self, id: PatchId) -> Result<()> {
        S::enable(&self.core, id)
    }

    pub fn disable(&self, id: PatchId) -> Result<()> {
        S::disable(&self.core, id)
    }

    pub fn find(&self, name: &str) -> Option<PatchId> {
        self.core.inner.lock().find(name)
    }

    pub fn state(&self, id: PatchId) -> Result<PatchState> {
        Ok(self.core.inner.lock().patch(id)?.state)
    }

    pub fn is_enabled(&self, id: PatchId) -> Result<bool> {
        Ok(self.core.inner.lock().patch(id)?.enabled)
    }

    pub fn status(&self, id: PatchId) -> Result<PatchStatus> {
        let inner = self.core.inner.lock();
        let patch = inner.patch(id)?;

        let objects = patch
            .objects
            .iter()
            .map(|&obj| {
                let object = inner.object(obj);
                ObjectStatus {
                    name: object.display_name().to_owned(),
                    loaded: object.loaded,
                    patched: object.patched,
                    dynamic: object.dynamic,
                    funcs: object
                        .funcs
                        .iter()
                        .map(|&f| {
                            let func = inner.func(f);
                            FuncStatus {
                                old_name: func.old_name.clone(),
                                old_sympos: func.old_sympos,
                                old_addr: func.old_addr,
                                old_size: func.old_size,
                                new_addr: func.live.new_addr(),
                                new_size: func.live.new_size(),
                                patched: func.patched,
                                nop: func.is_nop(),
                                transition: func.live.in_transition(),
                                force: func.force,
                            }
                        })
                        .collect(),
                }
            })
            .collect();

        Ok(PatchStatus {
            name: patch.name.clone(),
            unit: patch.unit.clone(),
            state: patch.state,
            enabled: patch.enabled,
            transition: inner.transition == Some(id),
            forced: patch.forced,
            replace: patch.replace,
            objects,
        })
    }

    /// Registered patches in list order.
    pub fn state_table(&self) -> StateTable {
        let inner = self.core.inner.lock();
        let rows = inner
            .order
            .iter()
            .filter_map(|&id| inner.patch(id).ok())
            .enumerate()
            .map(|(i, patch)| StateRow {
                index: i + 1,
                name: patch.name.clone(),
                state: patch.state,
            })
            .collect();
        StateTable { rows }
    }

    /// The replacement stack at `old_addr`, most recent first.
    pub fn stack_of(&self, old_addr: Addr) -> Vec<Arc<LiveFunc>> {
        self.core.nodes.stack_of(old_addr)
    }

    pub fn nodes(&self) -> &FuncNodes {
        &self.core.nodes
    }
}

fn validate(desc: &PatchDesc) -> Result<()> {
    let invalid = |msg: String| Err(Error::InvalidPatch(msg));

    if desc.name.is_empty() {
        return invalid("patch has no name".into());
    }
    if desc.objects.is_empty() {
        return invalid(format!("patch {} has no objects", desc.name));
    }

    let mut units = HashSet::new();
    for obj in &desc.objects {
        let name = obj.name.as_deref().unwrap_or(BASE_OBJECT_NAME);
        if let Some(unit) = &obj.name {
            if unit.is_empty() || unit.len() >= UNIT_NAME_LEN || unit == BASE_OBJECT_NAME {
                return invalid(format!("bad object name {:?}", unit));
            }
        }
        if !units.insert(obj.name.as_deref()) {
            return invalid(format!("object {} appears twice", name));
        }
        if obj.funcs.is_empty() {
            return invalid(format!("object {} has no funcs", name));
        }

        let mut funcs = HashSet::new();
        for func in &obj.funcs {
            if func.old_name.is_empty() || func.old_name.len() >= SYMBOL_NAME_LEN {
                return invalid(format!("bad func name in object {}", name));
            }
            if func.new_addr.is_null() {
                return invalid(format!("{} has no new address", func.old_name));
            }
            if !funcs.insert((func.old_name.as_str(), func.old_sympos)) {
                return invalid(format!(
                    "{},{} appears twice in object {}",
                    func.old_name, func.old_sympos, name
                ));
            }
        }
    }
    Ok(())
}

fn push_object(
    inner: &mut Inner,
    patch: PatchId,
    name: Option<String>,
    callbacks: Callbacks,
    dynamic: bool,
) -> ObjectId {
    let obj = inner.objects.push(Some(Object {
        patch,
        name,
        loaded: false,
        patched: false,
        dynamic,
        funcs: Vec::new(),
        callbacks,
        callbacks_enabled: false,
    }));
    if let Some(Some(p)) = inner.patches.get_mut(patch) {
        p.objects.push(obj);
    }
    obj
}

/// Gives a replace patch a nop for every func of the patches before it
/// that it doesn't replace itself.
fn add_nops(inner: &mut Inner, id: PatchId) -> Result<()> {
    for other in inner.order.clone() {
        for old_obj in inner.objects_of(other) {
            let name = inner.object(old_obj).name.clone();
            let existing = inner
                .objects_of(id)
                .into_iter()
                .find(|&o| inner.object(o).name == name);
            let obj = match existing {
                Some(obj) => obj,
                None => push_object(inner, id, name, Callbacks::default(), true),
            };

            for old_fid in inner.object(old_obj).funcs.clone() {
                let old = inner.func(old_fid);
                let (old_name, old_sympos, force) = (old.old_name.clone(), old.old_sympos, old.force);
                let exists = inner.object(obj).funcs.iter().any(|&f| {
                    let f = inner.func(f);
                    f.old_name == old_name && f.old_sympos == old_sympos
                });
                if exists {
                    continue;
                }

                let fid = inner.funcs.next_idx();
                inner.funcs.push(Some(Func {
                    object: obj,
                    old_name,
                    old_sympos,
                    old_addr: None,
                    old_size: 0,
                    force,
                    patched: false,
                    live: Arc::new(LiveFunc::new(id, fid, true, Addr::NULL, 0)),
                }));
                inner.object_mut(obj).funcs.push(fid);
            }
        }
    }
    debug!(patch = %inner.patch(id)?.name, "added nops");
    Ok(())
}

pub(crate) fn run_hook<F>(inner: &Inner, obj: ObjectId, select: F)
where
    F: for<'a> FnOnce(&'a Callbacks) -> Option<&'a crate::patch::HookFn>,
{
    let object = inner.object(obj);
    if let Some(hook) = select(&object.callbacks) {
        let patch = inner.patch(object.patch).map_or("", |p| p.name.as_str());
        hook(&ObjectInfo {
            patch,
            object: object.display_name(),
        });
    }
}

fn unregister_locked(inner: &mut Inner, id: PatchId) -> Result<()> {
    let name = inner.patch(id)?.name.clone();
    for obj in inner.objects_of(id) {
        run_hook(inner, obj, |cb| cb.on_unregister.as_ref());
    }
    inner.order.retain(|&p| p != id);
    inner.free_patch(id);
    info!(patch = %name, "unregistered patch");
    Ok(())
}
