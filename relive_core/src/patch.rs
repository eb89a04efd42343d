//! Patch descriptions and their registered form.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use relive_rela::RelocSection;
use relive_types::layout::BASE_OBJECT_NAME;
use relive_types::{Addr, ForceLevel, FuncId, ObjectId, PatchId, PatchState};

/// Passed to object callbacks.
#[derive(Debug, Clone, Copy)]
pub struct ObjectInfo<'a> {
    pub patch: &'a str,
    pub object: &'a str,
}

pub type PrePatchFn = Box<dyn Fn(&ObjectInfo<'_>) -> Result<(), String> + Send + Sync>;
pub type HookFn = Box<dyn Fn(&ObjectInfo<'_>) + Send + Sync>;

/// Lifecycle callbacks of one object. They run with the registry lock held
/// and must not call back into the registry.
#[derive(Default)]
pub struct Callbacks {
    pub pre_patch: Option<PrePatchFn>,
    pub post_patch: Option<HookFn>,
    pub pre_unpatch: Option<HookFn>,
    pub post_unpatch: Option<HookFn>,
    pub on_register: Option<HookFn>,
    pub on_unregister: Option<HookFn>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("pre_patch", &self.pre_patch.is_some())
            .field("post_patch", &self.post_patch.is_some())
            .field("pre_unpatch", &self.pre_unpatch.is_some())
            .field("post_unpatch", &self.post_unpatch.is_some())
            .field("on_register", &self.on_register.is_some())
            .field("on_unregister", &self.on_unregister.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub struct FuncDesc {
    pub old_name: String,
    pub old_sympos: u64,
    pub new_addr: Addr,
    /// Looked up through the symbol resolver when `None`.
    pub new_size: Option<u64>,
    pub force: ForceLevel,
}

impl FuncDesc {
    pub fn new(old_name: impl Into<String>, new_addr: Addr) -> Self {
        Self {
            old_name: old_name.into(),
            old_sympos: 0,
            new_addr,
            new_size: None,
            force: ForceLevel::default(),
        }
    }

    pub fn sympos(mut self, sympos: u64) -> Self {
        self.old_sympos = sympos;
        self
    }

    pub fn new_size(mut self, size: u64) -> Self {
        self.new_size = Some(size);
        self
    }

    pub fn force(mut self, force: ForceLevel) -> Self {
        self.force = force;
        self
    }
}

#[derive(Debug, Default)]
pub struct ObjectDesc {
    /// `None` for the base image.
    pub name: Option<String>,
    pub funcs: Vec<FuncDesc>,
    pub callbacks: Callbacks,
}

impl ObjectDesc {
    pub fn base() -> Self {
        Self::default()
    }

    pub fn unit(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn func(mut self, func: FuncDesc) -> Self {
        self.funcs.push(func);
        self
    }

    pub fn callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}

#[derive(Debug)]
pub struct PatchDesc {
    pub name: String,
    /// The code unit the patch was loaded from.
    pub unit: String,
    /// Supersede every patch registered before this one.
    pub replace: bool,
    pub objects: Vec<ObjectDesc>,
    pub relocs: Vec<RelocSection>,
}

impl PatchDesc {
    pub fn new(name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            replace: false,
            objects: Vec::new(),
            relocs: Vec::new(),
        }
    }

    pub fn replace(mut self, replace: bool) -> Self {
        self.replace = replace;
        self
    }

    pub fn object(mut self, object: ObjectDesc) -> Self {
        self.objects.push(object);
        self
    }

    pub fn relocs(mut self, section: RelocSection) -> Self {
        self.relocs.push(section);
        self
    }
}

/// The part of a func that lock-free readers see. Shared between the arena
/// and every FuncNode stack the func sits on.
#[derive(Debug)]
pub struct LiveFunc {
    pub patch: PatchId,
    pub func: FuncId,
    nop: bool,
    new_addr: AtomicU64,
    new_size: AtomicU64,
    transition: AtomicBool,
}

impl LiveFunc {
    pub(crate) fn new(patch: PatchId, func: FuncId, nop: bool, new_addr: Addr, new_size: u64) -> Self {
        Self {
            patch,
            func,
            nop,
            new_addr: AtomicU64::new(new_addr.0),
            new_size: AtomicU64::new(new_size),
            transition: AtomicBool::new(false),
        }
    }

    /// A nop stands in for the original function.
    pub fn is_nop(&self) -> bool {
        self.nop
    }

    pub fn new_addr(&self) -> Addr {
        Addr(self.new_addr.load(Ordering::Acquire))
    }

    pub fn new_size(&self) -> u64 {
        self.new_size.load(Ordering::Acquire)
    }

    pub fn in_transition(&self) -> bool {
        self.transition.load(Ordering::Acquire)
    }

    pub(crate) fn set_new(&self, addr: Addr, size: u64) {
        self.new_size.store(size, Ordering::Release);
        self.new_addr.store(addr.0, Ordering::Release);
    }

    pub(crate) fn set_transition(&self, transition: bool) {
        self.transition.store(transition, Ordering::Release);
    }
}

#[derive(Debug)]
pub(crate) struct Patch {
    pub name: String,
    pub unit: String,
    pub replace: bool,
    pub forced: bool,
    pub state: PatchState,
    /// The committed `enabled` flag. Only a completed transition changes
    /// it, so a reversed request leaves it where it was.
    pub enabled: bool,
    pub objects: Vec<ObjectId>,
    pub relocs: Vec<RelocSection>,
}

#[derive(Debug)]
pub(crate) struct Object {
    pub patch: PatchId,
    pub name: Option<String>,
    pub loaded: bool,
    pub patched: bool,
    /// Synthesized to hold nops for a replace patch.
    pub dynamic: bool,
    pub funcs: Vec<FuncId>,
    pub callbacks: Callbacks,
    /// Set once `pre_patch` succeeded, so `post_unpatch` pairs with it.
    pub callbacks_enabled: bool,
}

impl Object {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(BASE_OBJECT_NAME)
    }
}

#[derive(Debug)]
pub(crate) struct Func {
    pub object: ObjectId,
    pub old_name: String,
    pub old_sympos: u64,
    pub old_addr: Option<Addr>,
    pub old_size: u64,
    pub force: ForceLevel,
    pub patched: bool,
    pub live: Arc<LiveFunc>,
}

impl Func {
    pub fn is_nop(&self) -> bool {
        self.live.is_nop()
    }
}
