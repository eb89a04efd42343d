//! A live patching engine.
//!
//! Patches replace functions of a running system and can be switched on and
//! off without stopping it. A [`Registry`] owns every registered patch and
//! switches them with one of two strategies:
//!
//! - [`Gradual`]: calls go through [`Registry::redirect`] and tasks move to
//!   the new code one by one, once their stacks are clear of the old code
//! - [`StopMachine`]: function entries are rewritten while every other
//!   processing unit is parked, after checking that no stack is inside the
//!   bytes being rewritten
//!
//! The system being patched is reached only through the traits in
//! [`host`]. The [`sim`] module implements them in memory.

mod activeness;
mod attrs;
pub mod barrier;
pub mod calltrace;
pub mod config;
mod error;
pub mod func_node;
pub mod host;
pub mod patch;
mod registry;
pub mod resolve;
pub mod sim;
mod status;
mod task;
pub mod transition;
mod units;


pub use attrs::parse_bool;
pub use config::Config;
pub use error::{Conflict, Error, Result};
pub use host::Host;
pub use patch::{Callbacks, FuncDesc, LiveFunc, ObjectDesc, ObjectInfo, PatchDesc};
pub use registry::{DefaultRegistry, Registry};
pub use status::{FuncStatus, ObjectStatus, PatchStatus, StateRow, StateTable};
pub use task::TaskHandle;
pub use transition::{Gradual, StopMachine, Strategy};

pub use relive_types::{Addr, ForceLevel, FuncId, Mode, ObjectId, PatchId, PatchState, TaskId, TaskState};
