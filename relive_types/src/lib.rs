pub mod addr;
pub mod id;
pub mod layout;
pub mod state;

pub use addr::Addr;
pub use id::{FuncId, ObjectId, PatchId, TaskId};
pub use state::{ForceLevel, Mode, PatchState, TaskState};
