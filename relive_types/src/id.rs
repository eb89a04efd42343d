use index_vec::define_index_type;

// arena handles; child -> parent links are stored as these, never as pointers
define_index_type! {pub struct PatchId = u32;}
define_index_type! {pub struct ObjectId = u32;}
define_index_type! {pub struct FuncId = u32;}
// handed out by the host, not by an arena
define_index_type! {pub struct TaskId = u32;}
