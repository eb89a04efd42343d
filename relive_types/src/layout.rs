//! Constants shared between the engine and the host-facing formats.

/// Length of the redirect spliced into a function entry (`jmp rel32`).
/// Only these bytes of an old function are ever rewritten.
pub const REPLACE_WINDOW: u64 = 5;

/// Opcode of the near relative jump used for redirects.
pub const JMP_REL32_OPCODE: u8 = 0xe9;

/// Name the base system image goes by in relocation names and attribute paths.
pub const BASE_OBJECT_NAME: &str = "vmlinux";

// name limits, including the trailing NUL the on-disk formats reserve
pub const UNIT_NAME_LEN: usize = 56;
pub const SYMBOL_NAME_LEN: usize = 512;
