//! Patch relocation sections.
//!
//! A patch carries relocations against symbols that only exist in the
//! running system. Each section is named `.klp.rela.<object>.<section>` and
//! each referenced symbol `.klp.sym.<object>.<name>,<sympos>`, where the
//! object `vmlinux` stands for the base image.

mod names;
mod parser;
mod section;

pub use byteorder::{BigEndian, LittleEndian};
pub use names::{SectionName, SymbolName};
pub use parser::{ParseError, Parser, Rela, RELA_ENTRY_SIZE};
pub use section::{Reloc, RelocSection};

pub type Result<T> = std::result::Result<T, ParseError>;
