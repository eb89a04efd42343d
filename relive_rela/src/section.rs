use byteorder::ByteOrder;

use crate::names::{SectionName, SymbolName};
use crate::parser::{ParseError, Parser};

/// A relocation whose symbol has been decoded but not yet resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reloc {
    pub offset: u64,
    pub kind: u32,
    pub addend: i64,
    pub symbol: SymbolName,
}

/// All relocations of one `.klp.rela.*` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocSection {
    /// Object the section is scoped to, `None` for the base image.
    pub object: Option<String>,
    pub section: String,
    /// Load address of the section the offsets are relative to.
    pub base: u64,
    pub relocs: Vec<Reloc>,
}

impl RelocSection {
    /// Decodes a raw `Elf64_Rela` table. `symbols` is the patch unit's
    /// symbol name table, indexed by the entries' symbol index.
    pub fn from_elf<BO: ByteOrder>(
        name: &str,
        base: u64,
        table: &[u8],
        symbols: &[&str],
    ) -> Result<Self, ParseError> {
        let SectionName { object, section } = SectionName::parse(name)?;

        let relocs = Parser::<BO>::parse(table)?
            .into_iter()
            .map(|rela| {
                let sym = symbols
                    .get(rela.sym as usize)
                    .ok_or(ParseError::SymbolIndexOutOfRange(rela.sym))?;
                Ok(Reloc {
                    offset: rela.offset,
                    kind: rela.kind,
                    addend: rela.addend,
                    symbol: SymbolName::parse(sym)?,
                })
            })
            .collect::<Result<Vec<_>, ParseError>>()?;

        Ok(Self {
            object,
            section,
            base,
            relocs,
        })
    }

    pub fn is_base(&self) -> bool {
        self.object.is_none()
    }
}
