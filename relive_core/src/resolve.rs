//! Symbol lookup and relocation of patch code.

use relive_rela::RelocSection;
use relive_types::layout::BASE_OBJECT_NAME;
use relive_types::Addr;
use tracing::debug;

use crate::error::{Error, Result};
use crate::host::{CodeRewriter, SymbolResolver};

fn unit_name(unit: Option<&str>) -> String {
    unit.unwrap_or(BASE_OBJECT_NAME).to_owned()
}

/// Finds `name` in `unit`. A `sympos` of 0 requires the name to be unique,
/// `k` selects the k-th occurrence in symbol table order.
pub fn find_symbol(
    symbols: &dyn SymbolResolver,
    unit: Option<&str>,
    name: &str,
    sympos: u64,
) -> Result<Addr> {
    let mut count = 0u64;
    let mut found = None;
    symbols.each_match(unit, name, &mut |addr| {
        count += 1;
        found = Some(addr);
        // stop at the wanted occurrence, or at the first duplicate
        (sympos > 0 && count == sympos) || (sympos == 0 && count > 1)
    });

    match found {
        None => Err(Error::SymbolNotFound {
            unit: unit_name(unit),
            name: name.to_owned(),
        }),
        Some(_) if sympos == 0 && count > 1 => Err(Error::AmbiguousSymbol {
            unit: unit_name(unit),
            name: name.to_owned(),
            count: count as usize,
        }),
        Some(_) if sympos > 0 && count != sympos => Err(Error::SymposMismatch {
            unit: unit_name(unit),
            name: name.to_owned(),
            sympos,
            count: count as usize,
        }),
        Some(addr) => Ok(addr),
    }
}

/// Resolves every entry of `section` and writes it into the patch code.
pub fn apply_section(
    symbols: &dyn SymbolResolver,
    text: &dyn CodeRewriter,
    section: &RelocSection,
) -> Result<()> {
    for reloc in &section.relocs {
        // a unit may come and go independently of the base image
        if !section.is_base() && reloc.symbol.is_base() {
            return Err(Error::CrossScopeReference {
                section: section.section.clone(),
                symbol: reloc.symbol.name.clone(),
            });
        }

        let addr = find_symbol(
            symbols,
            reloc.symbol.object.as_deref(),
            &reloc.symbol.name,
            reloc.symbol.sympos,
        )?;
        let place = Addr(section.base) + reloc.offset;
        let value = addr.offset(reloc.addend).0;

        text.write_reloc(place, reloc.kind, value)
            .map_err(|source| Error::RewriteFailed {
                addr: place,
                source,
            })?;
    }

    debug!(
        object = section.object.as_deref().unwrap_or(BASE_OBJECT_NAME),
        section = %section.section,
        count = section.relocs.len(),
        "applied relocations"
    );
    Ok(())
}

/// Sections of `relocs` scoped to `object`.
pub fn sections_for<'a>(
    relocs: &'a [RelocSection],
    object: Option<&'a str>,
) -> impl Iterator<Item = &'a RelocSection> + 'a {
    relocs.iter().filter(move |s| s.object.as_deref() == object)
}
