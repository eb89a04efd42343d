use std::fmt;

use crate::parser::ParseError;

const SYM_PREFIX: &str = ".klp.sym.";
const RELA_PREFIX: &str = ".klp.rela.";
const BASE_OBJECT: &str = "vmlinux";

// field widths of the on-disk format, without the NUL
const MAX_OBJECT_LEN: usize = 55;
const MAX_SYMBOL_LEN: usize = 511;

/// `.klp.sym.<object>.<name>,<sympos>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolName {
    /// `None` for the base image.
    pub object: Option<String>,
    pub name: String,
    pub sympos: u64,
}

impl SymbolName {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let rest = s
            .strip_prefix(SYM_PREFIX)
            .ok_or_else(|| ParseError::NotLivepatchSymbol(s.to_owned()))?;
        let bad = || ParseError::BadSymbolName(s.to_owned());

        let (object, rest) = split_object(rest).ok_or_else(bad)?;
        let (name, pos) = rest.split_once(',').ok_or_else(bad)?;
        if name.is_empty() || name.len() > MAX_SYMBOL_LEN {
            return Err(bad());
        }
        let sympos = pos.parse::<u64>().map_err(|_| bad())?;

        Ok(Self {
            object,
            name: name.to_owned(),
            sympos,
        })
    }

    pub fn is_base(&self) -> bool {
        self.object.is_none()
    }
}

impl fmt::Display for SymbolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}.{},{}",
            SYM_PREFIX,
            self.object.as_deref().unwrap_or(BASE_OBJECT),
            self.name,
            self.sympos
        )
    }
}

/// `.klp.rela.<object>.<section>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SectionName {
    pub object: Option<String>,
    pub section: String,
}

impl SectionName {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let rest = s
            .strip_prefix(RELA_PREFIX)
            .ok_or_else(|| ParseError::BadSectionName(s.to_owned()))?;
        // the section part is informational, only the object is required
        let (object, section) = match split_object(rest) {
            Some((object, section)) => (object, section),
            None if valid_object(rest) => (object_of(rest), ""),
            None => return Err(ParseError::BadSectionName(s.to_owned())),
        };

        Ok(Self {
            object,
            section: section.to_owned(),
        })
    }
}

impl fmt::Display for SectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}.{}",
            RELA_PREFIX,
            self.object.as_deref().unwrap_or(BASE_OBJECT),
            self.section
        )
    }
}

fn valid_object(s: &str) -> bool {
    !s.is_empty() && s.len() <= MAX_OBJECT_LEN && !s.contains('.')
}

fn object_of(s: &str) -> Option<String> {
    if s == BASE_OBJECT {
        None
    } else {
        Some(s.to_owned())
    }
}

fn split_object(s: &str) -> Option<(Option<String>, &str)> {
    let (object, rest) = s.split_once('.')?;
    if !valid_object(object) {
        return None;
    }
    Some((object_of(object), rest))
}
