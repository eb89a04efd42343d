//! File-like knobs over the registry.
//!
//! ```text
//! <patch>/enabled            rw  0 or 1
//! <patch>/transition         r   gradual only
//! <patch>/force              w   gradual only
//! <patch>/<object>/patched   r
//! ```

use relive_types::{Mode, PatchId};

use crate::error::{Error, Result};
use crate::registry::{Inner, Registry};
use crate::transition::{gradual, Strategy};

/// Parses a boolean the way knob writes spell them.
pub fn parse_bool(value: &str) -> Result<bool> {
    let v = value.strip_suffix('\n').unwrap_or(value);
    match v.to_ascii_lowercase().as_str() {
        "1" | "y" | "yes" | "on" | "true" => Ok(true),
        "0" | "n" | "no" | "off" | "false" => Ok(false),
        _ => Err(Error::InvalidValue(value.to_owned())),
    }
}

enum Attr<'a> {
    Enabled,
    Transition,
    Force,
    Patched(&'a str),
}

fn flag(b: bool) -> String {
    format!("{}\n", b as u8)
}

impl<S: Strategy> Registry<S> {
    fn lookup<'a>(&self, inner: &Inner, path: &'a str) -> Result<(PatchId, Attr<'a>)> {
        let missing = || Error::NoSuchAttribute(path.to_owned());
        let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
        let (patch, attr) = match parts.as_slice() {
            [patch, "enabled"] => (*patch, Attr::Enabled),
            [patch, "transition"] => (*patch, Attr::Transition),
            [patch, "force"] => (*patch, Attr::Force),
            [patch, object, "patched"] => (*patch, Attr::Patched(*object)),
            _ => return Err(missing()),
        };
        let id = inner.find(patch).ok_or_else(missing)?;
        Ok((id, attr))
    }

    pub fn read_attr(&self, path: &str) -> Result<String> {
        let inner = self.core.inner.lock();
        let (id, attr) = self.lookup(&inner, path)?;
        let patch = inner.patch(id)?;

        match attr {
            Attr::Enabled => Ok(flag(patch.enabled)),
            Attr::Transition if S::MODE == Mode::Gradual => {
                Ok(flag(inner.transition == Some(id)))
            }
            Attr::Transition => Err(Error::WrongMode(S::MODE)),
            Attr::Force => Err(Error::NoSuchAttribute(path.to_owned())),
            Attr::Patched(object) => patch
                .objects
                .iter()
                .map(|&obj| inner.object(obj))
                .find(|o| o.display_name() == object)
                .map(|o| flag(o.patched))
                .ok_or_else(|| Error::NoSuchAttribute(path.to_owned())),
        }
    }

    pub fn write_attr(&self, path: &str, value: &str) -> Result<()> {
        let id = {
            let inner = self.core.inner.lock();
            let (id, attr) = self.lookup(&inner, path)?;
            match attr {
                Attr::Enabled => id,
                Attr::Force if S::MODE == Mode::Gradual => {
                    drop(inner);
                    if parse_bool(value)? {
                        let mut inner = self.core.inner.lock();
                        gradual::force(&self.core, &mut inner, id)?;
                    }
                    return Ok(());
                }
                Attr::Force => return Err(Error::WrongMode(S::MODE)),
                Attr::Transition | Attr::Patched(_) => {
                    return Err(Error::NoSuchAttribute(path.to_owned()))
                }
            }
        };

        if parse_bool(value)? {
            self.enable(id)
        } else {
            self.disable(id)
        }
    }

    /// Every attribute path, in patch list order.
    pub fn attr_paths(&self) -> Vec<String> {
        let inner = self.core.inner.lock();
        let mut paths = Vec::new();
        for &id in &inner.order {
            let patch = match inner.patch(id) {
                Ok(patch) => patch,
                Err(_) => continue,
            };
            paths.push(format!("{}/enabled", patch.name));
            if S::MODE == Mode::Gradual {
                paths.push(format!("{}/transition", patch.name));
                paths.push(format!("{}/force", patch.name));
            }
            for &obj in &patch.objects {
                let name = inner.object(obj).display_name();
                paths.push(format!("{}/{}/patched", patch.name, name));
            }
        }
        paths
    }
}
