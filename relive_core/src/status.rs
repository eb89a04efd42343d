use std::fmt;

use relive_types::{Addr, ForceLevel, PatchState};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FuncStatus {
    pub old_name: String,
    pub old_sympos: u64,
    pub old_addr: Option<Addr>,
    pub old_size: u64,
    pub new_addr: Addr,
    pub new_size: u64,
    pub patched: bool,
    pub nop: bool,
    pub transition: bool,
    pub force: ForceLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectStatus {
    pub name: String,
    pub loaded: bool,
    pub patched: bool,
    pub dynamic: bool,
    pub funcs: Vec<FuncStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchStatus {
    pub name: String,
    pub unit: String,
    pub state: PatchState,
    pub enabled: bool,
    pub transition: bool,
    pub forced: bool,
    pub replace: bool,
    pub objects: Vec<ObjectStatus>,
}

impl PatchStatus {
    pub fn object(&self, name: &str) -> Option<&ObjectStatus> {
        self.objects.iter().find(|o| o.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateRow {
    pub index: usize,
    pub name: String,
    pub state: PatchState,
}

/// Snapshot of the patch list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTable {
    pub rows: Vec<StateRow>,
}

const RULE: &str = "-----------------------------------------------";

impl StateTable {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.rows)
    }
}

impl fmt::Display for StateTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<5}\t{:<26}\t{:<8}", "Index", "Patch", "State")?;
        writeln!(f, "{}", RULE)?;
        for row in &self.rows {
            writeln!(f, "{:<5}\t{:<26}\t{:<8}", row.index, row.name, row.state.as_str())?;
        }
        writeln!(f, "{}", RULE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> StateTable {
        StateTable {
            rows: vec![
                StateRow {
                    index: 1,
                    name: "fix_a".into(),
                    state: PatchState::Enabled,
                },
                StateRow {
                    index: 2,
                    name: "fix_b".into(),
                    state: PatchState::Disabled,
                },
            ],
        }
    }

    #[test]
    fn renders_fixed_width() {
        let text = table().to_string();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], format!("Index\t{:<26}\tState   ", "Patch"));
        assert_eq!(lines[1], RULE);
        assert_eq!(lines[2], format!("1    \t{:<26}\tenabled ", "fix_a"));
        assert_eq!(lines[4], RULE);
    }

    #[test]
    fn serializes_states() {
        let json: serde_json::Value = serde_json::from_str(&table().to_json().unwrap()).unwrap();
        assert_eq!(json[0]["name"], "fix_a");
        assert_eq!(json[1]["state"], "disabled");
        assert_eq!(json[1]["index"], 2);
    }
}
