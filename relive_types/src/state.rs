use serde::{Deserialize, Serialize};

/// Lifecycle of a registered patch. Unregistration removes the patch
/// entirely, so it has no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatchState {
    Disabled,
    Enabling,
    Enabled,
    Disabling,
}

impl PatchState {
    pub fn in_transition(self) -> bool {
        matches!(self, PatchState::Enabling | PatchState::Disabling)
    }

    /// The state a pending request is heading towards.
    pub fn heading_enabled(self) -> bool {
        matches!(self, PatchState::Enabled | PatchState::Enabling)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PatchState::Disabled => "disabled",
            PatchState::Enabling => "enabling",
            PatchState::Enabled => "enabled",
            PatchState::Disabling => "disabling",
        }
    }
}

/// Which version of the patched functions a task is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TaskState {
    Undefined = 0,
    Unpatched = 1,
    Patched = 2,
}

impl TaskState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => TaskState::Unpatched,
            2 => TaskState::Patched,
            _ => TaskState::Undefined,
        }
    }

    pub fn flip(self) -> Self {
        match self {
            TaskState::Unpatched => TaskState::Patched,
            TaskState::Patched => TaskState::Unpatched,
            TaskState::Undefined => TaskState::Undefined,
        }
    }
}

/// How strictly the activeness check treats a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForceLevel {
    /// Any frame inside the whole active body blocks the switch.
    Strict,
    /// Only frames inside the rewritten entry window block the switch.
    #[default]
    Window,
    /// Skip the check for this function when enabling.
    Waive,
}

/// The two switch-over strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    Gradual,
    StopMachine,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_states() {
        assert!(!PatchState::Disabled.in_transition());
        assert!(PatchState::Enabling.in_transition());
        assert!(!PatchState::Enabled.in_transition());
        assert!(PatchState::Disabling.in_transition());

        assert!(PatchState::Enabled.heading_enabled());
        assert!(PatchState::Enabling.heading_enabled());
        assert!(!PatchState::Disabling.heading_enabled());
    }

    #[test]
    fn task_state_bytes() {
        for s in [TaskState::Undefined, TaskState::Unpatched, TaskState::Patched] {
            assert_eq!(TaskState::from_u8(s as u8), s);
        }
        assert_eq!(TaskState::Patched.flip(), TaskState::Unpatched);
        assert_eq!(TaskState::Undefined.flip(), TaskState::Undefined);
    }
}
