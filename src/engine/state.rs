use serde::{Deserialize, Serialize};

/// Stream lifecycle states
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    #[default]
    Idle,
    /// Connecting adapters and spawning stage tasks.
    Starting,
    Running,
    /// Sources are closed; in-flight transactions are being resolved.
    Draining,
    Stopped,
    Failed {
        error_msg: String,
    },
}

impl StreamState {
    /// Check if transition from current state to target state is valid
    pub fn can_transition_to(&self, target: &StreamState) -> bool {
        use StreamState::*;

        matches!(
            (self, target),
            (Idle, Starting)
                | (Starting, Running)
                | (Starting, Failed { .. })
                | (Running, Draining)
                | (Running, Stopped)
                | (Running, Failed { .. })
                | (Draining, Stopped)
                | (Draining, Failed { .. })
        )
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Idle => "Idle",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Draining => "Draining",
            Self::Stopped => "Stopped",
            Self::Failed { .. } => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed { .. })
    }
}
