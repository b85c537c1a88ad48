//! Operational mode of the host sink

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkState {
    /// Created, not yet linked into the host
    #[default]
    Init,
    /// Open, nothing playing
    Idle,
    /// Open and playing
    Running,
    /// Closed until resumed; the session is torn down
    Suspended,
    /// Removed from the host
    Unlinked,
}

impl SinkState {
    pub fn is_opened(self) -> bool {
        matches!(self, SinkState::Idle | SinkState::Running)
    }
}

impl fmt::Display for SinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SinkState::Init => "INIT",
            SinkState::Idle => "IDLE",
            SinkState::Running => "RUNNING",
            SinkState::Suspended => "SUSPENDED",
            SinkState::Unlinked => "UNLINKED",
        };
        f.write_str(name)
    }
}
