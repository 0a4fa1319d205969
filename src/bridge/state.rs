use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Idle,
    Starting,
    Running,
    Updating,
    Disposing,
    Disposed,
}

impl RuntimeState {
    /// A loop thread exists and owns a native tray.
    pub fn is_live(&self) -> bool {
        matches!(self, RuntimeState::Running | RuntimeState::Updating)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RuntimeState::Disposing | RuntimeState::Disposed)
    }

    pub fn can_transition_to(&self, next: RuntimeState) -> bool {
        use RuntimeState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Idle, Disposed)
                | (Starting, Running)
                | (Starting, Idle)
                | (Running, Updating)
                | (Updating, Running)
                | (Running, Disposing)
                | (Updating, Disposing)
                | (Running, Disposed)
                | (Updating, Disposed)
                | (Disposing, Disposed)
        )
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
