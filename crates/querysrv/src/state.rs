use queryexec::ExecError;
use tracing::debug;

/// Lifecycle of a single request on the handler.
///
/// `Closed` is terminal and is reached exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Idle,
    SessionOpen,
    Streaming,
    SingleShot,
    Closed,
}

impl HandlerState {
    pub fn can_transition(self, to: HandlerState) -> bool {
        use HandlerState::*;
        matches!(
            (self, to),
            (Idle, SessionOpen)
                | (SessionOpen, Streaming)
                | (SessionOpen, SingleShot)
                | (Idle | SessionOpen | Streaming | SingleShot, Closed)
        )
    }

    pub fn transition(&mut self, to: HandlerState) -> Result<(), ExecError> {
        if !self.can_transition(to) {
            return Err(ExecError::SessionState(format!(
                "illegal handler transition from {self:?} to {to:?}"
            )));
        }
        debug!(from = ?self, ?to, "handler state transition");
        *self = to;
        Ok(())
    }

    pub fn is_closed(self) -> bool {
        self == HandlerState::Closed
    }
}
