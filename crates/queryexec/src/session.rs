use tracing::{debug, warn};

use crate::errors::{ExecError, Result};
use crate::source::DataSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Open,
    Closed,
}

/// Scoped session on a data source.
///
/// Once `open` has been called the session is closed exactly once: either
/// explicitly through `close`, or when the guard is dropped. This holds even
/// if starting the session failed.
#[derive(Debug)]
pub struct Session<'a, S: DataSource + ?Sized> {
    source: &'a mut S,
    state: SessionState,
}

impl<'a, S: DataSource + ?Sized> Session<'a, S> {
    pub fn new(source: &'a mut S) -> Self {
        Session {
            source,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn open(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(ExecError::SessionState(format!(
                "cannot open session in state {:?}",
                self.state
            )));
        }
        // Mark as open first so a failed start still gets closed.
        self.state = SessionState::Open;
        self.source.start_session()
    }

    /// The data source, only available while the session is open.
    pub fn source(&self) -> Result<&S> {
        match self.state {
            SessionState::Open => Ok(self.source),
            state => Err(ExecError::SessionState(format!(
                "data source accessed in session state {state:?}"
            ))),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        match self.state {
            SessionState::Open => {
                self.state = SessionState::Closed;
                debug!("closing session");
                self.source.close_session()
            }
            SessionState::Idle => {
                self.state = SessionState::Closed;
                Ok(())
            }
            SessionState::Closed => Err(ExecError::SessionState(
                "session already closed".to_string(),
            )),
        }
    }
}

impl<S: DataSource + ?Sized> Drop for Session<'_, S> {
    fn drop(&mut self) {
        if self.state == SessionState::Open {
            self.state = SessionState::Closed;
            if let Err(e) = self.source.close_session() {
                warn!(%e, "failed to close session on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryDataSource;

    #[test]
    fn closes_once_on_drop() {
        let mut source = MemoryDataSource::new();
        let counters = source.counters();
        {
            let mut session = Session::new(&mut source);
            session.open().unwrap();
            session.source().unwrap();
        }
        assert_eq!(1, counters.started());
        assert_eq!(1, counters.closed());
    }

    #[test]
    fn explicit_close_then_drop() {
        let mut source = MemoryDataSource::new();
        let counters = source.counters();
        {
            let mut session = Session::new(&mut source);
            session.open().unwrap();
            session.close().unwrap();
            assert!(matches!(session.close(), Err(ExecError::SessionState(_))));
            assert!(session.source().is_err());
        }
        assert_eq!(1, counters.closed());
    }

    #[test]
    fn failed_start_still_closed() {
        let mut source = MemoryDataSource::new().with_start_failure("no connection");
        let counters = source.counters();
        {
            let mut session = Session::new(&mut source);
            assert!(session.open().is_err());
        }
        assert_eq!(0, counters.started());
        assert_eq!(1, counters.failed_starts());
        assert_eq!(1, counters.closed());
    }

    #[test]
    fn never_opened_is_not_closed() {
        let mut source = MemoryDataSource::new();
        let counters = source.counters();
        drop(Session::new(&mut source));
        assert_eq!(0, counters.closed());
    }
}
