use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};
use typereg::{TypeDescriptor, Value};

use crate::errors::{ExecError, Result, source_err};

/// Lazy, fallible sequence of values.
pub type RowIter<'a> = Box<dyn Iterator<Item = Result<Value>> + Send + 'a>;

/// Live data set a query executes against.
///
/// A handle is not reentrant: it serves one session at a time, which is
/// enforced by taking `&mut self` for session transitions.
pub trait DataSource: Send + Sync {
    /// Prepare the handle for one request.
    ///
    /// Must succeed even if the previous session was never closed.
    fn start_session(&mut self) -> Result<()>;

    /// Release whatever the current session holds. Called exactly once per
    /// session, including after a failed `start_session`.
    fn close_session(&mut self) -> Result<()>;

    /// Root sequence of `entity`. Rows are produced lazily.
    fn get_root(&self, entity: &TypeDescriptor) -> Result<RowIter<'_>>;
}

/// Session bookkeeping shared with whoever wants to observe a source.
#[derive(Debug, Default)]
pub struct SessionCounters {
    started: AtomicU64,
    failed_starts: AtomicU64,
    closed: AtomicU64,
    recovered: AtomicU64,
    rows_produced: AtomicU64,
}

impl SessionCounters {
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }

    pub fn failed_starts(&self) -> u64 {
        self.failed_starts.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sessions started while a previous one was still open.
    pub fn recovered(&self) -> u64 {
        self.recovered.load(Ordering::SeqCst)
    }

    /// Rows handed out by root sequences.
    pub fn rows_produced(&self) -> u64 {
        self.rows_produced.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    after_rows: usize,
    message: String,
}

/// In-memory data source holding one table of records per entity.
#[derive(Debug, Default)]
pub struct MemoryDataSource {
    tables: HashMap<String, Arc<Vec<Value>>>,
    failures: HashMap<String, InjectedFailure>,
    fail_start: Option<String>,
    open: bool,
    counters: Arc<SessionCounters>,
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the rows of `entity`'s root sequence.
    pub fn with_table(mut self, entity: &TypeDescriptor, rows: Vec<Value>) -> Self {
        self.tables.insert(entity.name.clone(), Arc::new(rows));
        self
    }

    /// Make the root sequence of `entity` fail after producing `after_rows`
    /// rows.
    pub fn with_failure(
        mut self,
        entity: &TypeDescriptor,
        after_rows: usize,
        message: impl Into<String>,
    ) -> Self {
        self.failures.insert(
            entity.name.clone(),
            InjectedFailure {
                after_rows,
                message: message.into(),
            },
        );
        self
    }

    /// Make every `start_session` fail.
    pub fn with_start_failure(mut self, message: impl Into<String>) -> Self {
        self.fail_start = Some(message.into());
        self
    }

    pub fn counters(&self) -> Arc<SessionCounters> {
        self.counters.clone()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

impl DataSource for MemoryDataSource {
    fn start_session(&mut self) -> Result<()> {
        if self.open {
            warn!("previous session was not closed, recovering");
            self.counters.recovered.fetch_add(1, Ordering::SeqCst);
            self.open = false;
        }
        if let Some(message) = &self.fail_start {
            self.counters.failed_starts.fetch_add(1, Ordering::SeqCst);
            return Err(source_err!("{message}"));
        }
        self.open = true;
        self.counters.started.fetch_add(1, Ordering::SeqCst);
        debug!("memory source session started");
        Ok(())
    }

    fn close_session(&mut self) -> Result<()> {
        self.open = false;
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        debug!("memory source session closed");
        Ok(())
    }

    fn get_root(&self, entity: &TypeDescriptor) -> Result<RowIter<'_>> {
        if !self.open {
            return Err(ExecError::SessionState(
                "root sequence requested outside of a session".to_string(),
            ));
        }
        let rows = self
            .tables
            .get(&entity.name)
            .ok_or_else(|| source_err!("no root sequence for {entity}"))?
            .clone();
        let failure = self.failures.get(&entity.name).cloned();
        let counters = self.counters.clone();

        let mut idx = 0;
        let iter = std::iter::from_fn(move || {
            if let Some(failure) = &failure {
                if idx == failure.after_rows {
                    // Fail once, then end.
                    idx = usize::MAX;
                    return Some(Err(source_err!("{}", failure.message)));
                }
            }
            let row = rows.get(idx)?.clone();
            idx += 1;
            counters.rows_produced.fetch_add(1, Ordering::SeqCst);
            Some(Ok(row))
        });

        Ok(Box::new(iter))
    }
}
