//! Periodic polling of a remote exchange.
//!
//! A [`Poller`] owns a registry of live polls, keyed by exchange. Each poll
//! is one tokio task running a sequential loop: query, report, sleep. Query
//! errors are logged, published on the diagnostics channel and retried on
//! the next tick; they never end the loop.
//!
//! Cancellation is synchronous. Once [`PollHandle::cancel`] returns, the
//! loop will not call `on_update` again and will not complete, even if a
//! query was in flight at the time; that query's result is dropped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use crate::error::{ExchangeError, Result};

const DIAGNOSTIC_CAPACITY: usize = 256;

/// How a poll ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome<T> {
    /// `is_done` held for this value.
    Completed(T),
    /// Cancelled before completion.
    Cancelled,
}

impl<T> PollOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A query failure observed by a poll.
#[derive(Debug, Clone, PartialEq)]
pub struct PollDiagnostic {
    pub key: String,
    pub message: String,
    /// Microseconds since Unix epoch.
    pub at: u64,
}

/// Cancellation flag of one poll.
///
/// The flag is checked and `on_update` is run under the same lock, which is
/// what makes `cancel` synchronous.
#[derive(Debug)]
struct Gate {
    cancelled: Mutex<bool>,
    signal: watch::Sender<bool>,
}

impl Gate {
    fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            cancelled: Mutex::new(false),
            signal,
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.cancelled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel(&self) {
        *self.lock() = true;
        self.signal.send_replace(true);
    }

    fn is_cancelled(&self) -> bool {
        *self.lock()
    }
}

#[derive(Debug)]
struct Registry {
    live: Mutex<HashMap<String, Arc<Gate>>>,
    diagnostics: broadcast::Sender<PollDiagnostic>,
}

impl Registry {
    fn live(&self) -> MutexGuard<'_, HashMap<String, Arc<Gate>>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Free the slot for `key` if it still belongs to `gate`.
    fn release(&self, key: &str, gate: &Arc<Gate>) {
        let mut live = self.live();
        if live.get(key).is_some_and(|g| Arc::ptr_eq(g, gate)) {
            live.remove(key);
        }
    }

    fn report(&self, key: &str, err: &ExchangeError) {
        log::warn!("poll {key}: {err}");
        // No subscribers is fine.
        let _ = self.diagnostics.send(PollDiagnostic {
            key: key.to_string(),
            message: err.to_string(),
            at: crate::time::now_micros(),
        });
    }
}

/// Spawns and tracks polls. Cheap to clone; clones share the registry.
#[derive(Debug, Clone)]
pub struct Poller {
    registry: Arc<Registry>,
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller {
    pub fn new() -> Self {
        let (diagnostics, _) = broadcast::channel(DIAGNOSTIC_CAPACITY);
        Self {
            registry: Arc::new(Registry {
                live: Mutex::new(HashMap::new()),
                diagnostics,
            }),
        }
    }

    /// Subscribe to query failures of every poll started from here on.
    pub fn diagnostics(&self) -> broadcast::Receiver<PollDiagnostic> {
        self.registry.diagnostics.subscribe()
    }

    /// Whether a poll is live for `key`.
    pub fn is_polling(&self, key: &str) -> bool {
        self.registry.live().contains_key(key)
    }

    pub fn active_count(&self) -> usize {
        self.registry.live().len()
    }

    /// Start polling `query` every `interval` until `is_done` holds.
    ///
    /// `on_update` sees every successful result before `is_done` does.
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// `AlreadyPolling` if a poll for `key` is live, `Validation` for an
    /// empty key or a zero interval.
    pub fn start<T, Q, Fut, D, U>(
        &self,
        key: &str,
        query: Q,
        is_done: D,
        on_update: U,
        interval: Duration,
    ) -> Result<PollHandle<T>>
    where
        T: Clone + Send + Sync + 'static,
        Q: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        D: Fn(&T) -> bool + Send + 'static,
        U: Fn(&T) + Send + 'static,
    {
        if key.trim().is_empty() {
            return Err(ExchangeError::Validation("poll key is empty".into()));
        }
        if interval.is_zero() {
            return Err(ExchangeError::Validation(
                "poll interval must be positive".into(),
            ));
        }

        let gate = Arc::new(Gate::new());
        {
            let mut live = self.registry.live();
            if live.contains_key(key) {
                return Err(ExchangeError::AlreadyPolling(key.to_string()));
            }
            live.insert(key.to_string(), Arc::clone(&gate));
        }

        let (outcome_tx, _) = watch::channel(None);
        let outcome = Arc::new(outcome_tx);

        let task_key = key.to_string();
        let task_gate = Arc::clone(&gate);
        let task_outcome = Arc::clone(&outcome);
        let registry = Arc::clone(&self.registry);
        let mut cancel_rx = gate.signal.subscribe();

        tokio::spawn(async move {
            loop {
                if task_gate.is_cancelled() {
                    break;
                }
                let result = tokio::select! {
                    biased;
                    _ = cancel_rx.changed() => break,
                    result = query() => result,
                };
                match result {
                    Ok(value) => {
                        match deliver(&task_gate, &task_outcome, value, &on_update, &is_done) {
                            Step::Continue => {}
                            Step::Cancelled => break,
                            Step::Completed => {
                                registry.release(&task_key, &task_gate);
                                log::debug!("poll {task_key} completed");
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        if task_gate.is_cancelled() {
                            break;
                        }
                        registry.report(&task_key, &err);
                    }
                }
                tokio::select! {
                    biased;
                    _ = cancel_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            settle(&task_outcome, PollOutcome::Cancelled);
            registry.release(&task_key, &task_gate);
            log::debug!("poll {task_key} cancelled");
        });

        log::debug!("poll {key} started ({}ms)", interval.as_millis());
        Ok(PollHandle {
            key: key.to_string(),
            gate,
            outcome,
            registry: Arc::clone(&self.registry),
        })
    }

    /// Cancel every live poll.
    pub fn shutdown(&self) {
        let gates: Vec<(String, Arc<Gate>)> = self.registry.live().drain().collect();
        for (key, gate) in gates {
            gate.cancel();
            log::debug!("poll {key} cancelled by shutdown");
        }
    }
}

enum Step {
    Continue,
    Completed,
    Cancelled,
}

/// Hand one successful result to the callbacks unless cancelled.
fn deliver<T, U, D>(
    gate: &Gate,
    outcome: &watch::Sender<Option<PollOutcome<T>>>,
    value: T,
    on_update: &U,
    is_done: &D,
) -> Step
where
    U: Fn(&T),
    D: Fn(&T) -> bool,
{
    let cancelled = gate.lock();
    if *cancelled {
        return Step::Cancelled;
    }
    on_update(&value);
    if is_done(&value) {
        settle(outcome, PollOutcome::Completed(value));
        return Step::Completed;
    }
    Step::Continue
}

/// Publish the outcome unless one is already set.
fn settle<T>(outcome: &watch::Sender<Option<PollOutcome<T>>>, value: PollOutcome<T>) {
    outcome.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(value);
        true
    });
}

/// Control over one running poll. Dropping it leaves the poll running.
pub struct PollHandle<T> {
    key: String,
    gate: Arc<Gate>,
    outcome: Arc<watch::Sender<Option<PollOutcome<T>>>>,
    registry: Arc<Registry>,
}

impl<T> Clone for PollHandle<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            gate: Arc::clone(&self.gate),
            outcome: Arc::clone(&self.outcome),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T> std::fmt::Debug for PollHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollHandle")
            .field("key", &self.key)
            .field("cancelled", &self.gate.is_cancelled())
            .finish()
    }
}

impl<T: Clone> PollHandle<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stop the poll. No `on_update` runs after this returns.
    pub fn cancel(&self) {
        self.gate.cancel();
        settle(&self.outcome, PollOutcome::Cancelled);
        self.registry.release(&self.key, &self.gate);
    }

    pub fn is_cancelled(&self) -> bool {
        self.gate.is_cancelled()
    }

    /// The outcome, if the poll has ended.
    pub fn outcome(&self) -> Option<PollOutcome<T>> {
        self.outcome.borrow().clone()
    }

    /// Wait for the poll to end.
    pub async fn finished(&self) -> PollOutcome<T> {
        let mut rx = self.outcome.subscribe();
        let ended = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|outcome| outcome.clone());
        ended.unwrap_or(PollOutcome::Cancelled)
    }
}
