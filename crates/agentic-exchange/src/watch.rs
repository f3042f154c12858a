//! Watching one exchange's state through a poll.
//!
//! An [`ExchangeWatch`] is what every `await_*` operation returns. It is a
//! stream of accepted records (`next`), a readiness future (`ready`) and the
//! end of the whole poll (`finished`), which may run a bounded tail past
//! readiness to pick up an acknowledgement.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::error::{ExchangeError, Result};
use crate::ids::ExchangeId;
use crate::poller::{PollHandle, PollOutcome, Poller};
use crate::state::{ExchangeKind, ExchangeRecord, Observation};

/// A record shared between a component and its poll.
pub(crate) type RecordCell = Arc<Mutex<ExchangeRecord>>;

pub(crate) fn new_cell(record: ExchangeRecord) -> RecordCell {
    Arc::new(Mutex::new(record))
}

pub(crate) fn lock_cell(cell: &RecordCell) -> MutexGuard<'_, ExchangeRecord> {
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Progress reported by exchange components to whoever coordinates them.
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeEvent {
    /// A poll result was accepted.
    Updated(ExchangeRecord),
    /// The exchange reached the state that lets the next stage start.
    Ready(ExchangeRecord),
    /// The agent abandoned the exchange.
    Failed(ExchangeRecord),
}

impl ExchangeEvent {
    pub fn record(&self) -> &ExchangeRecord {
        match self {
            Self::Updated(r) | Self::Ready(r) | Self::Failed(r) => r,
        }
    }

    pub fn kind(&self) -> ExchangeKind {
        self.record().kind
    }
}

/// Sending half of a component's event channel.
pub type EventSink = mpsc::UnboundedSender<ExchangeEvent>;

#[derive(Debug, Clone, PartialEq)]
enum Readiness {
    Pending,
    Ready(ExchangeRecord),
    Abandoned(ExchangeRecord),
}

#[derive(Debug, Default)]
struct Progress {
    ready_seen: bool,
    tail_polls: u32,
}

pub(crate) struct WatchOptions {
    pub interval: Duration,
    /// Polls allowed after readiness; `None` polls until terminal.
    pub tail_limit: Option<u32>,
    pub events: Option<EventSink>,
}

/// Start polling the exchange held in `cell`.
///
/// `fetch` performs one state query. Its observation is checked against the
/// committed record; rejected observations (regressions, states off the
/// role's path) leave the record unchanged and surface as poll diagnostics.
pub(crate) fn spawn<F, Fut>(
    poller: &Poller,
    cell: RecordCell,
    fetch: F,
    options: WatchOptions,
) -> Result<ExchangeWatch>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Observation>> + Send + 'static,
{
    let (kind, id) = {
        let record = lock_cell(&cell);
        let id = record
            .id()
            .cloned()
            .ok_or(ExchangeError::NotStarted(record.kind))?;
        (record.kind, id)
    };
    let key = format!("{kind}:{id}");

    let (readiness_tx, _) = watch::channel(Readiness::Pending);
    let readiness = Arc::new(readiness_tx);
    let (updates_tx, updates) = mpsc::unbounded_channel();
    let progress = Arc::new(Mutex::new(Progress::default()));

    let query = {
        let cell = Arc::clone(&cell);
        move || {
            let observed = fetch();
            let cell = Arc::clone(&cell);
            async move {
                let observation = observed.await?;
                let current = lock_cell(&cell).clone();
                current.observe(&observation)
            }
        }
    };

    let on_update = {
        let cell = Arc::clone(&cell);
        let readiness = Arc::clone(&readiness);
        let progress = Arc::clone(&progress);
        let events = options.events;
        move |polled: &ExchangeRecord| {
            let mut progress = lock_progress(&progress);
            if progress.ready_seen {
                progress.tail_polls += 1;
            }
            let Some(record) = commit(&cell, polled) else {
                return;
            };
            let record = &record;
            log::debug!("{} {}: {}", record.kind, record.id_str(), record.state());
            // The watch may have been dropped; nobody reads the stream then.
            let _ = updates_tx.send(record.clone());

            // Events go out before readiness settles, so a coordinator that
            // drains its channel after `ready()` resolves sees this one.
            let (event, settled) = if record.is_failed() {
                log::warn!("{} {} abandoned", record.kind, record.id_str());
                (
                    ExchangeEvent::Failed(record.clone()),
                    Some(Readiness::Abandoned(record.clone())),
                )
            } else if !progress.ready_seen && record.is_ready() {
                progress.ready_seen = true;
                log::info!(
                    "{} {} ready at {}",
                    record.kind,
                    record.id_str(),
                    record.state()
                );
                (
                    ExchangeEvent::Ready(record.clone()),
                    Some(Readiness::Ready(record.clone())),
                )
            } else {
                (ExchangeEvent::Updated(record.clone()), None)
            };
            if let Some(events) = &events {
                let _ = events.send(event);
            }
            if let Some(value) = settled {
                settle(&readiness, value);
            }
        }
    };

    let is_done = {
        let progress = Arc::clone(&progress);
        let tail_limit = options.tail_limit;
        move |record: &ExchangeRecord| {
            let progress = lock_progress(&progress);
            record.is_terminal()
                || (progress.ready_seen && tail_limit.is_some_and(|l| progress.tail_polls >= l))
        }
    };

    let handle = poller.start(&key, query, is_done, on_update, options.interval)?;
    Ok(ExchangeWatch {
        kind,
        id,
        handle,
        cell,
        readiness,
        updates,
    })
}

/// Fold a polled record into the record as committed right now.
///
/// A command may have advanced the record after the query took its
/// snapshot; a poll result behind it is dropped rather than committed.
fn commit(cell: &RecordCell, polled: &ExchangeRecord) -> Option<ExchangeRecord> {
    let mut current = lock_cell(cell);
    let observation = Observation::new(polled.state(), polled.payload().clone());
    match current.observe(&observation) {
        Ok(next) => {
            *current = next.clone();
            Some(next)
        }
        Err(err) => {
            log::debug!(
                "{} {}: dropping stale poll result ({err})",
                current.kind,
                current.id_str()
            );
            None
        }
    }
}

fn lock_progress(progress: &Mutex<Progress>) -> MutexGuard<'_, Progress> {
    progress.lock().unwrap_or_else(PoisonError::into_inner)
}

fn settle(readiness: &watch::Sender<Readiness>, value: Readiness) {
    readiness.send_if_modified(|current| {
        if *current != Readiness::Pending {
            return false;
        }
        *current = value;
        true
    });
}

/// The single exchange a component is driving, plus its poll.
#[derive(Debug, Default)]
pub(crate) struct ExchangeSlot {
    cell: Option<RecordCell>,
    poll: Option<PollHandle<ExchangeRecord>>,
}

impl ExchangeSlot {
    pub fn current(&self) -> Option<ExchangeRecord> {
        self.cell.as_ref().map(|cell| lock_cell(cell).clone())
    }

    /// Fail if an exchange is still in progress.
    ///
    /// An exchange is settled once terminal, or once ready with its poll
    /// over: an acknowledgement that never arrives does not hold the slot.
    pub fn ensure_idle(&self, kind: ExchangeKind) -> Result<()> {
        let Some(record) = self.current() else {
            return Ok(());
        };
        let poll_over = self
            .poll
            .as_ref()
            .is_some_and(|poll| poll.outcome().is_some());
        if record.is_terminal() || (record.is_ready() && poll_over) {
            Ok(())
        } else {
            Err(ExchangeError::DuplicateExchange(kind))
        }
    }

    /// The cell of the current exchange, which must carry `id`.
    pub fn matching(&self, kind: ExchangeKind, id: &ExchangeId) -> Result<RecordCell> {
        let cell = self.cell.as_ref().ok_or(ExchangeError::NotStarted(kind))?;
        let current = lock_cell(cell).id().cloned();
        match current {
            Some(current) if current == *id => Ok(Arc::clone(cell)),
            Some(current) => Err(ExchangeError::Validation(format!(
                "{kind} exchange {id} is not the current exchange ({current})"
            ))),
            None => Err(ExchangeError::NotStarted(kind)),
        }
    }

    /// Replace the slot's exchange, cancelling any poll of the old one.
    pub fn begin(&mut self, record: ExchangeRecord) -> RecordCell {
        self.cancel();
        let cell = new_cell(record);
        self.cell = Some(Arc::clone(&cell));
        cell
    }

    pub fn set_poll(&mut self, handle: PollHandle<ExchangeRecord>) {
        self.poll = Some(handle);
    }

    pub fn cancel(&mut self) {
        if let Some(poll) = self.poll.take() {
            poll.cancel();
        }
    }

    /// Cancel the poll first, then drop the record.
    pub fn reset(&mut self) {
        self.cancel();
        self.cell = None;
    }
}

/// Live view of one polled exchange.
pub struct ExchangeWatch {
    kind: ExchangeKind,
    id: ExchangeId,
    handle: PollHandle<ExchangeRecord>,
    cell: RecordCell,
    readiness: Arc<watch::Sender<Readiness>>,
    updates: mpsc::UnboundedReceiver<ExchangeRecord>,
}

impl std::fmt::Debug for ExchangeWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeWatch")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("state", &self.latest().state())
            .finish()
    }
}

impl ExchangeWatch {
    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn id(&self) -> &ExchangeId {
        &self.id
    }

    /// The next accepted record, in order. `None` once the poll has ended
    /// and every update has been read.
    pub async fn next(&mut self) -> Option<ExchangeRecord> {
        self.updates.recv().await
    }

    /// Wait until the exchange is ready for the next stage.
    ///
    /// # Errors
    ///
    /// `Abandoned` if the agent abandons the exchange first, `Cancelled` if
    /// the poll is cancelled first.
    pub async fn ready(&self) -> Result<ExchangeRecord> {
        let mut rx = self.readiness.subscribe();
        let settled = tokio::select! {
            biased;
            settled = rx.wait_for(|r| *r != Readiness::Pending) => {
                settled.map(|r| (*r).clone()).unwrap_or(Readiness::Pending)
            }
            _ = self.handle.finished() => self.readiness.borrow().clone(),
        };
        match settled {
            Readiness::Ready(record) => Ok(record),
            Readiness::Abandoned(record) => Err(ExchangeError::Abandoned {
                kind: record.kind,
                id: record.id_str().to_string(),
            }),
            Readiness::Pending => Err(ExchangeError::Cancelled),
        }
    }

    /// Wait for the whole poll to end, tail included.
    pub async fn finished(&self) -> PollOutcome<ExchangeRecord> {
        self.handle.finished().await
    }

    /// The current committed record.
    pub fn latest(&self) -> ExchangeRecord {
        lock_cell(&self.cell).clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.readiness.borrow(), Readiness::Ready(_))
    }

    /// Cancel the poll. The committed record stays as it is.
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub(crate) fn handle(&self) -> PollHandle<ExchangeRecord> {
        self.handle.clone()
    }
}
