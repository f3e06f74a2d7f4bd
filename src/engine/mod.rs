mod conflict;
mod error;
mod holds;
mod ledger;
mod lifecycle;
mod mutations;
mod queries;
mod slots;
#[cfg(test)]
pub(crate) mod testkit;

pub use conflict::now_ms;
pub use error::{EngineError, ErrorKind};
pub use holds::{AcceptBlocker, AcceptCheck, HoldRequest, ReleaseOutcome};
pub use ledger::{BookingEntry, InstructorLedger};
pub use lifecycle::{can_act_on, can_manage_schedule, Actor, Capabilities, PaymentOutcome};
pub use slots::{generate_slots, merge_overlapping, query_window, validate_slot_query};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::calendar::CalendarBusyTimeProvider;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::payment::PaymentGateway;
use crate::wal::Wal;

pub type SharedLedger = Arc<RwLock<InstructorLedger>>;

/// Source of "now". Tests swap in a manual clock.
pub type Clock = Arc<dyn Fn() -> Ms + Send + Sync>;

/// Time windows governing holds.
#[derive(Debug, Clone, Copy)]
pub struct BookingPolicy {
    /// Lifetime of a fresh hold.
    pub hold_window: Ms,
    /// How long a paid request stays reserved for the instructor to accept.
    pub acceptance_window: Ms,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            hold_window: 30 * MINUTE_MS,
            acceptance_window: 48 * 60 * MINUTE_MS,
        }
    }
}

/// External services the engine calls out to.
pub struct Collaborators {
    pub calendar: Arc<dyn CalendarBusyTimeProvider>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub policy: BookingPolicy,
    pub clock: Clock,
}

impl Collaborators {
    pub fn new(calendar: Arc<dyn CalendarBusyTimeProvider>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            calendar,
            gateway,
            policy: BookingPolicy::default(),
            clock: Arc::new(now_ms),
        }
    }

    pub fn with_policy(mut self, policy: BookingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Every append already queued when the first one arrives joins
/// its batch, and the batch shares one fsync. A compaction or counter request
/// found mid-drain waits until the batch is answered.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty
                    }
                }

                commit_batch(&mut wal, &mut batch);
                // Non-append commands run after the batch they interrupted.
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

pub struct Engine {
    pub(super) ledgers: DashMap<Ulid, SharedLedger>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking or deposit id → instructor id
    pub(super) entity_to_instructor: DashMap<Ulid, Ulid>,
    pub(super) calendar: Arc<dyn CalendarBusyTimeProvider>,
    pub(super) gateway: Arc<dyn PaymentGateway>,
    pub(super) policy: BookingPolicy,
    /// Held for read while a new ledger takes its first write, for write while
    /// compaction snapshots the ledger set.
    pub(super) creation_gate: RwLock<()>,
    clock: Clock,
}

/// Apply an event to a ledger (no locking; caller holds the lock).
fn apply_to_ledger(ledger: &mut InstructorLedger, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    if let Event::BookingRequested { booking, deposit, .. } = event {
        entity_map.insert(booking.id, booking.instructor_id);
        if let Some(deposit) = deposit {
            entity_map.insert(deposit.id, booking.instructor_id);
        }
    }
    ledger.apply(event);
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, collaborators: Collaborators) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            ledgers: DashMap::new(),
            wal_tx,
            notify,
            entity_to_instructor: DashMap::new(),
            calendar: collaborators.calendar,
            gateway: collaborators.gateway,
            policy: collaborators.policy,
            creation_gate: RwLock::new(()),
            clock: collaborators.clock,
        };

        // We're the sole owner of these Arcs, so try_write always succeeds.
        // Never use blocking_write here: this runs inside an async context.
        for event in &events {
            let ledger = engine.ledger_or_create(event.instructor_id());
            let mut guard = ledger.try_write().expect("replay: uncontended write");
            apply_to_ledger(&mut guard, event, &engine.entity_to_instructor);
        }

        tracing::info!(
            events = events.len(),
            instructors = engine.ledgers.len(),
            "ledger replayed from {}",
            wal_path.display()
        );
        Ok(engine)
    }

    pub fn now(&self) -> Ms {
        (self.clock)()
    }

    pub fn policy(&self) -> BookingPolicy {
        self.policy
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn ledger(&self, instructor_id: &Ulid) -> Option<SharedLedger> {
        self.ledgers.get(instructor_id).map(|e| e.value().clone())
    }

    pub(super) fn ledger_or_create(&self, instructor_id: Ulid) -> SharedLedger {
        self.ledgers
            .entry(instructor_id)
            .or_insert_with(|| Arc::new(RwLock::new(InstructorLedger::new(instructor_id))))
            .clone()
    }

    pub fn instructor_for(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_instructor.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        ledger: &mut InstructorLedger,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_ledger(ledger, event, &self.entity_to_instructor);
        self.notify.send(ledger.instructor_id, event);
        Ok(())
    }

    /// Lookup booking/deposit → instructor, acquire that ledger's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<InstructorLedger>), EngineError> {
        let instructor_id = self
            .instructor_for(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let ledger = self
            .ledger(&instructor_id)
            .ok_or(EngineError::NotFound(instructor_id))?;
        let guard = ledger.write_owned().await;
        Ok((instructor_id, guard))
    }
}
