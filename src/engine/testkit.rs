//! Shared fixtures for engine and reaper tests.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar::CalendarCache;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::payment::{GatewayError, PaymentGateway};

use super::{Clock, Collaborators, Engine, HoldRequest};

pub const H: Ms = 3_600_000;
pub const M: Ms = 60_000;

/// 2025-01-06, a Monday.
pub fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 6).unwrap()
}

/// `hour:minute` on `monday()`.
pub fn at(hour: i64, minute: i64) -> Ms {
    day_start_ms(monday()) + hour * H + minute * M
}

pub fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slopebook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

#[derive(Clone)]
pub struct ManualClock(Arc<AtomicI64>);

impl ManualClock {
    pub fn new(now: Ms) -> Self {
        Self(Arc::new(AtomicI64::new(now)))
    }

    pub fn clock(&self) -> Clock {
        let now = self.0.clone();
        Arc::new(move || now.load(Ordering::SeqCst))
    }

    pub fn set(&self, now: Ms) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.0.fetch_add(by, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Intent(Ulid),
    Capture(Ulid),
    Refund(Ulid, CloseReason),
}

/// Gateway that records every call and fails on demand.
#[derive(Default)]
pub struct FakeGateway {
    pub calls: Mutex<Vec<GatewayCall>>,
    failing: Mutex<HashSet<Ulid>>,
    down: Mutex<bool>,
}

impl FakeGateway {
    /// Every call for `deposit_id` fails until `recover` is called.
    pub fn fail_for(&self, deposit_id: Ulid) {
        self.failing.lock().unwrap().insert(deposit_id);
    }

    pub fn set_down(&self, down: bool) {
        *self.down.lock().unwrap() = down;
    }

    pub fn recover(&self, deposit_id: Ulid) {
        self.failing.lock().unwrap().remove(&deposit_id);
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn refunds(&self) -> Vec<Ulid> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                GatewayCall::Refund(id, _) => Some(id),
                _ => None,
            })
            .collect()
    }

    fn check(&self, deposit_id: Ulid) -> Result<(), GatewayError> {
        if *self.down.lock().unwrap() {
            return Err(GatewayError::Unavailable("maintenance".into()));
        }
        if self.failing.lock().unwrap().contains(&deposit_id) {
            return Err(GatewayError::Timeout);
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_intent(&self, deposit_id: Ulid, _amount_cents: u64) -> Result<String, GatewayError> {
        self.check(deposit_id)?;
        self.calls.lock().unwrap().push(GatewayCall::Intent(deposit_id));
        Ok(format!("pi_{deposit_id}"))
    }

    async fn capture(&self, deposit_id: Ulid, _amount_cents: u64) -> Result<(), GatewayError> {
        self.check(deposit_id)?;
        self.calls.lock().unwrap().push(GatewayCall::Capture(deposit_id));
        Ok(())
    }

    async fn refund(&self, deposit_id: Ulid, _amount_cents: u64, reason: CloseReason) -> Result<(), GatewayError> {
        self.check(deposit_id)?;
        self.calls.lock().unwrap().push(GatewayCall::Refund(deposit_id, reason));
        Ok(())
    }
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub gateway: Arc<FakeGateway>,
    pub calendar: Arc<CalendarCache>,
    pub clock: ManualClock,
}

/// Fresh engine on an empty WAL, clock at midnight of `monday()`.
pub fn harness(name: &str) -> Harness {
    harness_at(&test_wal_path(name))
}

/// Engine over an existing WAL file (for replay tests).
pub fn harness_at(path: &Path) -> Harness {
    let gateway = Arc::new(FakeGateway::default());
    let calendar = Arc::new(CalendarCache::new());
    let clock = ManualClock::new(at(0, 0));
    let collaborators = Collaborators::new(calendar.clone(), gateway.clone()).with_clock(clock.clock());
    let engine = Engine::new(path.to_path_buf(), Arc::new(NotifyHub::new()), collaborators).unwrap();
    Harness {
        engine: Arc::new(engine),
        gateway,
        calendar,
        clock,
    }
}

/// Instructor working Mondays 09:00-12:00.
pub async fn monday_instructor(engine: &Engine) -> Ulid {
    let id = Ulid::new();
    engine
        .upsert_working_hours(
            id,
            vec![DayWindow {
                day_of_week: 1,
                start_minute: 9 * 60,
                end_minute: 12 * 60,
            }],
        )
        .await
        .unwrap();
    id
}

pub fn hold_request(instructor_id: Ulid, start: Ms, end: Ms, deposit_cents: Option<u64>) -> HoldRequest {
    HoldRequest {
        booking_request_id: Ulid::new(),
        instructor_id,
        span: Span::new(start, end),
        client_email: "rider@example.com".into(),
        deposit_amount_cents: deposit_cents,
    }
}
