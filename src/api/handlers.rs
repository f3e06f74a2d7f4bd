use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::Json;
use chrono::NaiveDate;
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use ulid::Ulid;

use crate::auth::check_bearer;
use crate::calendar::CalendarBusyTimeProvider;
use crate::engine::{
    can_act_on, can_manage_schedule, AcceptCheck, Actor, BookingEntry, EngineError, HoldRequest,
    PaymentOutcome,
};
use crate::limits::MAX_BUSY_INTERVALS_PER_PUSH;
use crate::model::*;
use crate::reaper;

use super::{ApiError, AppState};

type ApiResult<T> = Result<T, ApiError>;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// ── Working hours ────────────────────────────────────────

#[derive(Deserialize)]
pub struct WorkingHoursBody {
    windows: Vec<DayWindow>,
}

pub async fn list_working_hours(
    State(state): State<AppState>,
    path: Result<Path<Ulid>, PathRejection>,
) -> ApiResult<Json<Vec<WorkingHourRule>>> {
    let Path(instructor_id) = path?;
    Ok(Json(state.engine.working_hours(&instructor_id).await))
}

pub async fn put_working_hours(
    State(state): State<AppState>,
    actor: Actor,
    path: Result<Path<Ulid>, PathRejection>,
    body: Result<Json<WorkingHoursBody>, JsonRejection>,
) -> ApiResult<Json<Vec<WorkingHourRule>>> {
    let Path(instructor_id) = path?;
    if !can_manage_schedule(&actor, instructor_id) {
        return Err(ApiError::forbidden());
    }
    let Json(body) = body?;
    let rules = state
        .engine
        .upsert_working_hours(instructor_id, body.windows)
        .await?;
    Ok(Json(rules))
}

pub async fn delete_working_hours(
    State(state): State<AppState>,
    actor: Actor,
    path: Result<Path<(Ulid, u8)>, PathRejection>,
) -> ApiResult<Json<WorkingHourRule>> {
    let Path((instructor_id, day)) = path?;
    if !can_manage_schedule(&actor, instructor_id) {
        return Err(ApiError::forbidden());
    }
    let removed = state.engine.remove_working_hours(instructor_id, day).await?;
    Ok(Json(removed))
}

// ── Slots and busy time ──────────────────────────────────

#[derive(Deserialize)]
pub struct SlotQuery {
    start: NaiveDate,
    end: NaiveDate,
    /// Slot length in minutes.
    duration: u32,
}

pub async fn slots(
    State(state): State<AppState>,
    path: Result<Path<Ulid>, PathRejection>,
    query: Result<Query<SlotQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<Slot>>> {
    let Path(instructor_id) = path?;
    let Query(q) = query?;
    let slots = state
        .engine
        .generate_slots(instructor_id, q.start, q.end, q.duration)
        .await?;
    Ok(Json(slots))
}

#[derive(Deserialize)]
pub struct BusyInterval {
    start: Ms,
    end: Ms,
}

#[derive(Deserialize)]
pub struct BusyBody {
    busy: Vec<BusyInterval>,
}

/// Replace an instructor's calendar busy time. Called by the external sync job.
pub async fn push_busy_time(
    State(state): State<AppState>,
    headers: HeaderMap,
    path: Result<Path<Ulid>, PathRejection>,
    body: Result<Json<BusyBody>, JsonRejection>,
) -> ApiResult<StatusCode> {
    check_bearer(&headers, state.secrets.sync.as_deref())?;
    let Path(instructor_id) = path?;
    let Json(body) = body?;
    if body.busy.len() > MAX_BUSY_INTERVALS_PER_PUSH {
        return Err(EngineError::LimitExceeded("too many busy intervals").into());
    }
    let spans = body
        .busy
        .iter()
        .map(|b| Span::try_new(b.start, b.end))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| ApiError::bad_request("busy interval must end after it starts"))?;
    state.calendar.replace(instructor_id, spans);
    Ok(StatusCode::NO_CONTENT)
}

/// Server-sent stream of an instructor's ledger events.
pub async fn events(
    State(state): State<AppState>,
    path: Result<Path<Ulid>, PathRejection>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, axum::Error>>>> {
    let Path(instructor_id) = path?;
    let rx = state.engine.notify.subscribe(instructor_id);
    let stream = futures::stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let sse = SseEvent::default().event(event_name(&event)).json_data(&event);
                    return Some((sse, rx));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%instructor_id, skipped, "event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn event_name(event: &Event) -> &'static str {
    match event {
        Event::WorkingHoursUpserted { .. } => "working_hours_upserted",
        Event::WorkingHoursRemoved { .. } => "working_hours_removed",
        Event::BookingRequested { .. } => "booking_requested",
        Event::HoldConfirmed { .. } => "hold_confirmed",
        Event::BookingAccepted { .. } => "booking_accepted",
        Event::DepositUpdated { .. } => "deposit_updated",
        Event::BookingClosed { .. } => "booking_closed",
        Event::BookingCompleted { .. } => "booking_completed",
    }
}

// ── Bookings ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateBooking {
    /// Client-chosen id makes retries idempotent.
    booking_request_id: Option<Ulid>,
    instructor_id: Ulid,
    start: Ms,
    end: Ms,
    deposit_amount_cents: Option<u64>,
}

pub async fn create_booking(
    State(state): State<AppState>,
    actor: Actor,
    body: Result<Json<CreateBooking>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<BookingEntry>)> {
    let Actor::Client { email } = actor else {
        return Err(EngineError::NotAuthorized.into());
    };
    let Json(body) = body?;
    let span = Span::try_new(body.start, body.end)
        .ok_or(EngineError::InvalidRange("booking must end after it starts"))?;
    let entry = state
        .engine
        .place_hold(HoldRequest {
            booking_request_id: body.booking_request_id.unwrap_or_else(Ulid::new),
            instructor_id: body.instructor_id,
            span,
            client_email: email,
            deposit_amount_cents: body.deposit_amount_cents,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

/// Load a booking the actor has some standing on.
async fn visible_booking(state: &AppState, actor: &Actor, booking_id: Ulid) -> ApiResult<BookingEntry> {
    let entry = state.engine.booking(&booking_id).await?;
    if !can_act_on(actor, &entry.booking).any() {
        return Err(EngineError::NotAuthorized.into());
    }
    Ok(entry)
}

pub async fn get_booking(
    State(state): State<AppState>,
    actor: Actor,
    path: Result<Path<Ulid>, PathRejection>,
) -> ApiResult<Json<BookingEntry>> {
    let Path(booking_id) = path?;
    Ok(Json(visible_booking(&state, &actor, booking_id).await?))
}

pub async fn can_accept(
    State(state): State<AppState>,
    actor: Actor,
    path: Result<Path<Ulid>, PathRejection>,
) -> ApiResult<Json<AcceptCheck>> {
    let Path(booking_id) = path?;
    visible_booking(&state, &actor, booking_id).await?;
    Ok(Json(state.engine.can_accept_booking(booking_id).await))
}

#[derive(Deserialize)]
pub struct StatusBody {
    status: BookingStatus,
}

pub async fn update_booking_status(
    State(state): State<AppState>,
    actor: Actor,
    path: Result<Path<Ulid>, PathRejection>,
    body: Result<Json<StatusBody>, JsonRejection>,
) -> ApiResult<Json<BookingEntry>> {
    let Path(booking_id) = path?;
    let Json(body) = body?;
    let entry = state.engine.transition(booking_id, &actor, body.status).await?;
    Ok(Json(entry))
}

// ── Machine endpoints ────────────────────────────────────

pub async fn payment_succeeded(
    State(state): State<AppState>,
    headers: HeaderMap,
    path: Result<Path<Ulid>, PathRejection>,
) -> ApiResult<Json<PaymentOutcome>> {
    check_bearer(&headers, state.secrets.webhook.as_deref())?;
    let Path(deposit_id) = path?;
    Ok(Json(state.engine.on_payment_succeeded(deposit_id).await?))
}

pub async fn payment_failed(
    State(state): State<AppState>,
    headers: HeaderMap,
    path: Result<Path<Ulid>, PathRejection>,
) -> ApiResult<Json<PaymentOutcome>> {
    check_bearer(&headers, state.secrets.webhook.as_deref())?;
    let Path(deposit_id) = path?;
    Ok(Json(state.engine.on_payment_failed(deposit_id).await?))
}

/// Periodic maintenance. Each task reports on its own; one failing does not
/// stop the others.
pub async fn cron_tick(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    check_bearer(&headers, state.secrets.cron.as_deref())?;

    let cleanup = reaper::process_expired_deposits(&state.engine).await;
    let cleanup = json!({
        "success": cleanup.failures.is_empty(),
        "processed_count": cleanup.processed_count,
        "deposit_ids": cleanup.deposit_ids,
        "booking_ids": cleanup.booking_ids,
        "failures": cleanup.failures,
    });

    let sync = match state.calendar.sync(state.engine.now()).await {
        Ok(report) => json!({
            "success": true,
            "instructors": report.instructors,
            "pruned": report.pruned,
            "idle_channels_closed": state.engine.notify.prune(),
        }),
        Err(e) => {
            warn!("calendar sync failed: {e}");
            json!({ "success": false, "error": e.to_string() })
        }
    };

    let compact = match reaper::compact_if_needed(&state.engine, state.compact_threshold).await {
        Ok(report) => json!({
            "success": true,
            "compacted": report.compacted,
            "appends_since_compact": report.appends_since_compact,
            "records": report.records,
        }),
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            json!({ "success": false, "error": e.to_string() })
        }
    };

    Ok(Json(json!({
        "tasks": { "cleanup": cleanup, "sync": sync, "compact": compact }
    })))
}
