//! HTTP surface over the booking engine.

mod error;
mod handlers;

pub use error::ApiError;

use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::calendar::CalendarCache;
use crate::config::Secrets;
use crate::engine::Engine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    /// Same cache the engine reads busy time from; the sync push writes here.
    pub calendar: Arc<CalendarCache>,
    pub secrets: Arc<Secrets>,
    pub compact_threshold: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/instructors/:id/working-hours",
            get(handlers::list_working_hours).put(handlers::put_working_hours),
        )
        .route(
            "/instructors/:id/working-hours/:day",
            axum::routing::delete(handlers::delete_working_hours),
        )
        .route("/instructors/:id/slots", get(handlers::slots))
        .route("/instructors/:id/calendar/busy", put(handlers::push_busy_time))
        .route("/instructors/:id/events", get(handlers::events))
        .route("/bookings", post(handlers::create_booking))
        .route(
            "/bookings/:id",
            get(handlers::get_booking).patch(handlers::update_booking_status),
        )
        .route("/bookings/:id/can-accept", get(handlers::can_accept))
        .route("/payments/:deposit_id/succeeded", post(handlers::payment_succeeded))
        .route("/payments/:deposit_id/failed", post(handlers::payment_failed))
        .route("/cron/tick", post(handlers::cron_tick))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
