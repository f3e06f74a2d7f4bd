use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::NaiveDate;
use serde_json::{json, Value};
use tower::ServiceExt;
use ulid::Ulid;

use slopebook::api::{self, AppState};
use slopebook::calendar::CalendarCache;
use slopebook::config::Secrets;
use slopebook::engine::{Collaborators, Engine};
use slopebook::notify::NotifyHub;
use slopebook::payment::LoggingGateway;

const CRON_SECRET: &str = "cron-s3cret";
const SYNC_SECRET: &str = "sync-s3cret";

/// Monday 2030-01-07 at `hour`:00 UTC, in epoch ms.
fn monday(hour: u32) -> i64 {
    NaiveDate::from_ymd_opt(2030, 1, 7)
        .unwrap()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
        .and_utc()
        .timestamp_millis()
}

async fn app(secrets: Secrets) -> Router {
    let wal_path = std::env::temp_dir()
        .join(format!("slopebook-http-{}", Ulid::new()))
        .join("ledger.wal");
    let calendar = Arc::new(CalendarCache::new());
    let engine = Engine::new(
        wal_path,
        Arc::new(NotifyHub::new()),
        Collaborators::new(calendar.clone(), Arc::new(LoggingGateway)),
    )
    .unwrap();
    api::router(AppState {
        engine: Arc::new(engine),
        calendar,
        secrets: Arc::new(secrets),
        compact_threshold: 1000,
    })
}

fn secrets() -> Secrets {
    Secrets {
        cron: Some(CRON_SECRET.into()),
        webhook: None,
        sync: Some(SYNC_SECRET.into()),
    }
}

enum As<'a> {
    Nobody,
    Admin,
    Instructor(Ulid),
    Client(&'a str),
    Bearer(&'a str),
}

fn request(method: &str, uri: &str, who: As<'_>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    builder = match who {
        As::Nobody => builder,
        As::Admin => builder.header("x-actor-role", "admin"),
        As::Instructor(id) => builder
            .header("x-actor-role", "instructor")
            .header("x-actor-id", id.to_string()),
        As::Client(email) => builder
            .header("x-actor-role", "client")
            .header("x-actor-email", email),
        As::Bearer(token) => builder.header("authorization", format!("Bearer {token}")),
    };
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

/// Monday 09:00-12:00 for a fresh instructor.
async fn instructor_with_hours(app: &Router) -> Ulid {
    let id = Ulid::new();
    let (status, _) = send(
        app,
        request(
            "PUT",
            &format!("/instructors/{id}/working-hours"),
            As::Instructor(id),
            Some(json!({ "windows": [{ "day_of_week": 1, "start_minute": 540, "end_minute": 720 }] })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    id
}

fn booking_body(instructor: Ulid, start: i64, end: i64) -> Value {
    json!({ "instructor_id": instructor, "start": start, "end": end })
}

#[tokio::test]
async fn health() {
    let app = app(Secrets::default()).await;
    let (status, body) = send(&app, request("GET", "/health", As::Nobody, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn schedule_edits_need_the_right_identity() {
    let app = app(Secrets::default()).await;
    let id = Ulid::new();
    let uri = format!("/instructors/{id}/working-hours");
    let body = json!({ "windows": [{ "day_of_week": 1, "start_minute": 540, "end_minute": 720 }] });

    let (status, _) = send(&app, request("PUT", &uri, As::Nobody, Some(body.clone()))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, err) = send(&app, request("PUT", &uri, As::Instructor(Ulid::new()), Some(body.clone()))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(err["error"]["code"], "not_authorized");

    let (status, _) = send(&app, request("PUT", &uri, As::Client("rider@example.com"), Some(body.clone()))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, rules) = send(&app, request("PUT", &uri, As::Admin, Some(body))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rules.as_array().unwrap().len(), 1);

    let (status, listed) = send(&app, request("GET", &uri, As::Nobody, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed[0]["start_minute"], 540);

    let (status, _) = send(&app, request("DELETE", &format!("{uri}/1"), As::Instructor(id), None)).await;
    assert_eq!(status, StatusCode::OK);
    let (status, err) = send(&app, request("DELETE", &format!("{uri}/1"), As::Instructor(id), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["error"]["code"], "not_found");
}

#[tokio::test]
async fn invalid_working_hours_are_bad_requests() {
    let app = app(Secrets::default()).await;
    let id = Ulid::new();
    let uri = format!("/instructors/{id}/working-hours");

    let inverted = json!({ "windows": [{ "day_of_week": 1, "start_minute": 720, "end_minute": 540 }] });
    let (status, _) = send(&app, request("PUT", &uri, As::Instructor(id), Some(inverted))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let malformed = json!({ "windows": "monday" });
    let (status, err) = send(&app, request("PUT", &uri, As::Instructor(id), Some(malformed))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"]["code"], "invalid_input");
}

#[tokio::test]
async fn slots_reflect_holds_and_calendar() {
    let app = app(secrets()).await;
    let id = instructor_with_hours(&app).await;
    let uri = format!("/instructors/{id}/slots?start=2030-01-07&end=2030-01-07&duration=60");

    let (status, slots) = send(&app, request("GET", &uri, As::Nobody, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(slots.as_array().unwrap().len(), 3);
    assert_eq!(slots[0]["start"], monday(9));

    let (status, _) = send(
        &app,
        request("POST", "/bookings", As::Client("rider@example.com"), Some(booking_body(id, monday(9), monday(10)))),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let busy = json!({ "busy": [{ "start": monday(11), "end": monday(12) }] });
    let push = format!("/instructors/{id}/calendar/busy");
    let (status, _) = send(&app, request("PUT", &push, As::Nobody, Some(busy.clone()))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&app, request("PUT", &push, As::Bearer(SYNC_SECRET), Some(busy))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, slots) = send(&app, request("GET", &uri, As::Nobody, None)).await;
    let starts: Vec<i64> = slots
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["start"].as_i64().unwrap())
        .collect();
    assert_eq!(starts, vec![monday(10)]);
}

#[tokio::test]
async fn bad_slot_queries_are_bad_requests() {
    let app = app(Secrets::default()).await;
    let id = Ulid::new();
    for query in [
        "start=2030-01-07&end=2030-01-07",
        "start=2030-01-08&end=2030-01-07&duration=60",
        "start=2030-01-07&end=2030-01-07&duration=0",
        "start=yesterday&end=2030-01-07&duration=60",
    ] {
        let (status, _) = send(
            &app,
            request("GET", &format!("/instructors/{id}/slots?{query}"), As::Nobody, None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{query}");
    }
}

#[tokio::test]
async fn overlapping_booking_is_a_conflict() {
    let app = app(Secrets::default()).await;
    let id = instructor_with_hours(&app).await;

    let (status, first) = send(
        &app,
        request("POST", "/bookings", As::Client("a@example.com"), Some(booking_body(id, monday(9), monday(10)))),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["booking"]["status"], "pending");
    assert_eq!(first["hold"]["status"], "pending");

    let (status, err) = send(
        &app,
        request(
            "POST",
            "/bookings",
            As::Client("b@example.com"),
            Some(booking_body(id, monday(9) + 30 * 60_000, monday(10) + 30 * 60_000)),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["error"]["code"], "slot_unavailable");

    let (status, err) = send(
        &app,
        request("POST", "/bookings", As::Client("b@example.com"), Some(booking_body(id, monday(13), monday(14)))),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["error"]["code"], "outside_working_hours");
}

#[tokio::test]
async fn malformed_bookings_are_bad_requests() {
    let app = app(Secrets::default()).await;
    let id = instructor_with_hours(&app).await;

    let (status, _) = send(
        &app,
        request("POST", "/bookings", As::Client("a@example.com"), Some(booking_body(id, monday(10), monday(9)))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        request("POST", "/bookings", As::Client("not-an-email"), Some(booking_body(id, monday(9), monday(10)))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        request("POST", "/bookings", As::Instructor(id), Some(booking_body(id, monday(9), monday(10)))),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, request("GET", "/bookings/not-a-ulid", As::Admin, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, request("GET", &format!("/bookings/{}", Ulid::new()), As::Admin, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn lifecycle_over_http() {
    let app = app(Secrets::default()).await;
    let id = instructor_with_hours(&app).await;
    let client = "rider@example.com";

    let (_, created) = send(
        &app,
        request("POST", "/bookings", As::Client(client), Some(booking_body(id, monday(9), monday(10)))),
    )
    .await;
    let booking_id = created["booking"]["id"].as_str().unwrap().to_string();
    let uri = format!("/bookings/{booking_id}");

    let (status, _) = send(&app, request("GET", &uri, As::Client("stranger@example.com"), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, check) = send(&app, request("GET", &format!("{uri}/can-accept"), As::Instructor(id), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(check["can_accept"], true);

    let accept = json!({ "status": "accepted" });
    let (status, _) = send(&app, request("PATCH", &uri, As::Client(client), Some(accept.clone()))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, accepted) = send(&app, request("PATCH", &uri, As::Instructor(id), Some(accept.clone()))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(accepted["booking"]["status"], "accepted");
    assert_eq!(accepted["hold"]["status"], "confirmed");

    let (status, err) = send(&app, request("PATCH", &uri, As::Instructor(id), Some(accept))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["error"]["code"], "invalid_status");

    let (status, cancelled) = send(
        &app,
        request("PATCH", &uri, As::Client(client), Some(json!({ "status": "cancelled" }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["booking"]["status"], "cancelled");

    let (status, err) = send(
        &app,
        request("PATCH", &uri, As::Instructor(id), Some(json!({ "status": "completed" }))),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["error"]["code"], "booking_inactive");

    let (status, _) = send(
        &app,
        request("PATCH", &uri, As::Instructor(id), Some(json!({ "status": "teleported" }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn machine_endpoints_check_bearer_secrets() {
    let app = app(secrets()).await;

    let (status, _) = send(&app, request("POST", "/cron/tick", As::Nobody, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&app, request("POST", "/cron/tick", As::Bearer("guess"), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&app, request("POST", "/cron/tick", As::Bearer(CRON_SECRET), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tasks"]["cleanup"]["success"], true);
    assert_eq!(body["tasks"]["cleanup"]["processed_count"], 0);
    assert_eq!(body["tasks"]["sync"]["success"], true);
    assert_eq!(body["tasks"]["compact"]["success"], true);
    assert_eq!(body["tasks"]["compact"]["compacted"], false);

    // No webhook secret configured: the endpoint is switched off.
    let uri = format!("/payments/{}/succeeded", Ulid::new());
    let (status, err) = send(&app, request("POST", &uri, As::Bearer("anything"), None)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(err["error"]["code"], "endpoint_disabled");
}

#[tokio::test]
async fn payment_webhooks_drive_deposits() {
    let app = app(Secrets {
        webhook: Some("hook".into()),
        ..Secrets::default()
    })
    .await;
    let id = instructor_with_hours(&app).await;

    let mut body = booking_body(id, monday(9), monday(10));
    body["deposit_amount_cents"] = json!(5000);
    let (status, created) = send(&app, request("POST", "/bookings", As::Client("a@example.com"), Some(body))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["deposit"]["status"], "pending");
    let deposit_id = created["deposit"]["id"].as_str().unwrap().to_string();

    let (status, outcome) = send(
        &app,
        request("POST", &format!("/payments/{deposit_id}/succeeded"), As::Bearer("hook"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["deposit"], "held");
    assert_eq!(outcome["booking"], "pending");

    let (status, _) = send(
        &app,
        request("POST", &format!("/payments/{}/failed", Ulid::new()), As::Bearer("hook"), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
