//! Axum JSON binding of the scheduling controllers.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        FromRequest, FromRequestParts, Path, Query, State,
    },
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};
use vms_core::{
    Actor, AppointmentId, AppointmentRecord, AppointmentStatus, AvailabilitySlot, HostId,
    NewAppointment, OccupancyStats, SchedulingError, SlotId, SlotOffer, TimeWindow, VisitorId,
};
use vms_scheduling::{Controllers, SchedulerConfig, SchedulingService, SlotChoice};

pub const CRATE_NAME: &str = "vms-web";

pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";
pub const ACTOR_ID_HEADER: &str = "x-actor-id";

#[derive(Clone)]
pub struct AppState {
    pub controllers: Controllers,
}

impl AppState {
    pub fn new(service: Arc<SchedulingService>) -> Self {
        Self {
            controllers: Controllers::new(service),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Scheduling(#[from] SchedulingError),
    #[error("missing or malformed actor headers: {0}")]
    Unauthenticated(String),
    #[error("malformed request: {0}")]
    BadRequest(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

fn status_for(err: &SchedulingError) -> StatusCode {
    match err {
        SchedulingError::InvalidRange(_) | SchedulingError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        SchedulingError::Forbidden(_) => StatusCode::FORBIDDEN,
        SchedulingError::SlotNotFound(_) | SchedulingError::AppointmentNotFound(_) => StatusCode::NOT_FOUND,
        SchedulingError::Overlap { .. }
        | SchedulingError::SlotUnavailable(_)
        | SchedulingError::Conflict(_)
        | SchedulingError::SlotBooked(_)
        | SchedulingError::InvalidTransition { .. }
        | SchedulingError::VisitNotElapsed(_) => StatusCode::CONFLICT,
        SchedulingError::UnresolvedSchedule(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SchedulingError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, retryable) = match &self {
            ApiError::Scheduling(err) => (status_for(err), err.kind(), err.is_retryable()),
            ApiError::Unauthenticated(_) => (StatusCode::UNAUTHORIZED, "unauthenticated", false),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_input", false),
        };
        if status.is_server_error() {
            error!(kind, error = %self, "request failed");
        }

        let body = Json(json!({
            "error": {
                "kind": kind,
                "message": self.to_string(),
                "retryable": retryable,
            }
        }));

        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// `Json` body whose rejections come back as `ApiError`.
#[derive(Debug, FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

#[derive(Debug, FromRequestParts)]
#[from_request(via(Path), rejection(ApiError))]
pub struct ApiPath<T>(pub T);

#[derive(Debug, FromRequestParts)]
#[from_request(via(Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);

/// Caller identity taken from the `x-actor-role` / `x-actor-id` headers.
#[derive(Debug, Clone, Copy)]
pub struct RequestActor(pub Actor);

impl<S: Send + Sync> FromRequestParts<S> for RequestActor {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };
        let role = header(ACTOR_ROLE_HEADER)
            .ok_or_else(|| ApiError::Unauthenticated(format!("{ACTOR_ROLE_HEADER} is required")))?;
        if role == "system" {
            return Ok(Self(Actor::System));
        }
        let id = header(ACTOR_ID_HEADER)
            .ok_or_else(|| ApiError::Unauthenticated(format!("{ACTOR_ID_HEADER} is required for {role}")))?;
        let bad_id = |_| ApiError::Unauthenticated(format!("{ACTOR_ID_HEADER} is not a uuid"));
        let actor = match role {
            "host" => Actor::Host(id.parse::<HostId>().map_err(bad_id)?),
            "visitor" => Actor::Visitor(id.parse::<VisitorId>().map_err(bad_id)?),
            other => return Err(ApiError::Unauthenticated(format!("unknown role {other}"))),
        };
        Ok(Self(actor))
    }
}

fn as_host(actor: Actor) -> ApiResult<HostId> {
    match actor {
        Actor::Host(id) => Ok(id),
        other => Err(SchedulingError::Forbidden(format!("{other} is not a host")).into()),
    }
}

fn as_visitor(actor: Actor) -> ApiResult<VisitorId> {
    match actor {
        Actor::Visitor(id) => Ok(id),
        other => Err(SchedulingError::Forbidden(format!("{other} is not a visitor")).into()),
    }
}

fn require(actor: Actor, allowed: bool, what: &str) -> ApiResult<()> {
    if allowed {
        Ok(())
    } else {
        Err(SchedulingError::Forbidden(format!("{actor} may not {what}")).into())
    }
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    pub status: Option<AppointmentStatus>,
}

#[derive(Debug, Deserialize)]
pub struct AcceptExactBody {
    pub slot_id: SlotId,
}

#[derive(Debug, Deserialize)]
pub struct AcceptOptionsBody {
    pub windows: Vec<TimeWindow>,
}

#[derive(Debug, Deserialize)]
pub struct ReportBody {
    pub category: String,
    pub reason: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/hosts/{host_id}/slots", post(publish_handler).get(list_slots_handler))
        .route("/hosts/{host_id}/slots/stats", get(stats_handler))
        .route("/hosts/{host_id}/requests", get(pending_handler))
        .route("/hosts/{host_id}/appointments", get(host_appointments_handler))
        .route("/visitors/{visitor_id}/appointments", get(visitor_appointments_handler))
        .route("/slots/{slot_id}", delete(delete_slot_handler))
        .route("/appointments", post(create_handler))
        .route("/appointments/{id}", get(appointment_handler))
        .route("/appointments/{id}/candidates", get(candidates_handler))
        .route("/appointments/{id}/accept-exact", post(accept_exact_handler))
        .route("/appointments/{id}/accept-options", post(accept_options_handler))
        .route("/appointments/{id}/decline", post(decline_handler))
        .route("/appointments/{id}/select", post(select_handler))
        .route("/appointments/{id}/confirm", post(confirm_handler))
        .route("/appointments/{id}/reject", post(reject_handler))
        .route("/appointments/{id}/reschedule", post(reschedule_handler))
        .route("/appointments/{id}/cancel", post(cancel_handler))
        .route("/appointments/{id}/complete", post(complete_handler))
        .route("/appointments/{id}/reports", post(report_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &SchedulerConfig, service: Arc<SchedulingService>) -> anyhow::Result<()> {
    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "vms web listening");
    axum::serve(listener, app(AppState::new(service)))
        .await
        .context("serving http")?;
    Ok(())
}

type Shared = State<Arc<AppState>>;

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn publish_handler(
    State(state): Shared,
    RequestActor(actor): RequestActor,
    ApiPath(host_id): ApiPath<HostId>,
    ApiJson(window): ApiJson<TimeWindow>,
) -> ApiResult<(StatusCode, Json<AvailabilitySlot>)> {
    require(actor, actor == Actor::Host(host_id), "publish for this host")?;
    let slot = state.controllers.availability.publish(host_id, window).await?;
    Ok((StatusCode::CREATED, Json(slot)))
}

async fn list_slots_handler(
    State(state): Shared,
    ApiPath(host_id): ApiPath<HostId>,
    ApiQuery(range): ApiQuery<RangeQuery>,
) -> ApiResult<Json<Vec<AvailabilitySlot>>> {
    let slots = state
        .controllers
        .availability
        .list(host_id, range.from, range.to)
        .await?;
    Ok(Json(slots))
}

async fn stats_handler(State(state): Shared, ApiPath(host_id): ApiPath<HostId>) -> ApiResult<Json<OccupancyStats>> {
    Ok(Json(state.controllers.availability.stats(host_id).await?))
}

async fn delete_slot_handler(
    State(state): Shared,
    RequestActor(actor): RequestActor,
    ApiPath(slot_id): ApiPath<SlotId>,
) -> ApiResult<Json<AvailabilitySlot>> {
    let host_id = as_host(actor)?;
    Ok(Json(state.controllers.availability.delete(host_id, slot_id).await?))
}

async fn pending_handler(
    State(state): Shared,
    RequestActor(actor): RequestActor,
    ApiPath(host_id): ApiPath<HostId>,
) -> ApiResult<Json<Vec<AppointmentRecord>>> {
    require(actor, actor == Actor::Host(host_id), "review this host's requests")?;
    Ok(Json(state.controllers.review.pending(host_id).await?))
}

async fn host_appointments_handler(
    State(state): Shared,
    RequestActor(actor): RequestActor,
    ApiPath(host_id): ApiPath<HostId>,
    ApiQuery(filter): ApiQuery<StatusQuery>,
) -> ApiResult<Json<Vec<AppointmentRecord>>> {
    require(
        actor,
        matches!(actor, Actor::System) || actor == Actor::Host(host_id),
        "list this host's appointments",
    )?;
    let records = state
        .controllers
        .service
        .list_for_host(host_id, filter.status)
        .await?;
    Ok(Json(records))
}

async fn visitor_appointments_handler(
    State(state): Shared,
    RequestActor(actor): RequestActor,
    ApiPath(visitor_id): ApiPath<VisitorId>,
    ApiQuery(filter): ApiQuery<StatusQuery>,
) -> ApiResult<Json<Vec<AppointmentRecord>>> {
    require(
        actor,
        matches!(actor, Actor::System) || actor == Actor::Visitor(visitor_id),
        "list this visitor's appointments",
    )?;
    let records = state
        .controllers
        .service
        .list_for_visitor(visitor_id, filter.status)
        .await?;
    Ok(Json(records))
}

async fn create_handler(
    State(state): Shared,
    RequestActor(actor): RequestActor,
    ApiJson(request): ApiJson<NewAppointment>,
) -> ApiResult<(StatusCode, Json<AppointmentRecord>)> {
    require(
        actor,
        actor == Actor::Visitor(request.visitor_id),
        "request appointments for another visitor",
    )?;
    let record = state.controllers.service.create_appointment(request).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn appointment_handler(
    State(state): Shared,
    RequestActor(actor): RequestActor,
    ApiPath(id): ApiPath<AppointmentId>,
) -> ApiResult<Json<AppointmentRecord>> {
    let record = state.controllers.service.get_appointment(id).await?;
    let party = actor == Actor::Host(record.host_id)
        || actor == Actor::Visitor(record.visitor_id)
        || actor == Actor::System;
    require(actor, party, "view this appointment")?;
    Ok(Json(record))
}

async fn candidates_handler(
    State(state): Shared,
    RequestActor(actor): RequestActor,
    ApiPath(id): ApiPath<AppointmentId>,
) -> ApiResult<Json<Vec<SlotOffer>>> {
    let visitor_id = as_visitor(actor)?;
    Ok(Json(
        state
            .controllers
            .visitor
            .remaining_candidates(visitor_id, id)
            .await?,
    ))
}

async fn accept_exact_handler(
    State(state): Shared,
    RequestActor(actor): RequestActor,
    ApiPath(id): ApiPath<AppointmentId>,
    ApiJson(body): ApiJson<AcceptExactBody>,
) -> ApiResult<Json<AppointmentRecord>> {
    let host_id = as_host(actor)?;
    Ok(Json(
        state
            .controllers
            .review
            .accept_exact(host_id, id, body.slot_id)
            .await?,
    ))
}

async fn accept_options_handler(
    State(state): Shared,
    RequestActor(actor): RequestActor,
    ApiPath(id): ApiPath<AppointmentId>,
    ApiJson(body): ApiJson<AcceptOptionsBody>,
) -> ApiResult<Json<AppointmentRecord>> {
    let host_id = as_host(actor)?;
    Ok(Json(
        state
            .controllers
            .review
            .accept_with_options(host_id, id, body.windows)
            .await?,
    ))
}

async fn decline_handler(
    State(state): Shared,
    RequestActor(actor): RequestActor,
    ApiPath(id): ApiPath<AppointmentId>,
) -> ApiResult<Json<AppointmentRecord>> {
    let host_id = as_host(actor)?;
    Ok(Json(state.controllers.review.decline(host_id, id).await?))
}

async fn select_handler(
    State(state): Shared,
    RequestActor(actor): RequestActor,
    ApiPath(id): ApiPath<AppointmentId>,
    ApiJson(choice): ApiJson<SlotChoice>,
) -> ApiResult<Json<AppointmentRecord>> {
    let visitor_id = as_visitor(actor)?;
    Ok(Json(
        state
            .controllers
            .visitor
            .select_slot(visitor_id, id, choice)
            .await?,
    ))
}

async fn confirm_handler(
    State(state): Shared,
    RequestActor(actor): RequestActor,
    ApiPath(id): ApiPath<AppointmentId>,
) -> ApiResult<Json<AppointmentRecord>> {
    let visitor_id = as_visitor(actor)?;
    Ok(Json(state.controllers.visitor.confirm(visitor_id, id).await?))
}

async fn reject_handler(
    State(state): Shared,
    RequestActor(actor): RequestActor,
    ApiPath(id): ApiPath<AppointmentId>,
) -> ApiResult<Json<AppointmentRecord>> {
    let visitor_id = as_visitor(actor)?;
    Ok(Json(state.controllers.visitor.reject(visitor_id, id).await?))
}

async fn reschedule_handler(
    State(state): Shared,
    RequestActor(actor): RequestActor,
    ApiPath(id): ApiPath<AppointmentId>,
    ApiJson(window): ApiJson<TimeWindow>,
) -> ApiResult<Json<AppointmentRecord>> {
    let host_id = as_host(actor)?;
    Ok(Json(
        state
            .controllers
            .maintenance
            .reschedule(host_id, id, window)
            .await?,
    ))
}

async fn cancel_handler(
    State(state): Shared,
    RequestActor(actor): RequestActor,
    ApiPath(id): ApiPath<AppointmentId>,
) -> ApiResult<Json<AppointmentRecord>> {
    Ok(Json(state.controllers.maintenance.cancel(actor, id).await?))
}

async fn complete_handler(
    State(state): Shared,
    RequestActor(actor): RequestActor,
    ApiPath(id): ApiPath<AppointmentId>,
) -> ApiResult<Json<AppointmentRecord>> {
    Ok(Json(state.controllers.maintenance.mark_completed(actor, id).await?))
}

async fn report_handler(
    State(state): Shared,
    RequestActor(actor): RequestActor,
    ApiPath(id): ApiPath<AppointmentId>,
    ApiJson(body): ApiJson<ReportBody>,
) -> ApiResult<Json<AppointmentRecord>> {
    let host_id = as_host(actor)?;
    Ok(Json(
        state
            .controllers
            .maintenance
            .report_visitor(host_id, id, body.category, body.reason)
            .await?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::NaiveDateTime;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;
    use vms_core::FixedClock;

    fn test_app() -> Router {
        let now = NaiveDateTime::parse_from_str("2025-05-30 09:00", "%Y-%m-%d %H:%M").unwrap();
        let service = SchedulingService::in_memory().with_clock(Arc::new(FixedClock::new(now)));
        app(AppState::new(Arc::new(service)))
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        actor: Option<(&str, String)>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some((role, id)) = actor {
            builder = builder
                .header(ACTOR_ROLE_HEADER, role)
                .header(ACTOR_ID_HEADER, id);
        }
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&value).unwrap())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn host(id: HostId) -> Option<(&'static str, String)> {
        Some(("host", id.to_string()))
    }

    fn visitor(id: VisitorId) -> Option<(&'static str, String)> {
        Some(("visitor", id.to_string()))
    }

    fn new_request(host_id: HostId, visitor_id: VisitorId) -> Value {
        json!({
            "visitor_id": visitor_id,
            "host_id": host_id,
            "firstname": "Ada",
            "lastname": "Lovelace",
            "contact": "555-0100",
            "email": null,
            "category": "meeting",
            "reason": "design review",
            "vehicle": null
        })
    }

    async fn publish(app: &Router, host_id: HostId, date: &str, start: &str, end: &str) -> Value {
        let (status, slot) = send(
            app,
            "POST",
            &format!("/hosts/{host_id}/slots"),
            host(host_id),
            Some(json!({ "date": date, "start": start, "end": end })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{slot}");
        slot
    }

    #[tokio::test]
    async fn handler_smoke_health() {
        let (status, body) = send(&test_app(), "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn exact_slot_flow_over_http() {
        let app = test_app();
        let host_id = HostId::new();
        let visitor_id = VisitorId::new();
        let slot = publish(&app, host_id, "2025-06-01", "10:00", "10:30").await;
        assert_eq!(slot["status"], "available");

        let (status, record) = send(
            &app,
            "POST",
            "/appointments",
            visitor(visitor_id),
            Some(new_request(host_id, visitor_id)),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(record["status"], "pending");
        let id = record["id"].as_str().unwrap().to_string();

        let (status, _) = send(&app, "GET", &format!("/hosts/{host_id}/requests"), host(host_id), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, accepted) = send(
            &app,
            "POST",
            &format!("/appointments/{id}/accept-exact"),
            host(host_id),
            Some(json!({ "slot_id": slot["id"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{accepted}");
        assert_eq!(accepted["status"], "accepted");
        assert_eq!(accepted["response"]["kind"], "exactSlot");

        let (status, confirmed) = send(
            &app,
            "POST",
            &format!("/appointments/{id}/confirm"),
            visitor(visitor_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(confirmed["status"], "confirmed");

        let (status, stats) = send(&app, "GET", &format!("/hosts/{host_id}/slots/stats"), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["booked"], 1);

        let (status, err) = send(
            &app,
            "DELETE",
            &format!("/slots/{}", slot["id"].as_str().unwrap()),
            host(host_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["error"]["kind"], "slot_booked");
        assert_eq!(err["error"]["retryable"], false);
    }

    #[tokio::test]
    async fn options_flow_and_unresolved_confirm() {
        let app = test_app();
        let host_id = HostId::new();
        let visitor_id = VisitorId::new();
        publish(&app, host_id, "2025-06-01", "10:00", "10:30").await;
        publish(&app, host_id, "2025-06-02", "14:00", "14:30").await;
        let (_, record) = send(
            &app,
            "POST",
            "/appointments",
            visitor(visitor_id),
            Some(new_request(host_id, visitor_id)),
        )
        .await;
        let id = record["id"].as_str().unwrap().to_string();

        let (status, offered) = send(
            &app,
            "POST",
            &format!("/appointments/{id}/accept-options"),
            host(host_id),
            Some(json!({ "windows": [
                { "date": "2025-06-01", "start": "10:00", "end": "10:30" },
                { "date": "2025-06-02", "start": "14:00", "end": "14:30" }
            ]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{offered}");
        assert_eq!(offered["response"]["kind"], "allSlots");

        let (status, err) = send(&app, "POST", &format!("/appointments/{id}/confirm"), visitor(visitor_id), None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err["error"]["kind"], "unresolved_schedule");

        let (status, open) = send(&app, "GET", &format!("/appointments/{id}/candidates"), visitor(visitor_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(open.as_array().unwrap().len(), 2);

        let (status, selected) = send(
            &app,
            "POST",
            &format!("/appointments/{id}/select"),
            visitor(visitor_id),
            Some(json!({ "index": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{selected}");
        assert_eq!(selected["schedule"]["window"]["start"], "14:00");

        let (status, slots) = send(
            &app,
            "GET",
            &format!("/hosts/{host_id}/slots?from=2025-06-01&to=2025-06-02"),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let statuses: Vec<_> = slots.as_array().unwrap().iter().map(|s| s["status"].clone()).collect();
        assert_eq!(statuses, vec![json!("available"), json!("booked")]);
    }

    #[tokio::test]
    async fn actor_headers_are_enforced() {
        let app = test_app();
        let host_id = HostId::new();

        let (status, err) = send(
            &app,
            "POST",
            &format!("/hosts/{host_id}/slots"),
            None,
            Some(json!({ "date": "2025-06-01", "start": "10:00", "end": "10:30" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(err["error"]["kind"], "unauthenticated");

        let (status, err) = send(
            &app,
            "POST",
            &format!("/hosts/{host_id}/slots"),
            host(HostId::new()),
            Some(json!({ "date": "2025-06-01", "start": "10:00", "end": "10:30" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(err["error"]["kind"], "forbidden");

        let (status, _) = send(
            &app,
            "POST",
            &format!("/hosts/{host_id}/slots"),
            Some(("host", "not-a-uuid".to_string())),
            Some(json!({ "date": "2025-06-01", "start": "10:00", "end": "10:30" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn malformed_requests_use_the_error_body() {
        let app = test_app();
        let host_id = HostId::new();

        let (status, err) = send(
            &app,
            "POST",
            &format!("/hosts/{host_id}/slots"),
            host(host_id),
            Some(json!({ "date": "2025-06-01", "start": "10:61", "end": "11:00" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["error"]["kind"], "invalid_input");
        assert_eq!(err["error"]["retryable"], false);
        assert!(err["error"]["message"].as_str().unwrap().contains("start"));

        let (status, err) = send(&app, "GET", "/hosts/not-a-uuid/slots/stats", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["error"]["kind"], "invalid_input");

        let (status, err) = send(&app, "GET", &format!("/hosts/{host_id}/slots?from=2025-06-01"), None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["error"]["kind"], "invalid_input");

        let (status, err) = send(
            &app,
            "POST",
            &format!("/appointments/{}/select", AppointmentId::new()),
            visitor(VisitorId::new()),
            Some(json!({ "slot": 3 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["error"]["kind"], "invalid_input");
    }

    #[tokio::test]
    async fn error_kinds_map_to_status_codes() {
        let app = test_app();
        let host_id = HostId::new();

        let (status, err) = send(
            &app,
            "POST",
            &format!("/hosts/{host_id}/slots"),
            host(host_id),
            Some(json!({ "date": "2025-06-01", "start": "11:00", "end": "10:00" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["error"]["kind"], "invalid_range");

        publish(&app, host_id, "2025-06-01", "10:00", "10:30").await;
        let (status, err) = send(
            &app,
            "POST",
            &format!("/hosts/{host_id}/slots"),
            host(host_id),
            Some(json!({ "date": "2025-06-01", "start": "10:15", "end": "10:45" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["error"]["kind"], "overlap");

        let (status, err) = send(
            &app,
            "GET",
            &format!("/appointments/{}", AppointmentId::new()),
            Some(("system", String::new())),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["error"]["kind"], "appointment_not_found");

        let (status, err) = send(
            &app,
            "GET",
            &format!("/hosts/{host_id}/slots?from=2025-06-02&to=2025-06-01"),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["error"]["kind"], "invalid_range");
    }

    #[tokio::test]
    async fn reservation_race_loser_gets_retryable_conflict() {
        let app = test_app();
        let host_id = HostId::new();
        let slot = publish(&app, host_id, "2025-06-01", "10:00", "10:30").await;
        let mut ids = Vec::new();
        for _ in 0..2 {
            let visitor_id = VisitorId::new();
            let (_, record) = send(
                &app,
                "POST",
                "/appointments",
                visitor(visitor_id),
                Some(new_request(host_id, visitor_id)),
            )
            .await;
            ids.push(record["id"].as_str().unwrap().to_string());
        }

        let body = json!({ "slot_id": slot["id"] });
        let (first, _) = send(&app, "POST", &format!("/appointments/{}/accept-exact", ids[0]), host(host_id), Some(body.clone())).await;
        let (second, err) = send(&app, "POST", &format!("/appointments/{}/accept-exact", ids[1]), host(host_id), Some(body)).await;
        assert_eq!(first, StatusCode::OK);
        assert_eq!(second, StatusCode::CONFLICT);
        assert_eq!(err["error"]["kind"], "conflict");
        assert_eq!(err["error"]["retryable"], true);
    }
}
