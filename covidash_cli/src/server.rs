use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use covidash::error::CovidashError;
use covidash::query::Metric;
use covidash::Dashboard;
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use strum::IntoEnumIterator;

use crate::error::CovidashCliResult;

const INDEX_PAGE: &str = include_str!("index.html");

/// Maps library errors onto HTTP responses with a `{"detail": ..}` body.
pub struct ApiError(CovidashError);

impl From<CovidashError> for ApiError {
    fn from(err: CovidashError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(CovidashError::Validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self.0 {
            CovidashError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            CovidashError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            other => {
                error!("request failed: {other}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("An error occurred: {other}"),
                )
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Clone)]
pub struct AppState {
    pub dashboard: Arc<Dashboard>,
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(dashboard: Dashboard) -> Self {
        let request_timeout = dashboard.config.server.request_timeout();
        Self {
            dashboard: Arc::new(dashboard),
            request_timeout,
        }
    }

    /// Run `fut`, dropping it and failing as unavailable once the request timeout passes.
    async fn within_deadline<T>(&self, fut: impl Future<Output = covidash::error::Result<T>>) -> ApiResult<T> {
        Ok(tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(CovidashError::from)??)
    }
}

#[derive(Deserialize, Debug)]
struct FetchDataRequest {
    database: String,
    table: String,
}

#[derive(Deserialize, Debug)]
struct PointRequest {
    country: String,
    date: String,
}

#[derive(Deserialize, Debug)]
struct SaveCommentRequest {
    datapoint_id: String,
    comment: String,
    user: String,
}

#[derive(Deserialize, Debug)]
struct GetCommentsRequest {
    datapoint_id: String,
}

fn required(message: &str) -> ApiError {
    ApiError(CovidashError::Validation(message.to_string()))
}

/// Decode a request body. Missing, null or mistyped fields fail with the route's `message`;
/// malformed JSON keeps the rejection's own text.
fn decode<T>(body: Result<Json<T>, JsonRejection>, message: &str) -> ApiResult<T> {
    match body {
        Ok(Json(request)) => Ok(request),
        Err(JsonRejection::JsonDataError(err)) => {
            debug!("rejected request body: {}", err.body_text());
            Err(required(message))
        }
        Err(rejection) => Err(rejection.into()),
    }
}

/// Blank values count as missing.
fn filled(values: &[&str]) -> bool {
    values.iter().all(|v| !v.trim().is_empty())
}

async fn index() -> Html<&'static str> {
    Html(INDEX_PAGE)
}

async fn fetch_data(
    State(state): State<AppState>,
    body: Result<Json<FetchDataRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    const MISSING: &str = "Required fields are missing";
    let request = decode(body, MISSING)?;
    if !filled(&[&request.database, &request.table]) {
        return Err(required(MISSING));
    }
    let description = state
        .within_deadline(state.dashboard.describe(&request.database, &request.table))
        .await?;
    Ok(Json(json!({ "description": description.to_rows()? })))
}

async fn fetch_metric(
    metric: Metric,
    state: AppState,
    body: Result<Json<PointRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    const MISSING: &str = "Country and Date are required";
    let request = decode(body, MISSING)?;
    if !filled(&[&request.country, &request.date]) {
        return Err(required(MISSING));
    }
    let point = state
        .within_deadline(
            state
                .dashboard
                .lookup(&metric.key(), &request.country, &request.date),
        )
        .await?;
    Ok(Json(serde_json::to_value(point).map_err(|e| {
        CovidashError::DataIntegrity(format!("failed to encode {metric}: {e}"))
    })?))
}

async fn save_comment(
    State(state): State<AppState>,
    body: Result<Json<SaveCommentRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    const MISSING: &str = "Datapoint ID, User, and Comment are required";
    let request = decode(body, MISSING)?;
    if !filled(&[&request.datapoint_id, &request.comment, &request.user]) {
        return Err(required(MISSING));
    }
    let comment = state
        .within_deadline(state.dashboard.add_comment(
            &request.datapoint_id,
            &request.user,
            &request.comment,
        ))
        .await?;
    Ok(Json(json!({
        "message": "Comment added successfully",
        "comment": comment,
    })))
}

async fn get_comments(
    State(state): State<AppState>,
    body: Result<Json<GetCommentsRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    const MISSING: &str = "Datapoint ID is required";
    let request = decode(body, MISSING)?;
    if !filled(&[&request.datapoint_id]) {
        return Err(required(MISSING));
    }
    let comments = state
        .within_deadline(state.dashboard.comments(&request.datapoint_id))
        .await?;
    Ok(Json(json!({ "comments": comments })))
}

async fn visual(State(state): State<AppState>) -> ApiResult<Html<String>> {
    let report = state
        .within_deadline(async { Ok(state.dashboard.visual_report().await) })
        .await?;
    let unavailable = report.unavailable();
    if !unavailable.is_empty() {
        warn!("report rendered without {unavailable:?}");
    }
    Ok(Html(report.to_html_page()))
}

/// Route path for a metric lookup, e.g. `/fetch-total-cases`.
fn metric_route(metric: Metric) -> String {
    format!("/fetch-{}", metric.key().replace('_', "-"))
}

pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/", get(index))
        .route("/fetch-data", post(fetch_data))
        .route("/save-comment", post(save_comment))
        .route("/get-comments", post(get_comments))
        .route("/visual", get(visual));
    for metric in Metric::iter() {
        router = router.route(
            &metric_route(metric),
            post(
                move |State(state): State<AppState>,
                      body: Result<Json<PointRequest>, JsonRejection>| {
                    fetch_metric(metric, state, body)
                },
            ),
        );
    }
    router.with_state(state)
}

/// Serve the dashboard until the process is stopped.
pub async fn serve(dashboard: Dashboard, bind: &str) -> CovidashCliResult<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("listening on {}", listener.local_addr()?);
    let state = AppState::new(dashboard);
    let dashboard = state.dashboard.clone();
    axum::serve(listener, router(state)).await?;
    dashboard.close();
    Ok(())
}
