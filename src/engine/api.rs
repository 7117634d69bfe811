//! ClubMerge API Module
//! REST endpoints for the merge protocol with OpenAPI documentation

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        FromRequest, FromRequestParts, Query, Request, State,
    },
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::{OpenApi, ToSchema};

use crate::engine::merge::{
    ClubId, DisplayStatus, MergeEngine, MergeError, MergeRequest, MergeRequestId, MergeRequestView, UserId,
};

/// Header the session layer sets to the authenticated user's id.
pub const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<MergeEngine>,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Missing or invalid x-user-id header")]
    Unauthenticated,
    #[error("Invalid request body: {}", .0.body_text())]
    InvalidBody(#[from] JsonRejection),
    #[error("Invalid query: {}", .0.body_text())]
    InvalidQuery(#[from] QueryRejection),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error("Request worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::InvalidBody(rejection) => rejection.status(),
            ApiError::InvalidQuery(rejection) => rejection.status(),
            ApiError::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Merge(e) => match e {
                MergeError::Forbidden { .. } => StatusCode::FORBIDDEN,
                MergeError::NotFound(_) => StatusCode::NOT_FOUND,
                MergeError::InvalidPair(_) => StatusCode::BAD_REQUEST,
                MergeError::Conflict(_) | MergeError::AlreadyMerged(_) | MergeError::NotReady(_) => {
                    StatusCode::CONFLICT
                }
                MergeError::AggregationFailed { .. } => StatusCode::BAD_GATEWAY,
                MergeError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Unauthenticated => "unauthenticated",
            ApiError::InvalidBody(_) | ApiError::InvalidQuery(_) => "invalid_request",
            ApiError::Worker(_) => "internal",
            ApiError::Merge(e) => e.kind(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
            kind: self.kind().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// The user on whose behalf the request acts, from the `x-user-id` header.
#[derive(Debug, Clone, Copy)]
pub struct ActingUser(pub UserId);

impl<S: Send + Sync> FromRequestParts<S> for ActingUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<i64>().ok())
            .map(|id| ActingUser(UserId(id)))
            .ok_or(ApiError::Unauthenticated)
    }
}

/// `Json` whose rejections render as [`ErrorBody`].
#[derive(Debug)]
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(ApiJson(value))
    }
}

/// `Query` whose rejections render as [`ErrorBody`].
#[derive(Debug)]
pub struct ApiQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(ApiQuery(value))
    }
}

/// Run a synchronous engine call off the async runtime.
async fn with_engine<T, F>(state: &ApiState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&MergeEngine) -> Result<T, MergeError> + Send + 'static,
{
    let engine = state.engine.clone();
    Ok(tokio::task::spawn_blocking(move || f(&engine)).await??)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        create_merge,
        list_merges,
        accept_merge,
        finalize_merge,
        cancel_merge,
        health_check,
    ),
    components(schemas(
        MergeRequest,
        MergeRequestView,
        DisplayStatus,
        CreateMergeBody,
        MergeActionBody,
        MergeOutcome,
        CancelResponse,
        HealthResponse,
        ErrorBody,
    )),
    tags(
        (name = "merge", description = "Club merge requests"),
        (name = "system", description = "Service status"),
    )
)]
pub struct ApiDoc;

pub fn create_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/merge", post(create_merge).get(list_merges))
        .route("/merge/accept", post(accept_merge))
        .route("/merge/finalize", post(finalize_merge))
        .route("/merge/cancel", post(cancel_merge))
        .route("/api/health", get(health_check))
        .route("/api/openapi.json", get(openapi_json))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[utoipa::path(
    get,
    path = "/api/health",
    responses((status = 200, description = "Service is up", body = HealthResponse)),
    tag = "system"
)]
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateMergeBody {
    pub initiator_club_id: ClubId,
    pub target_club_id: ClubId,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MergeActionBody {
    pub merge_request_id: MergeRequestId,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MergeOutcome {
    pub merge_request: MergeRequest,
    /// Set once the merged club exists
    pub merged_club_id: Option<ClubId>,
}

impl From<MergeRequest> for MergeOutcome {
    fn from(merge_request: MergeRequest) -> Self {
        Self {
            merged_club_id: merge_request.merged_club_id,
            merge_request,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CancelResponse {
    pub status: bool,
}

#[derive(Debug, Deserialize)]
pub struct ClubQuery {
    club_id: ClubId,
}

#[utoipa::path(
    post,
    path = "/merge",
    request_body = CreateMergeBody,
    responses(
        (status = 201, description = "Merge request created", body = MergeRequest),
        (status = 400, description = "Club cannot merge with itself", body = ErrorBody),
        (status = 403, description = "Not an organizer of the initiating club", body = ErrorBody),
        (status = 409, description = "An open request already exists for the pair", body = ErrorBody)
    ),
    tag = "merge"
)]
async fn create_merge(
    State(state): State<ApiState>,
    ActingUser(user): ActingUser,
    ApiJson(body): ApiJson<CreateMergeBody>,
) -> Result<(StatusCode, Json<MergeRequest>), ApiError> {
    let request = with_engine(&state, move |engine| {
        engine.create(body.initiator_club_id, body.target_club_id, user)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(request)))
}

#[utoipa::path(
    get,
    path = "/merge",
    params(("club_id" = i64, Query, description = "Viewing club")),
    responses(
        (status = 200, description = "Merge requests for the club, newest first", body = Vec<MergeRequestView>),
        (status = 404, description = "Unknown club", body = ErrorBody)
    ),
    tag = "merge"
)]
async fn list_merges(
    State(state): State<ApiState>,
    ActingUser(_user): ActingUser,
    ApiQuery(query): ApiQuery<ClubQuery>,
) -> Result<Json<Vec<MergeRequestView>>, ApiError> {
    let views = with_engine(&state, move |engine| engine.views_for_club(query.club_id)).await?;
    Ok(Json(views))
}

#[utoipa::path(
    post,
    path = "/merge/accept",
    request_body = MergeActionBody,
    responses(
        (status = 200, description = "Accepted; merged when both sides have accepted", body = MergeOutcome),
        (status = 403, description = "Not an organizer of either club", body = ErrorBody),
        (status = 409, description = "Already merged or changed concurrently", body = ErrorBody),
        (status = 502, description = "Accepted but the clubs could not be merged yet", body = ErrorBody)
    ),
    tag = "merge"
)]
async fn accept_merge(
    State(state): State<ApiState>,
    ActingUser(user): ActingUser,
    ApiJson(body): ApiJson<MergeActionBody>,
) -> Result<Json<MergeOutcome>, ApiError> {
    let request = with_engine(&state, move |engine| engine.accept(body.merge_request_id, user)).await?;
    Ok(Json(request.into()))
}

#[utoipa::path(
    post,
    path = "/merge/finalize",
    request_body = MergeActionBody,
    responses(
        (status = 200, description = "Merged", body = MergeOutcome),
        (status = 409, description = "A club has not accepted yet", body = ErrorBody),
        (status = 502, description = "The clubs could not be merged", body = ErrorBody)
    ),
    tag = "merge"
)]
async fn finalize_merge(
    State(state): State<ApiState>,
    ActingUser(user): ActingUser,
    ApiJson(body): ApiJson<MergeActionBody>,
) -> Result<Json<MergeOutcome>, ApiError> {
    let request = with_engine(&state, move |engine| engine.finalize(body.merge_request_id, user)).await?;
    Ok(Json(request.into()))
}

#[utoipa::path(
    post,
    path = "/merge/cancel",
    request_body = MergeActionBody,
    responses(
        (status = 200, description = "Merge request withdrawn", body = CancelResponse),
        (status = 403, description = "Not an organizer of either club", body = ErrorBody),
        (status = 409, description = "Already merged", body = ErrorBody)
    ),
    tag = "merge"
)]
async fn cancel_merge(
    State(state): State<ApiState>,
    ActingUser(user): ActingUser,
    ApiJson(body): ApiJson<MergeActionBody>,
) -> Result<Json<CancelResponse>, ApiError> {
    with_engine(&state, move |engine| engine.cancel(body.merge_request_id, user)).await?;
    Ok(Json(CancelResponse { status: true }))
}
