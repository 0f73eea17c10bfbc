use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use nsmr_core::audit::CallContext;
use nsmr_core::domain::identity::{Principal, UserProfile, UserRole};
use nsmr_core::domain::level::ApprovalLevel;
use nsmr_core::domain::request::{ManufacturingRequest, RequestId};
use nsmr_core::errors::{InterfaceError, WorkflowError};
use nsmr_workflow::WorkflowService;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

pub const CALLER_HEADER: &str = "x-caller-principal";
pub const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct ApiState {
    service: Arc<WorkflowService>,
}

pub fn router(service: Arc<WorkflowService>) -> Router {
    Router::new()
        .route("/api/v1/requests", post(submit_request).get(list_requests))
        .route("/api/v1/requests/{id}", get(get_request))
        .route("/api/v1/requests/{id}/approve", post(approve_request))
        .route("/api/v1/requests/{id}/reject", post(reject_request))
        .route("/api/v1/users/{principal}/requests", get(user_requests))
        .route("/api/v1/users/{principal}/role", put(assign_role))
        .route("/api/v1/users/{principal}/profile", get(user_profile))
        .route("/api/v1/levels/{level}/requests", get(level_requests))
        .route(
            "/api/v1/levels/{level}/approvers",
            get(list_approvers).post(assign_approver).put(reassign_approvers),
        )
        .route("/api/v1/levels/{level}/approvers/{principal}", delete(remove_approver))
        .route("/api/v1/me/approvals", get(my_approvals))
        .route("/api/v1/me/role", get(caller_role))
        .route("/api/v1/me/admin", get(caller_is_admin))
        .route("/api/v1/me/profile", get(caller_profile).put(save_caller_profile))
        .with_state(ApiState { service })
}

// ---------------------------------------------------------------------------
// Caller identity and error mapping
// ---------------------------------------------------------------------------

/// Verified caller taken from the `x-caller-principal` header.
pub struct Caller(pub CallContext);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let correlation_id = correlation_id(&parts.headers);
        let principal = parts
            .headers
            .get(CALLER_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(Principal::parse);

        match principal {
            Some(caller) => Ok(Caller(CallContext::new(caller, correlation_id))),
            None => Err(ApiError(InterfaceError::Unauthenticated {
                message: format!("missing `{CALLER_HEADER}` header"),
                correlation_id,
            })),
        }
    }
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("corr-{}", Uuid::new_v4().simple()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error_class: String,
    pub message: String,
    pub correlation_id: String,
}

#[derive(Debug)]
pub struct ApiError(pub InterfaceError);

impl ApiError {
    fn workflow(error: WorkflowError, context: &CallContext) -> Self {
        Self(error.into_interface(context.correlation_id.clone()))
    }

    fn bad_request(message: impl Into<String>, context: &CallContext) -> Self {
        Self(InterfaceError::BadRequest {
            message: message.into(),
            correlation_id: context.correlation_id.clone(),
        })
    }

    fn status(&self) -> StatusCode {
        match self.0 {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            InterfaceError::Forbidden { .. } => StatusCode::FORBIDDEN,
            InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
            InterfaceError::Conflict { .. } => StatusCode::CONFLICT,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            warn!(
                event_name = "api.request.unavailable",
                correlation_id = %self.0.correlation_id(),
                error = %self.0.message(),
                "request failed on the persistence layer"
            );
        }
        let body = ErrorBody {
            error_class: self.0.error_class().to_string(),
            message: self.0.message().to_string(),
            correlation_id: self.0.correlation_id().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_level(raw: i64, context: &CallContext) -> ApiResult<ApprovalLevel> {
    ApprovalLevel::try_from(raw).map_err(|error| ApiError::bad_request(error.to_string(), context))
}

fn parse_principal(raw: &str, context: &CallContext) -> ApiResult<Principal> {
    Principal::parse(raw).ok_or_else(|| ApiError::bad_request("principal must not be blank", context))
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitRequestBody {
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmittedResponse {
    pub id: RequestId,
}

#[derive(Debug, Default, Deserialize)]
pub struct DecisionBody {
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApproverBody {
    pub approver: String,
}

#[derive(Debug, Deserialize)]
pub struct ReassignBody {
    pub approvers: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApproversResponse {
    pub level: ApprovalLevel,
    pub approvers: Vec<Principal>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChangedResponse {
    pub changed: bool,
}

#[derive(Debug, Deserialize)]
pub struct RoleBody {
    pub role: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoleResponse {
    pub role: UserRole,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdminResponse {
    pub admin: bool,
}

#[derive(Debug, Deserialize)]
pub struct ProfileBody {
    pub name: String,
}

// ---------------------------------------------------------------------------
// Request handlers
// ---------------------------------------------------------------------------

async fn submit_request(
    State(state): State<ApiState>,
    Caller(context): Caller,
    Json(body): Json<SubmitRequestBody>,
) -> ApiResult<(StatusCode, Json<SubmittedResponse>)> {
    let request = state
        .service
        .submit(&context, &body.content)
        .await
        .map_err(|error| ApiError::workflow(error, &context))?;
    Ok((StatusCode::CREATED, Json(SubmittedResponse { id: request.id })))
}

async fn list_requests(
    State(state): State<ApiState>,
    Caller(context): Caller,
) -> ApiResult<Json<Vec<ManufacturingRequest>>> {
    state
        .service
        .get_all_requests()
        .await
        .map(Json)
        .map_err(|error| ApiError::workflow(error, &context))
}

async fn get_request(
    State(state): State<ApiState>,
    Caller(context): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<ManufacturingRequest>> {
    state
        .service
        .get_request(&RequestId(id))
        .await
        .map(Json)
        .map_err(|error| ApiError::workflow(error, &context))
}

async fn approve_request(
    State(state): State<ApiState>,
    Caller(context): Caller,
    Path(id): Path<String>,
    body: Option<Json<DecisionBody>>,
) -> ApiResult<Json<ManufacturingRequest>> {
    let comment = body.and_then(|Json(body)| body.comment);
    state
        .service
        .approve(&context, &RequestId(id), comment)
        .await
        .map(Json)
        .map_err(|error| ApiError::workflow(error, &context))
}

async fn reject_request(
    State(state): State<ApiState>,
    Caller(context): Caller,
    Path(id): Path<String>,
    body: Option<Json<DecisionBody>>,
) -> ApiResult<Json<ManufacturingRequest>> {
    let comment = body.and_then(|Json(body)| body.comment);
    state
        .service
        .reject(&context, &RequestId(id), comment)
        .await
        .map(Json)
        .map_err(|error| ApiError::workflow(error, &context))
}

async fn user_requests(
    State(state): State<ApiState>,
    Caller(context): Caller,
    Path(principal): Path<String>,
) -> ApiResult<Json<Vec<ManufacturingRequest>>> {
    let user = parse_principal(&principal, &context)?;
    state
        .service
        .get_user_requests(&user)
        .await
        .map(Json)
        .map_err(|error| ApiError::workflow(error, &context))
}

async fn level_requests(
    State(state): State<ApiState>,
    Caller(context): Caller,
    Path(level): Path<i64>,
) -> ApiResult<Json<Vec<ManufacturingRequest>>> {
    let level = parse_level(level, &context)?;
    state
        .service
        .get_requests_by_level(&context, level)
        .await
        .map(Json)
        .map_err(|error| ApiError::workflow(error, &context))
}

async fn my_approvals(
    State(state): State<ApiState>,
    Caller(context): Caller,
) -> ApiResult<Json<Vec<ManufacturingRequest>>> {
    state
        .service
        .my_approvals(&context)
        .await
        .map(Json)
        .map_err(|error| ApiError::workflow(error, &context))
}

// ---------------------------------------------------------------------------
// Approver registry handlers
// ---------------------------------------------------------------------------

async fn list_approvers(
    State(state): State<ApiState>,
    Caller(context): Caller,
    Path(level): Path<i64>,
) -> ApiResult<Json<ApproversResponse>> {
    let level = parse_level(level, &context)?;
    let approvers = state
        .service
        .approvers_of(level)
        .await
        .map_err(|error| ApiError::workflow(error, &context))?;
    Ok(Json(ApproversResponse { level, approvers: approvers.into_iter().collect() }))
}

async fn assign_approver(
    State(state): State<ApiState>,
    Caller(context): Caller,
    Path(level): Path<i64>,
    Json(body): Json<ApproverBody>,
) -> ApiResult<Json<ChangedResponse>> {
    let level = parse_level(level, &context)?;
    let approver = parse_principal(&body.approver, &context)?;
    let changed = state
        .service
        .assign_approver(&context, level, &approver)
        .await
        .map_err(|error| ApiError::workflow(error, &context))?;
    Ok(Json(ChangedResponse { changed }))
}

async fn remove_approver(
    State(state): State<ApiState>,
    Caller(context): Caller,
    Path((level, principal)): Path<(i64, String)>,
) -> ApiResult<Json<ChangedResponse>> {
    let level = parse_level(level, &context)?;
    let approver = parse_principal(&principal, &context)?;
    let changed = state
        .service
        .remove_approver(&context, level, &approver)
        .await
        .map_err(|error| ApiError::workflow(error, &context))?;
    Ok(Json(ChangedResponse { changed }))
}

async fn reassign_approvers(
    State(state): State<ApiState>,
    Caller(context): Caller,
    Path(level): Path<i64>,
    Json(body): Json<ReassignBody>,
) -> ApiResult<Json<ApproversResponse>> {
    let level = parse_level(level, &context)?;
    let approvers = body
        .approvers
        .iter()
        .map(|raw| parse_principal(raw, &context))
        .collect::<ApiResult<Vec<_>>>()?;
    let assigned = state
        .service
        .reassign_approvers(&context, level, approvers)
        .await
        .map_err(|error| ApiError::workflow(error, &context))?;
    Ok(Json(ApproversResponse { level, approvers: assigned.into_iter().collect() }))
}

// ---------------------------------------------------------------------------
// Role and profile handlers
// ---------------------------------------------------------------------------

async fn assign_role(
    State(state): State<ApiState>,
    Caller(context): Caller,
    Path(principal): Path<String>,
    Json(body): Json<RoleBody>,
) -> ApiResult<Json<RoleResponse>> {
    let target = parse_principal(&principal, &context)?;
    let role = UserRole::parse(&body.role).ok_or_else(|| {
        ApiError::bad_request(format!("unknown role `{}`", body.role.trim()), &context)
    })?;
    state
        .service
        .assign_role(&context, &target, role)
        .await
        .map_err(|error| ApiError::workflow(error, &context))?;
    Ok(Json(RoleResponse { role }))
}

async fn caller_role(
    State(state): State<ApiState>,
    Caller(context): Caller,
) -> ApiResult<Json<RoleResponse>> {
    let role =
        state.service.caller_role(&context).await.map_err(|error| ApiError::workflow(error, &context))?;
    Ok(Json(RoleResponse { role }))
}

async fn caller_is_admin(
    State(state): State<ApiState>,
    Caller(context): Caller,
) -> ApiResult<Json<AdminResponse>> {
    let admin = state
        .service
        .is_caller_admin(&context)
        .await
        .map_err(|error| ApiError::workflow(error, &context))?;
    Ok(Json(AdminResponse { admin }))
}

async fn caller_profile(
    State(state): State<ApiState>,
    Caller(context): Caller,
) -> ApiResult<Json<Option<UserProfile>>> {
    state
        .service
        .caller_profile(&context)
        .await
        .map(Json)
        .map_err(|error| ApiError::workflow(error, &context))
}

async fn save_caller_profile(
    State(state): State<ApiState>,
    Caller(context): Caller,
    Json(body): Json<ProfileBody>,
) -> ApiResult<Json<UserProfile>> {
    state
        .service
        .save_caller_profile(&context, &body.name)
        .await
        .map(Json)
        .map_err(|error| ApiError::workflow(error, &context))
}

async fn user_profile(
    State(state): State<ApiState>,
    Caller(context): Caller,
    Path(principal): Path<String>,
) -> ApiResult<Json<Option<UserProfile>>> {
    let user = parse_principal(&principal, &context)?;
    state
        .service
        .user_profile(&context, &user)
        .await
        .map(Json)
        .map_err(|error| ApiError::workflow(error, &context))
}
