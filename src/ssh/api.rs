//! HTTP routes over [`SessionService`].
//!
//! Thin `poem` handlers: each one decodes the request, calls the service and
//! maps [`SessionError`] onto a status code with a JSON body.

use std::sync::Arc;

use poem::error::ResponseError;
use poem::http::StatusCode;
use poem::web::{Data, Json, Path};
use poem::{Endpoint, EndpointExt, IntoResponse, Response, Route, get, handler, post};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::error::SessionError;
use super::service::SessionService;
use super::types::{
    CommandListResponse, CommandOutput, CreateHostConfigRequest, EndSessionResponse,
    ExecuteCommandRequest, HostConfigListResponse, HostConfigView, SessionListResponse,
    SshSession, StartSessionRequest,
};

/// Shared state handed to every handler.
pub struct ApiState {
    pub service: Arc<SessionService>,
    /// Parent of every per-request token; cancelled on shutdown.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Error)]
#[error(transparent)]
pub struct ApiError(#[from] SessionError);

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'static str>,
}

impl ResponseError for ApiError {
    fn status(&self) -> StatusCode {
        let err = &self.0;
        if err.is_not_found() {
            return StatusCode::NOT_FOUND;
        }
        if err.is_timeout_or_cancelled() {
            return StatusCode::REQUEST_TIMEOUT;
        }
        match err {
            SessionError::InvalidHostConfig(_) => StatusCode::BAD_REQUEST,
            SessionError::ConnectionFailure(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn as_response(&self) -> Response {
        let body = ErrorBody {
            error: self.0.to_string(),
            hint: self.0.hint(),
        };
        Json(body).with_status(self.status()).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[handler]
async fn create_host(
    Data(state): Data<&Arc<ApiState>>,
    Json(request): Json<CreateHostConfigRequest>,
) -> ApiResult<Response> {
    let view = state.service.add_host_config(request).await?;
    Ok(Json(view).with_status(StatusCode::CREATED).into_response())
}

#[handler]
async fn list_hosts(Data(state): Data<&Arc<ApiState>>) -> ApiResult<Json<HostConfigListResponse>> {
    let hosts = state.service.list_host_configs().await?;
    Ok(Json(HostConfigListResponse {
        count: hosts.len(),
        hosts,
    }))
}

#[handler]
async fn get_host(
    Data(state): Data<&Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<HostConfigView>> {
    Ok(Json(state.service.host_config(&id).await?.view()))
}

#[handler]
async fn delete_host(
    Data(state): Data<&Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.service.delete_host_config(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[handler]
async fn start_session(
    Data(state): Data<&Arc<ApiState>>,
    Json(request): Json<StartSessionRequest>,
) -> ApiResult<Response> {
    let session = state
        .service
        .start_session_for_host(&request.host_config_id, &state.shutdown.child_token())
        .await?;
    Ok(Json(session).with_status(StatusCode::CREATED).into_response())
}

#[handler]
async fn list_sessions(Data(state): Data<&Arc<ApiState>>) -> Json<SessionListResponse> {
    let sessions = state.service.list_sessions();
    Json(SessionListResponse {
        count: sessions.len(),
        sessions,
    })
}

#[handler]
async fn get_session(
    Data(state): Data<&Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<SshSession>> {
    Ok(Json(state.service.get_session(&id).await?))
}

#[handler]
async fn execute_command(
    Data(state): Data<&Arc<ApiState>>,
    Path(id): Path<String>,
    Json(request): Json<ExecuteCommandRequest>,
) -> ApiResult<Json<CommandOutput>> {
    let output = state
        .service
        .execute_command(&id, &request.command, &state.shutdown.child_token())
        .await?;
    Ok(Json(output))
}

#[handler]
async fn list_commands(
    Data(state): Data<&Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<CommandListResponse>> {
    let commands = state.service.session_commands(&id).await?;
    Ok(Json(CommandListResponse {
        session_id: id,
        count: commands.len(),
        commands,
    }))
}

#[handler]
async fn end_session(
    Data(state): Data<&Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<EndSessionResponse>> {
    state.service.end_session(&id).await?;
    Ok(Json(EndSessionResponse {
        message: format!("Session {} ended", id),
        session_id: id,
        ended: true,
    }))
}

pub fn routes(state: Arc<ApiState>) -> impl Endpoint {
    Route::new()
        .at("/hosts", post(create_host).get(list_hosts))
        .at("/hosts/:id", get(get_host).delete(delete_host))
        .at("/sessions", post(start_session).get(list_sessions))
        .at("/sessions/:id", get(get_session))
        .at(
            "/sessions/:id/commands",
            post(execute_command).get(list_commands),
        )
        .at("/sessions/:id/end", post(end_session))
        .data(state)
}
