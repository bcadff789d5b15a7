//! Management REST surface: subnet CRUD, bindings, next-server assignment.
//! JSON in, JSON out, Basic Auth on every route. Thin by design — every
//! decision lives in the tracker; this layer validates parameters, maps
//! error kinds to status codes, and nothing else.

use std::net::Ipv4Addr;
use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Error;
use crate::subnet::{Binding, SubnetDto};
use crate::tracker::DataTracker;

#[derive(Clone)]
pub struct ApiState {
    pub tracker: Arc<DataTracker>,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NextServerBody {
    pub next_server: String,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/subnets", get(list_subnets).post(create_subnet))
        .route(
            "/subnets/{name}",
            get(get_subnet).put(update_subnet).delete(delete_subnet),
        )
        .route("/subnets/{name}/bind", post(bind_subnet))
        .route("/subnets/{name}/bind/{mac}", delete(unbind_subnet))
        .route("/subnets/{name}/next_server/{ip}", put(set_next_server))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_basic_auth,
        ))
        .with_state(state)
}

pub async fn serve(state: ApiState, port: u16) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Management API listening on port {}", port);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Validation(_) | Error::InvalidPacket(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: Error) -> Response {
    let body = serde_json::json!({ "error": error.to_string() });
    (status_for(&error), Json(body)).into_response()
}

async fn require_basic_auth(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_basic_auth)
        .is_some_and(|(user, pass)| user == state.username && pass == state.password);

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"dhcpward\"")],
        )
            .into_response();
    }

    next.run(request).await
}

fn parse_basic_auth(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

async fn list_subnets(State(state): State<ApiState>) -> Json<Vec<SubnetDto>> {
    Json(state.tracker.list_subnets().await)
}

async fn get_subnet(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.tracker.get_subnet(&name).await {
        Some(dto) => Json(dto).into_response(),
        None => error_response(Error::NotFound(format!("no subnet named {}", name))),
    }
}

async fn create_subnet(State(state): State<ApiState>, Json(dto): Json<SubnetDto>) -> Response {
    match state.tracker.add_subnet(dto.clone()).await {
        Ok(()) => (StatusCode::CREATED, Json(dto)).into_response(),
        Err(error) => error_response(error),
    }
}

async fn update_subnet(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(dto): Json<SubnetDto>,
) -> Response {
    match state.tracker.replace_subnet(&name, dto).await {
        Ok(()) => match state.tracker.get_subnet(&name).await {
            Some(dto) => Json(dto).into_response(),
            None => StatusCode::OK.into_response(),
        },
        Err(error) => error_response(error),
    }
}

async fn delete_subnet(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.tracker.remove_subnet(&name).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(error) => error_response(error),
    }
}

async fn bind_subnet(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(binding): Json<Binding>,
) -> Response {
    match state.tracker.add_binding(&name, binding.clone()).await {
        Ok(()) => Json(binding).into_response(),
        Err(error) => error_response(error),
    }
}

async fn unbind_subnet(
    State(state): State<ApiState>,
    Path((name, mac)): Path<(String, String)>,
) -> Response {
    match state.tracker.delete_binding(&name, &mac).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(error) => error_response(error),
    }
}

async fn set_next_server(
    State(state): State<ApiState>,
    Path((name, ip)): Path<(String, String)>,
    Json(body): Json<NextServerBody>,
) -> Response {
    let Ok(ip) = ip.parse::<Ipv4Addr>() else {
        return error_response(Error::Validation(format!("invalid IP in path: {:?}", ip)));
    };
    let Ok(next_server) = body.next_server.parse::<Ipv4Addr>() else {
        return error_response(Error::Validation(format!(
            "invalid next_server: {:?}",
            body.next_server
        )));
    };

    match state.tracker.set_next_server(&name, ip, next_server).await {
        Ok(()) => Json(body).into_response(),
        Err(error) => error_response(error),
    }
}
