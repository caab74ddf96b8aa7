// HTTP front door
//
// Routes:
// - GET    /ace/getstream?id=<key>|infohash=<key>  - MPEG-TS stream for one viewer
// - GET    /ace/status[?id=|infohash=]              - stream count or per-key status
// - GET    /ace/streams                             - active stream listing
// - GET    /ace/streams/{key}                       - stream stats incl. upstream stats
// - GET    /ace/streams/{key}/clients               - attached clients
// - GET    /ace/streams/{key}/viewers               - clients merged per viewer
// - DELETE /ace/streams/{key}                       - force close

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use futures::StreamExt;
use serde_json::json;
use tracing::{info, warn};

use crate::engine::ExtraParams;
use crate::error::StreamError;
use crate::livestream::{ClientMeta, ProxyService};

pub const STREAM_CONTENT_TYPE: &str = "video/MP2T";

/// Query parameters consumed by the front door, never forwarded to the engine
const FRONT_DOOR_PARAMS: [&str; 6] = ["id", "infohash", "pid", "username", "client_ip", "client_ua"];

const DEFAULT_USERNAME: &str = "Anonymous";

#[derive(Clone)]
pub struct HttpProxyState {
    service: Arc<ProxyService>,
}

impl HttpProxyState {
    #[must_use]
    pub const fn new(service: Arc<ProxyService>) -> Self {
        Self { service }
    }
}

pub fn create_proxy_router(state: HttpProxyState) -> Router {
    Router::new()
        .route("/ace/getstream", get(handle_getstream))
        .route("/ace/getstream/", get(handle_getstream))
        .route("/ace/status", get(handle_status))
        .route("/ace/streams", get(handle_list_streams))
        .route(
            "/ace/streams/{key}",
            get(handle_stream_stats).delete(handle_force_close),
        )
        .route("/ace/streams/{key}/clients", get(handle_list_clients))
        .route("/ace/streams/{key}/viewers", get(handle_list_viewers))
        .with_state(state)
}

/// Status code a stream failure maps to at the HTTP boundary
pub const fn status_for(err: &StreamError) -> StatusCode {
    match err {
        StreamError::EngineRejected(_) | StreamError::EngineProtocolError(_) => StatusCode::BAD_GATEWAY,
        StreamError::EngineTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        StreamError::EngineUnreachable(_)
        | StreamError::UpstreamDisconnected(_)
        | StreamError::StreamClosed(_)
        | StreamError::ClientUnresponsive(_)
        | StreamError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        StreamError::StreamNotFound(_) => StatusCode::NOT_FOUND,
    }
}

fn error_response(err: &StreamError) -> Response {
    (status_for(err), err.to_string()).into_response()
}

#[derive(Debug, PartialEq, Eq)]
struct GetStreamRequest {
    key: String,
    username: String,
    client_ip: Option<String>,
    client_ua: Option<String>,
    extra_params: ExtraParams,
}

fn query_value<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
        .filter(|v| !v.is_empty())
}

/// Exactly one of `id` / `infohash` names the stream; `pid` belongs to us
fn parse_getstream(params: &[(String, String)]) -> Result<GetStreamRequest, &'static str> {
    let key = match (query_value(params, "id"), query_value(params, "infohash")) {
        (None, None) => return Err("Missing id or infohash parameter"),
        (Some(_), Some(_)) => return Err("Only one of id or infohash can be specified"),
        (Some(key), None) | (None, Some(key)) => key.to_string(),
    };
    if params.iter().any(|(k, _)| k == "pid") {
        return Err("PID parameter is not allowed");
    }

    Ok(GetStreamRequest {
        key,
        username: query_value(params, "username")
            .unwrap_or(DEFAULT_USERNAME)
            .to_string(),
        client_ip: query_value(params, "client_ip").map(str::to_string),
        client_ua: query_value(params, "client_ua").map(str::to_string),
        extra_params: params
            .iter()
            .filter(|(k, _)| !FRONT_DOOR_PARAMS.contains(&k.as_str()))
            .cloned()
            .collect(),
    })
}

/// Stream one key to one viewer as MPEG-TS
async fn handle_getstream(
    State(state): State<HttpProxyState>,
    Query(params): Query<Vec<(String, String)>>,
    peer: Option<Extension<ConnectInfo<SocketAddr>>>,
    headers: HeaderMap,
) -> Response {
    let request = match parse_getstream(&params) {
        Ok(request) => request,
        Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
    };

    // Forwarded client details win over the transport peer
    let client_ip = request
        .client_ip
        .or_else(|| peer.map(|Extension(ConnectInfo(addr))| addr.ip().to_string()));
    let client_ua = request.client_ua.or_else(|| {
        headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });

    info!(
        stream_key = %request.key,
        client_ip = client_ip.as_deref().unwrap_or("unknown"),
        user = %request.username,
        user_agent = client_ua.as_deref().unwrap_or("Unknown"),
        "Stream request"
    );

    let meta = ClientMeta {
        ip: client_ip,
        user_agent: client_ua,
        display_name: Some(request.username),
        queue_capacity: None,
    };

    let subscription = match state
        .service
        .subscribe(&request.key, request.extra_params, meta)
        .await
    {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(stream_key = %request.key, error = %e, "Failed to start stream");
            return error_response(&e);
        }
    };

    // Dropping the body (client gone) drops the subscription, which detaches
    let body = Body::from_stream(subscription.map(Ok::<_, std::io::Error>));

    (
        [
            (header::CONTENT_TYPE, STREAM_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        body,
    )
        .into_response()
}

async fn handle_status(
    State(state): State<HttpProxyState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let Some(key) = query_value(&params, "id").or_else(|| query_value(&params, "infohash")) else {
        return Json(json!({ "streams": state.service.active_stream_count() })).into_response();
    };

    match state.service.registry().get(key) {
        Some(stream) => Json(json!({
            "clients": stream.client_count(),
            "stream_id": key,
            "stat_url": stream.session().and_then(|s| s.stat_url.clone()),
        }))
        .into_response(),
        None => (StatusCode::NOT_FOUND, "Stream not found").into_response(),
    }
}

async fn handle_list_streams(State(state): State<HttpProxyState>) -> Response {
    Json(state.service.list_active_streams()).into_response()
}

async fn handle_stream_stats(
    State(state): State<HttpProxyState>,
    Path(key): Path<String>,
) -> Response {
    match state.service.stream_stats(&key).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_list_clients(
    State(state): State<HttpProxyState>,
    Path(key): Path<String>,
) -> Response {
    match state.service.list_clients(&key) {
        Ok(clients) => Json(clients).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_list_viewers(
    State(state): State<HttpProxyState>,
    Path(key): Path<String>,
) -> Response {
    match state.service.list_viewers(&key) {
        Ok(viewers) => Json(viewers).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_force_close(
    State(state): State<HttpProxyState>,
    Path(key): Path<String>,
) -> Response {
    match state.service.force_close(&key) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}
