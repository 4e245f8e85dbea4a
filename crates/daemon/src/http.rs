use crate::metrics::Metrics;
use crate::status::StatusHub;
use anyhow::Result;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{error, info};
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

/// Shared state behind the HTTP endpoints.
#[derive(Clone)]
pub struct HttpState {
    pub metrics: Arc<Metrics>,
    pub status: Arc<StatusHub>,
}

/// Body of `/status`.
#[derive(Debug, Serialize)]
struct StatusBody {
    connected: bool,
    #[serde(flatten)]
    telemetry: Option<crate::status::Telemetry>,
}

/// Start the HTTP metrics server on the specified port.
pub async fn serve_metrics(state: HttpState, port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Accept error: {}", e);
                continue;
            }
        };

        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                handle_request(req, state)
            });

            let conn = hyper::server::conn::http1::Builder::new().serve_connection(io, service);

            if let Err(e) = conn.await {
                error!("Connection error: {}", e);
            }
        });
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: String) -> Response<String> {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

async fn handle_request<B>(
    req: Request<B>,
    state: HttpState,
) -> Result<Response<String>, Infallible> {
    Ok(route(req.uri().path(), &state))
}

fn route(path: &str, state: &HttpState) -> Response<String> {
    match path {
        "/metrics" => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4",
            state.metrics.to_prometheus(),
        ),
        "/health" => respond(StatusCode::OK, "text/plain", "OK".to_string()),
        "/status" => {
            let telemetry = state.status.latest();
            let body = StatusBody {
                connected: telemetry.is_some(),
                telemetry,
            };
            match serde_json::to_string(&body) {
                Ok(json) => respond(StatusCode::OK, "application/json", json),
                Err(e) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    e.to_string(),
                ),
            }
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    }
}
