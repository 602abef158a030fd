use std::fmt::{self, Display};
use std::net::{AddrParseError, IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{Request, Response, StatusCode},
    routing::{get, post},
    Router,
};
use tokio::net::{TcpListener, UnixListener};
use tower_http::trace::TraceLayer;
use tracing::{
    debug_span,
    field::{display, Empty},
    info, instrument, Span,
};

use crate::discovery::Deduper;
use crate::provision::Provisioner;

pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// Control API listen address
#[derive(Clone, Debug)]
pub enum LocalAddress {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl Display for LocalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalAddress::Tcp(socket_addr) => socket_addr.fmt(f),
            LocalAddress::Unix(path) => path.as_path().display().fmt(f),
        }
    }
}

impl FromStr for LocalAddress {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(LocalAddress::Tcp)
            .or_else(|_| Ok(LocalAddress::Unix(Path::new(s).to_path_buf())))
    }
}

impl Default for LocalAddress {
    fn default() -> Self {
        LocalAddress::Tcp(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            48600,
        ))
    }
}

#[derive(Clone)]
struct AppState {
    provisioner: Arc<Provisioner>,
    deduper: Arc<Deduper>,
}

/// Start the control API.
///
/// This is the process-local rendition of the pairing transport and the
/// bus subscription: the radio bridge writes credential payloads to
/// `/v1/credentials` and reads `/v1/status` back, and the bus bridge
/// delivers messages from the discovery topic to `/v1/discovery`.
#[instrument(name = "api", skip_all)]
pub async fn start(listener: Listener, provisioner: Arc<Provisioner>, deduper: Arc<Deduper>) {
    let api_span = Span::current();
    let app = Router::new()
        .route("/v1/ping", get(|| async { "OK" }))
        .route("/v1/status", get(read_status))
        .route("/v1/credentials", post(write_credentials))
        .route("/v1/discovery", post(deliver_discovery))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(move |request: &Request<Body>| {
                    debug_span!(parent: &api_span, "request",
                        method = %request.method(),
                        uri = %request.uri().path(),
                        status = Empty,
                    )
                })
                .on_response(|response: &Response<Body>, _: Duration, span: &Span| {
                    span.record("status", display(response.status()));
                }),
        )
        .with_state(AppState {
            provisioner,
            deduper,
        });

    info!("ready");

    // safe because `serve` will never return an error (or return at all).
    match listener {
        Listener::Tcp(listener) => axum::serve(listener, app).await,
        Listener::Unix(listener) => axum::serve(listener, app).await,
    }
    .unwrap()
}

/// Handle `GET /v1/status`
///
/// The literal status-characteristic value; side-effect free.
async fn read_status(State(state): State<AppState>) -> &'static str {
    state.provisioner.status().await.as_str()
}

/// Handle `POST /v1/credentials`
///
/// Always 202: the peer learns the outcome from the status characteristic
/// and the logs, there is no richer feedback channel on the pairing
/// transport.
async fn write_credentials(State(state): State<AppState>, body: Bytes) -> StatusCode {
    state.provisioner.handle_write(&body).await;
    StatusCode::ACCEPTED
}

/// Handle `POST /v1/discovery`
///
/// One raw message from the discovery topic; undecodable or duplicate
/// messages are dropped inside.
async fn deliver_discovery(State(state): State<AppState>, body: Bytes) -> StatusCode {
    state.deduper.handle_message(&body).await;
    StatusCode::ACCEPTED
}
