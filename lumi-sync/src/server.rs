//! WebSocket endpoints for clients and peer servers.
//!
//! ```text
//!   GET /ws?token=<secret>       ──► client stream  (Hub::serve_connection)
//!   GET /ws/peer?server_id=<id>  ──► peer stream    (PeerManager::serve_inbound)
//! ```
//!
//! Routing happens during the opening handshake, so a rejected request gets a
//! plain HTTP status and never becomes a WebSocket.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};

use crate::config::ServerConfig;
use crate::hub::Hub;
use crate::peer::{PeerManager, SERVER_ID_PARAM};

pub const CLIENT_PATH: &str = "/ws";
pub const PEER_PATH: &str = "/ws/peer";

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),
}

/// Where an accepted handshake is routed.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Client,
    Peer { server_id: String },
}

/// Accept loop for both endpoints.
#[derive(Clone)]
pub struct NoteServer {
    bind_addr: String,
    token: Arc<str>,
    hub: Hub,
    peers: PeerManager,
}

impl NoteServer {
    pub fn new(config: &ServerConfig, hub: Hub, peers: PeerManager) -> Self {
        Self {
            bind_addr: config.bind_addr.clone(),
            token: Arc::from(config.token.as_str()),
            hub,
            peers,
        }
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.bind_addr.clone(),
                source,
            })?;
        log::info!("Server {} listening on {}", self.hub.identity(), self.bind_addr);
        self.serve(listener).await
    }

    /// Serve an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await.map_err(ServerError::Accept)?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                server.handle_connection(stream, addr).await;
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let mut route = None;
        let callback = |request: &Request, response: Response| {
            match resolve(request.uri(), &self.token) {
                Ok(r) => {
                    route = Some(r);
                    Ok(response)
                }
                Err((status, reason)) => {
                    log::debug!("Rejecting {} from {addr}: {status}", request.uri());
                    let mut rejection = ErrorResponse::new(Some(reason.to_string()));
                    *rejection.status_mut() = status;
                    Err(rejection)
                }
            }
        };

        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                log::debug!("Handshake with {addr} failed: {e}");
                return;
            }
        };

        match route {
            Some(Route::Client) => {
                self.hub.serve_connection(ws, &addr.to_string()).await;
            }
            Some(Route::Peer { server_id }) => {
                log::info!("Inbound peer connected: {server_id} ({addr})");
                self.peers.serve_inbound(ws, &server_id).await;
            }
            None => log::warn!("Handshake with {addr} completed without a route"),
        }
    }
}

/// Match a handshake URI to an endpoint.
fn resolve(uri: &Uri, token: &str) -> Result<Route, (StatusCode, &'static str)> {
    let param = |name: &str| {
        uri.query().and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
        })
    };

    match uri.path() {
        CLIENT_PATH => match param("token") {
            Some(t) if t == token => Ok(Route::Client),
            _ => Err((StatusCode::UNAUTHORIZED, "Unauthorized")),
        },
        PEER_PATH => match param(SERVER_ID_PARAM) {
            Some(id) if !id.is_empty() => Ok(Route::Peer { server_id: id }),
            _ => Err((StatusCode::BAD_REQUEST, "server_id required")),
        },
        _ => Err((StatusCode::NOT_FOUND, "Not Found")),
    }
}
