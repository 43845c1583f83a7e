use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::ConnectInfo;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::app::config::SessionConfig;
use crate::net::route::{Route, RouteTable};
use crate::session::Session;

/// HTTP front: one WebSocket endpoint per route plus a health check.
pub struct Server {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    worker: JoinHandle<()>,
}

impl Server {
    pub async fn start(host: IpAddr, port: u16, routes: RouteTable, session: SessionConfig) -> io::Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let app = router(&routes, session, shutdown.clone());

        tracing::info!(%local_addr, routes = routes.len(), "server listening");
        let worker = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                let service = app.into_make_service_with_connect_info::<SocketAddr>();
                let served = axum::serve(listener, service)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await;
                if let Err(err) = served {
                    tracing::error!(%err, "server failed");
                }
            }
        });

        Ok(Self {
            local_addr,
            shutdown,
            worker,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, end every open session and wait for the listener.
    pub async fn stop(self) {
        tracing::trace!("stopping server");
        self.shutdown.cancel();
        if let Err(err) = self.worker.await {
            tracing::error!(%err, "server task failed");
        }
        tracing::info!("server stopped");
    }
}

pub fn router(routes: &RouteTable, session: SessionConfig, shutdown: CancellationToken) -> Router {
    let mut app = Router::new().route("/health", get(health));
    for route in routes.iter() {
        let route = route.clone();
        let shutdown = shutdown.clone();
        let path = route.path.clone();
        app = app.route(
            &path,
            get(move |ws: WebSocketUpgrade, ConnectInfo(peer): ConnectInfo<SocketAddr>| {
                let route = route.clone();
                let shutdown = shutdown.clone();
                async move {
                    ws.on_upgrade(move |socket| serve_socket(socket, peer, route, session, shutdown))
                }
            }),
        );
    }
    app
}

async fn health() -> impl IntoResponse {
    "OK"
}

async fn serve_socket(
    socket: WebSocket,
    peer: SocketAddr,
    route: Arc<Route>,
    config: SessionConfig,
    shutdown: CancellationToken,
) {
    let span = tracing::info_span!("session", %peer, path = %route.path);
    let (sink, stream) = socket.split();
    Session::new(route, config)
        .run(stream, sink, shutdown)
        .instrument(span)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_health() {
        let server = Server::start(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            0,
            RouteTable::default(),
            SessionConfig::default(),
        )
        .await
        .unwrap();
        assert_ne!(server.local_addr().port(), 0);

        let response = get(server.local_addr(), "/health").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.ends_with("OK"));

        let response = get(server.local_addr(), "/nowhere").await;
        assert!(response.starts_with("HTTP/1.1 404"), "{response}");

        server.stop().await;
    }
}
