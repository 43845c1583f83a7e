pub mod config;

use std::net::{IpAddr, SocketAddr};

use anyhow::Context;

use crate::app::config::AppConfig;
use crate::net::route::RouteTable;
use crate::net::server::Server;
use crate::pipeline::Backends;

pub struct App {
    server: Server,
}

impl App {
    /// Load every configured backend, then serve.
    pub async fn start(config: AppConfig) -> anyhow::Result<App> {
        let backends = Backends::load(&config.backends).context("failed to load detection backends")?;
        Self::start_with_backends(config, backends).await
    }

    pub async fn start_with_backends(config: AppConfig, backends: Backends) -> anyhow::Result<App> {
        tracing::debug!(backends = backends.len(), "building route table");
        let routes = RouteTable::build(&config.routes, &backends)?;
        for route in routes.iter() {
            tracing::info!(
                path = %route.path,
                backend = route.backend.name(),
                policy = ?route.policy,
                "registering route"
            );
        }

        let host: IpAddr = config
            .server
            .host
            .parse()
            .with_context(|| format!("invalid listen host {:?}", config.server.host))?;
        let server = Server::start(host, config.server.port, routes, config.session)
            .await
            .with_context(|| format!("failed to bind {}:{}", config.server.host, config.server.port))?;

        Ok(Self { server })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub async fn stop(self) {
        self.server.stop().await;
    }
}
