#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use poem::{EndpointExt, Server, listener::TcpListener, middleware::Tracing};
use ssh_shell_sessions::ssh::{
    ApiState, InMemorySessionStore, RusshConnector, ServiceConfig, SessionService, config,
    routes,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let settings = ServiceConfig::from_env();
    info!(
        init_timeout = ?settings.protocol.init_timeout,
        command_timeout = ?settings.protocol.command_timeout,
        columns = settings.pty.columns,
        "Loaded session configuration"
    );

    let service = Arc::new(SessionService::new(
        Arc::new(RusshConnector::new(settings.connect)),
        Arc::new(InMemorySessionStore::new()),
        settings,
    ));
    let shutdown = CancellationToken::new();
    let app = routes(Arc::new(ApiState {
        service: service.clone(),
        shutdown: shutdown.clone(),
    }))
    .with(Tracing);

    let addr = format!("0.0.0.0:{}", config::resolve_http_port(None));
    info!("Starting SSH shell session server on {}", addr);

    Server::new(TcpListener::bind(addr))
        .name("SSH Shell Sessions")
        .run_with_graceful_shutdown(
            app,
            async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutdown requested");
                shutdown.cancel();
            },
            None,
        )
        .await?;

    service.shutdown().await;
    Ok(())
}
