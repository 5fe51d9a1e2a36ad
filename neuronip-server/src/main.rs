use anyhow::Result;
use neuronip_api::{
    observability::init_logging,
    resilience::ShutdownSignal,
    ControlPlane,
};
use neuronip_core::Context;
use std::{net::SocketAddr, sync::Arc};

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = config::Settings::load()?;
    init_logging(&settings.logging)?;

    tracing::info!("Starting NeuronIP control plane");

    let plane = Arc::new(ControlPlane::new(settings.control_plane())?);
    let (root, _cancel) = Context::background().with_cancel();
    plane.start(&root);

    let addr = settings.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", addr);

    // The first signal starts the shutdown hooks; the server stops accepting
    // connections as soon as they begin.
    let signal = ShutdownSignal::new();
    let shutdown = tokio::spawn({
        let plane = plane.clone();
        let root = root.clone();
        async move {
            signal.wait().await;
            plane.shutdown(&root).await
        }
    });

    let app = plane.router();
    let server_plane = plane.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        server_plane.shutdown_manager().started().await;
    })
    .await?;

    match shutdown.await? {
        Ok(()) => tracing::info!("Server stopped"),
        Err(err) => tracing::error!(error = %err, "Server stopped with errors"),
    }

    Ok(())
}
