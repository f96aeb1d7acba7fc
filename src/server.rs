//! Node runtime: wires the broker, the optional dispatcher and both listeners
//! together and runs them until Ctrl-C.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::broker::{Broker, InMemoryRegistryStore, RegistryStore, SledRegistryStore};
use crate::config::{Settings, StoreKind};
use crate::dispatcher::{Dispatcher, InMemoryPeerStore, PeerInfo, PeerStore, SledPeerStore};
use crate::transport::http::{AppState, serve_http};
use crate::transport::websocket::serve_websocket;
use crate::utils::error::ServerError;

pub async fn run(settings: Settings) -> Result<(), ServerError> {
    let settings = Arc::new(settings);
    let topics: Box<dyn RegistryStore> = match settings.broker.store {
        StoreKind::Memory => Box::new(InMemoryRegistryStore::new()),
        StoreKind::Sled => Box::new(SledRegistryStore::open(&settings.broker.sled_path)?),
    };
    let broker = Broker::start_with_store(&settings.broker, topics)?;

    // The dispatcher must see every subscription, so it starts before the
    // listeners accept anyone.
    let dispatcher = if settings.dispatcher.enabled {
        Some(start_dispatcher(&broker, &settings).await?)
    } else {
        None
    };

    let http_addr = format!("{}:{}", settings.server.host, settings.server.port);
    let ws_addr = format!("{}:{}", settings.server.host, settings.server.ws_port);
    let http_listener = TcpListener::bind(&http_addr).await?;
    let ws_listener = TcpListener::bind(&ws_addr).await?;
    info!("HTTP server listening on http://{http_addr}");
    info!("WebSocket server listening on ws://{ws_addr}");

    let state = AppState {
        broker: broker.clone(),
        dispatcher: dispatcher.clone(),
        settings: Arc::clone(&settings),
    };

    let outcome = tokio::select! {
        result = serve_http(http_listener, state) => {
            error!("HTTP server exited unexpectedly.");
            result.map_err(ServerError::from)
        }
        _ = serve_websocket(ws_listener, broker.clone(), Arc::clone(&settings)) => {
            error!("WebSocket server exited unexpectedly.");
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
            Ok(())
        }
    };

    if let Some(dispatcher) = &dispatcher {
        if let Err(err) = dispatcher.close().await {
            warn!(error = %err, "failed to close dispatcher");
        }
    }
    broker.close().await?;
    outcome
}

async fn start_dispatcher(broker: &Broker, settings: &Settings) -> Result<Dispatcher, ServerError> {
    let store: Arc<dyn PeerStore> = match settings.dispatcher.store {
        StoreKind::Memory => Arc::new(InMemoryPeerStore::new()),
        StoreKind::Sled => Arc::new(SledPeerStore::open(&settings.dispatcher.sled_path)?),
    };
    let local = PeerInfo::new(settings.advertise_url());
    let dispatcher =
        Dispatcher::start(broker.clone(), store, local, &settings.dispatcher).await?;
    Ok(dispatcher)
}
