//! Chorus daemon
//!
//! One binary, two roles:
//! - hub: owns the user directory and ACLs, tracks edges, answers forwarded auth
//! - edge: terminates clients and enforces policy replicated from the hub

pub mod acl_store;
pub mod client_state;
pub mod config;
pub mod dispatcher;
pub mod edge;
pub mod edge_link;
pub mod handlers;
pub mod hub;
pub mod metrics;
pub mod node_registry;
pub mod session;
mod wire;

pub use config::{DaemonConfig, NodeRole};
pub use edge::Edge;
pub use hub::Hub;

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// Run the configured role until it stops or Ctrl-C arrives
pub async fn run(config: DaemonConfig) -> Result<()> {
    config.validate()?;

    match config.node.role {
        NodeRole::Hub => {
            let hub = Hub::from_config(&config).await?;
            let listener = chorus_transport::listen(&config.hub.listen_config(&config.transport)?).await?;
            info!("Hub {} starting ({})", config.node.id, config.transport.protocol.as_str());

            let serving = tokio::spawn(Arc::clone(&hub).serve(listener));
            tokio::select! {
                served = serving => served?,
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down hub");
                    hub.shutdown();
                    Ok(())
                }
            }
        }
        NodeRole::Edge => {
            let edge = Edge::from_config(&config).await?;
            let listener = chorus_transport::listen(&config.edge.listen).await?;
            info!(
                "Edge {} starting, hub at {} ({})",
                config.node.id,
                config.transport.endpoint(),
                config.transport.protocol.as_str()
            );

            tokio::select! {
                served = Arc::clone(&edge).serve(listener) => served,
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down edge");
                    edge.shutdown().await;
                    Ok(())
                }
            }
        }
    }
}
