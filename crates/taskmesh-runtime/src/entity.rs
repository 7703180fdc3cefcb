use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;

use crate::identity::Identity;
use crate::transport::{EntityContext, Transport};
use taskmesh_storage::KvStore;
use taskmesh_types::{MeshError, PeerId, Result};

/// Static list of transports resolved into an [`Entity`].
pub struct EntityBuilder {
    store: Arc<dyn KvStore>,
    identity: Arc<Identity>,
    transports: Vec<Arc<dyn Transport>>,
}

impl EntityBuilder {
    pub fn new(store: Arc<dyn KvStore>, identity: Identity) -> Self {
        Self {
            store,
            identity: Arc::new(identity),
            transports: Vec::new(),
        }
    }

    pub fn with(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Initialise every transport in registration order.
    ///
    /// Duplicate names are rejected before anything starts. If one transport
    /// fails, the ones already initialised are shut down in reverse order and
    /// the whole entity fails.
    pub async fn build(self) -> Result<Entity> {
        let mut names = HashSet::new();
        for transport in &self.transports {
            if !names.insert(transport.name()) {
                return Err(MeshError::DuplicateTransport(transport.name()));
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = EntityContext::new(self.store, self.identity, shutdown_rx);

        for (i, transport) in self.transports.iter().enumerate() {
            tracing::debug!(transport = transport.name(), "initializing transport");
            if let Err(e) = transport.initialize(&ctx).await {
                tracing::error!(transport = transport.name(), error = %e, "transport failed to initialize");
                let _ = shutdown_tx.send(true);
                for started in self.transports[..i].iter().rev() {
                    started.shutdown().await;
                }
                return Err(MeshError::TransportInit {
                    name: transport.name(),
                    reason: e.to_string(),
                });
            }
        }

        tracing::info!(
            peer_id = %ctx.peer_id(),
            transports = ?self.transports.iter().map(|t| t.name()).collect::<Vec<_>>(),
            "entity started"
        );
        Ok(Entity {
            ctx,
            transports: self.transports,
            shutdown_tx,
        })
    }
}

/// A running network entity: a peer identity plus its transports.
pub struct Entity {
    ctx: EntityContext,
    transports: Vec<Arc<dyn Transport>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Entity {
    pub fn transport<T: Transport>(&self) -> Option<&T> {
        self.transports
            .iter()
            .find_map(|t| t.as_any().downcast_ref::<T>())
    }

    pub fn transport_names(&self) -> Vec<&'static str> {
        self.transports.iter().map(|t| t.name()).collect()
    }

    pub fn peer_id(&self) -> &PeerId {
        self.ctx.peer_id()
    }

    pub fn context(&self) -> &EntityContext {
        &self.ctx
    }

    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        for transport in self.transports.iter().rev() {
            transport.shutdown().await;
        }
        tracing::info!(peer_id = %self.peer_id(), "entity stopped");
    }
}
