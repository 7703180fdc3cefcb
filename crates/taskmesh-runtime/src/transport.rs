use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::watch;

use crate::identity::Identity;
use taskmesh_storage::KvStore;
use taskmesh_types::{PeerId, Result};

/// Shared resources every transport receives at initialisation.
#[derive(Clone)]
pub struct EntityContext {
    store: Arc<dyn KvStore>,
    identity: Arc<Identity>,
    shutdown_rx: watch::Receiver<bool>,
}

impl EntityContext {
    pub(crate) fn new(
        store: Arc<dyn KvStore>,
        identity: Arc<Identity>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            identity,
            shutdown_rx,
        }
    }

    pub fn store(&self) -> Arc<dyn KvStore> {
        self.store.clone()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn peer_id(&self) -> &PeerId {
        self.identity.peer_id()
    }

    /// Receiver that flips to `true` when the entity shuts down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}

/// One capability of a network entity.
///
/// Transports are registered on an `EntityBuilder` under a unique name and
/// initialised in registration order; typed access goes through
/// `Entity::transport::<T>()`.
#[async_trait]
pub trait Transport: Any + Send + Sync {
    fn name(&self) -> &'static str;

    async fn initialize(&self, ctx: &EntityContext) -> Result<()>;

    /// Stop background work. Called in reverse registration order.
    async fn shutdown(&self) {}

    fn as_any(&self) -> &dyn Any;
}
