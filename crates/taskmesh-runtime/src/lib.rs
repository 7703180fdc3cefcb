pub mod config;
pub mod entity;
pub mod identity;
pub mod node;
pub mod telemetry;
pub mod transport;
pub mod transports;

pub use config::NodeConfig;
pub use entity::{Entity, EntityBuilder};
pub use identity::Identity;
pub use node::{ManagerNode, WorkerNode};
pub use transport::{EntityContext, Transport};
