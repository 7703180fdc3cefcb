pub mod config;
pub mod dispatcher;
pub mod policy;
pub mod queue;
pub mod registry;
pub mod sweeper;

pub use config::*;
pub use dispatcher::*;
pub use policy::*;
pub use queue::*;
pub use registry::*;
pub use sweeper::*;
