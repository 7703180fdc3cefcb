pub mod error;
pub mod ids;
pub mod message;
pub mod payment;
pub mod task;
pub mod worker;

pub use error::*;
pub use ids::*;
pub use message::*;
pub use payment::*;
pub use task::*;
pub use worker::*;
