pub mod aggregator;
pub mod config;
pub mod keys;
pub mod ledger;
pub mod poseidon;
pub mod proof;
pub mod signer;

pub use aggregator::*;
pub use config::*;
pub use keys::*;
pub use ledger::*;
pub use proof::*;
pub use signer::*;
