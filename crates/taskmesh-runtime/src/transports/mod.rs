pub mod settlement;
pub mod task_runner;
pub mod worker_pool;

pub use settlement::{ChannelSink, SettlementSink, SettlementTransport, StoreSink};
pub use task_runner::{EchoExecutor, TaskExecutor, TaskRunnerTransport};
pub use worker_pool::WorkerPoolTransport;
