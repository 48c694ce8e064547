pub mod config;
pub mod context;
pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod model;
pub mod runner;
pub mod sink;
pub mod template;
pub mod user;
pub mod worker;

pub use config::{AbortedRequestPolicy, EngineSettings, RunConfig, RunLimits, ThinkTime};
pub use coordinator::{Coordinator, RunHandle, RunReport};
pub use model::{ActionNode, Flow, LogRecord, RunStatus, WorkerMessage};
