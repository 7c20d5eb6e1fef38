pub mod approval;
pub mod checkpoint;
pub mod delegation;
pub mod driver;
pub mod error;
pub mod prompts;
pub mod registry;
pub mod sink;
pub mod supervisor;
pub mod tools;
pub mod worker;

pub use approval::{ApprovalDecision, ApprovalGate, ApprovalRequest, AutoApprove, InterruptOn};
pub use delegation::Team;
pub use driver::{DriverConfig, SessionDriver, TurnOverrides, TurnRequest, TurnStream};
pub use error::EngineError;
pub use registry::{ToolFilter, ToolRegistry};
pub use supervisor::{Supervisor, SupervisorConfig, TurnOutcome};
pub use worker::{LlmWorker, RetryPolicy, Worker, WorkerError, WorkerOutput, WorkerSpec};
