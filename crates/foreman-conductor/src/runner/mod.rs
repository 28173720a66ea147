pub mod event_log;
pub mod foreman;
pub mod notify;
pub mod response;

pub use foreman::Foreman;
pub use response::{PipelineResponse, RunSummary};
