use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy for one run. Everything here is caught at the agent
/// loop boundary and turned into a terminal status plus a reason string;
/// only `Configuration` is allowed to abort startup.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("reasoning backend unavailable: {0}")]
    ReasoningUnavailable(String),
    #[error("reasoning response was not in the expected format")]
    ReasoningMalformed,
    #[error("command timed out after {0:?}")]
    ExecutionTimeout(Duration),
    #[error("command blocked: {0}")]
    CommandBlocked(String),
    #[error("aborted by user: {0}")]
    UserAborted(String),
    #[error("{0}")]
    BudgetExhausted(String),
}
