use crate::types::StepStatus;

/// Problems with the shape of a workflow, detected before anything runs
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StructuralError {
    #[error("step '{name}' is defined more than once")]
    DuplicateStep { name: String },

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    MissingDependency { step: String, dependency: String },

    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("step '{step}' uses unknown kind '{kind}'")]
    UnknownKind { step: String, kind: String },
}

/// Errors raised by the workflow engine itself
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Structural(#[from] StructuralError),

    #[error("invalid transition for step '{step}': {from} -> {to}")]
    InvalidTransition {
        step: String,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("step '{step}' failed: {message}")]
    StepExecution { step: String, message: String },

    #[error("step '{0}' is not part of this workflow")]
    UnknownStep(String),

    #[error("scheduler stalled with pending steps: {}", pending.join(", "))]
    SchedulingStalled { pending: Vec<String> },
}

/// Errors from execution context writes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context path is empty")]
    EmptyPath,

    #[error("context path '{path}' must start with one of: inputs, steps, ctx")]
    UnknownRoot { path: String },
}

/// Errors from runtime backends
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("{runtime} runtime unavailable: {reason}")]
    Unavailable { runtime: String, reason: String },

    #[error("{runtime} runtime has not been set up")]
    NotSetUp { runtime: String },

    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
