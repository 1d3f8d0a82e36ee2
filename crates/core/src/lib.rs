// Core engine for Conductor: DAG workflow scheduling, step state, expressions and runtimes

pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod events;
pub mod expression;
pub mod runtime;
pub mod state;
pub mod storage;
pub mod types;
pub mod workflow;

pub use config::{EngineConfig, RuntimeConfig, RuntimeKind};
pub use connection::{ChannelListener, ConnectionManager, Listener, ListenerId, QueueListener};
pub use context::{ContextSnapshot, ExecutionContext};
pub use error::{ContextError, EngineError, EngineResult, RuntimeError, StructuralError};
pub use events::{Event, EventType};
pub use state::StepStateMachine;
pub use types::*;
