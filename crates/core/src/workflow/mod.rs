pub mod dag;
pub mod executor;
pub mod handler;
pub mod retry;

pub use dag::WorkflowDag;
pub use executor::WorkflowExecutor;
pub use handler::{EchoHandler, HandlerRegistry, ShellHandler, StepHandler, StepInvocation};
pub use retry::{RetryPolicy, RetryingHandler};
