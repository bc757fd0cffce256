//! Core data model shared by the compiler, the controller, and the registries.

mod process_chain;
mod service;
mod submission;
mod workflow;

pub use process_chain::{Argument, ArgumentVariable, Executable, ProcessChain};
pub use service::{
    ArgumentKind, Cardinality, DATA_TYPE_DIRECTORY, ServiceMetadata, ServiceParameter,
};
pub use submission::{ProcessChainStatus, Submission, SubmissionStatus};
pub use workflow::{
    Action, ExecuteAction, ForEachAction, InputParameter, OutputParameter, Variable, Workflow,
};
