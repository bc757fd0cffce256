//! Drover - workflow-to-process-chain compiler with a recovery-aware
//! execution controller.
//!
//! The [`Compiler`] lowers a declarative [`model::Workflow`] into batches of
//! [`model::ProcessChain`]s as results arrive; the [`Controller`] drives that
//! loop per submission on top of pluggable registries, surviving crashes via
//! checkpointed compiler state.

pub mod backends;
pub mod compiler;
pub mod config;
pub mod controller;
pub mod id;
pub mod model;

pub use compiler::{CompileError, Compiler, CompilerState};
pub use config::Config;
pub use controller::{Controller, ControllerConfig, ControllerError, LookupConfig, LookupTask};
pub use id::{IdGenerator, SequentialIdGenerator, TimeOrderedIdGenerator};
