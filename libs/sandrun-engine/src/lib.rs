//! Execution dispatch for Sandrun.
//!
//! The dispatcher turns a (code, language) pair into one compile + run inside a
//! long-lived, shared environment:
//! - `registry` maps languages to recipes
//! - `lease` hands out environments, exclusively where a recipe demands it
//! - `artifacts` names and releases the files an execution creates
//! - `environment` is the seam to the isolated environment, `docker` its production backend

pub mod artifacts;
pub mod dispatcher;
pub mod docker;
pub mod environment;
pub mod error;
pub mod lease;
pub mod registry;

pub use dispatcher::{CodeRunner, DispatchSettings, Dispatcher};
pub use environment::{CommandOutput, Environment, Invocation};
pub use error::{DispatchError, EnvironmentError};
pub use registry::{LanguageRecipe, LanguageRegistry};
