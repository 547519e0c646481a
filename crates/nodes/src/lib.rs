//! `nodes` crate: the `NodeHandler` trait, handler registry and built-in nodes.
//!
//! Every node type, built-in or plugin, must implement [`NodeHandler`].
//! The engine crate dispatches execution through this trait object, resolved
//! from a [`HandlerRegistry`] by the node's `type`.

pub mod builtin;
pub mod error;
pub mod mock;
pub mod registry;
pub mod traits;

pub use error::NodeError;
pub use registry::{HandlerRegistry, NodeRegistry};
pub use traits::{NodeExecutionContext, NodeHandler, NodeResult};
