//! Graph IR, graph modules and the transformation passes run on them
//!
//! - [`Graph`]: ordered node list with use rewriting and erasure
//! - [`GraphModule`]: a graph plus the submodules its nodes call
//! - [`GraphModContext`]: per-submodule state shared by [`passes`]

mod context;
mod ir;
mod module;
pub mod passes;

pub use context::{GraphModContext, PassPhase};
pub use ir::{Function, Graph, Node, NodeId, Op};
pub use module::GraphModule;
pub use passes::Pass;
