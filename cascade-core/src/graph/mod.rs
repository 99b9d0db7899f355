//! Dependency Graph
//!
//! This module implements the reactive computation graph at the heart of
//! the framework: named value-holding nodes linked by user-supplied
//! derivation rules.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes hold a current result-or-error for one named quantity
//! - Rules derive a node's content from the content of other nodes
//!
//! When an external actor pushes a new value or error into a node, the
//! node notifies its observers only if the content actually changed. The
//! graph is one such observer: on notification it marks the node's
//! subscribers pending and drains the pending set in dependency order,
//! recomputing each affected node at most once per pass.
//!
//! # Design Decisions
//!
//! 1. Rules bind their inputs by name once, at declaration; names are
//!    resolved to node handles when the graph is built. This keeps
//!    declaration order free and makes unknown names a build error.
//!
//! 2. Dependency closures are precomputed at build time, so the scheduler
//!    never traverses the graph during a pass - readiness is one set
//!    disjointness check per pending node.
//!
//! 3. Structural errors (duplicate names, unknown nodes, cycles) fail the
//!    construction APIs loudly; computation errors are captured per node
//!    and never abort a pass.

use thiserror::Error;

mod engine;
mod node;

pub use engine::{Graph, RuleError};
pub use node::{CallbackError, CallbackId, Node, NodeError};

/// Structural errors raised while declaring or compiling a graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// A node with this name is already registered.
    #[error("a node called `{0}` already exists")]
    DuplicateNode(String),

    /// The named node is not in the graph.
    #[error("the node `{0}` is not in the graph")]
    UnknownNode(String),

    /// The named node already has a rule.
    #[error("a rule for `{0}` already exists")]
    DuplicateRule(String),

    /// A rule binds an input name that no node carries.
    #[error("the rule for `{node}` binds an unknown node `{input}`")]
    UnknownInput { node: String, input: String },

    /// The named node is in its own dependency closure.
    #[error("`{0}` is involved in a cyclic dependency")]
    CyclicDependency(String),
}
