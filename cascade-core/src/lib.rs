//! Cascade Core
//!
//! This crate provides the propagation engine for the Cascade
//! facility-control device framework. It implements:
//!
//! - Value triplets (payload, timestamp, quality) with structural equality
//! - Named result-or-error nodes with change-gated notification
//! - A dependency graph compiling user rules into a cycle-checked,
//!   topologically-ordered propagation schedule
//!
//! The device-facing glue (remote proxies, attribute declaration, device
//! lifecycle) lives in the surrounding framework; this crate is the part
//! that decides *what to recompute, when* once any reading changes.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `triplet`: the (value, stamp, quality) reading and its equality
//!   relation, which drives change detection
//! - `graph`: nodes, rules and the propagation scheduler
//! - `diagnostics`: the structured sink for non-fatal engine faults
//!
//! # Example
//!
//! ```rust,ignore
//! use cascade_core::graph::{Graph, Node};
//!
//! let graph = Graph::new();
//! graph.add_node(Node::new("inlet"))?;
//! graph.add_node(Node::new("outlet"))?;
//! graph.add_node(Node::new("drop"))?;
//! graph.add_rule("drop", &["inlet", "outlet"], |inputs| {
//!     let inlet = inputs[0].result()?.ok_or("inlet is not set")?;
//!     let outlet = inputs[1].result()?.ok_or("outlet is not set")?;
//!     Ok(inlet - outlet)
//! })?;
//! graph.build()?;
//!
//! // Pushing readings recomputes every dependent node.
//! graph.get("inlet").unwrap().set_result(7.2);
//! graph.get("outlet").unwrap().set_result(6.5);
//! ```
//!
//! # Threading
//!
//! The engine is single-threaded and cooperative: handles are
//! `Send + Sync`, but the surrounding framework must serialize all
//! mutations. See the `graph` module documentation.

pub mod diagnostics;
pub mod graph;
pub mod triplet;
