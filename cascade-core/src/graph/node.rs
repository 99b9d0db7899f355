//! Graph Nodes
//!
//! A Node is a named cell holding the current outcome of one quantity in
//! the propagation graph: either a successful result or a captured
//! failure. Observers subscribe to the node and are notified when the
//! content actually changes.
//!
//! # Change Gating
//!
//! Setting a node's content compares the proposed content against the
//! current one and only notifies observers on a real change. This is the
//! central incremental-evaluation optimization: an input that recomputes
//! to the same value must not cascade recomputation downstream.
//!
//! For results, "same" is the payload's `PartialEq` (structural, so vector
//! payloads compare element-wise). For failures, "same" means the same
//! shared error instance: a rule that keeps failing with the error object
//! already stored does not re-notify, while a fresh error does.
//!
//! # Sharing
//!
//! `Node` is a cheap-to-clone handle over shared interior state. The graph
//! keeps one handle in its registry and rule closures keep their own;
//! all observe the same cell.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::diagnostics::{Diagnostic, DiagnosticSink, TracingSink};

/// Error type observer callbacks may return.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

type Callback<T> = Arc<dyn Fn(&Node<T>) -> Result<(), CallbackError> + Send + Sync>;

/// Unique identifier for a registered observer callback.
///
/// Subscribing is keyed by id so that removal is explicit and idempotent,
/// and so a caller can check for its own callback before re-registering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

impl CallbackId {
    /// Generate a new unique callback ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for CallbackId {
    fn default() -> Self {
        Self::new()
    }
}

/// A captured failure stored in a node.
///
/// The underlying error is shared behind an `Arc`, so the node, the graph
/// and any number of readers can hold the same failure cheaply. Two
/// `NodeError`s compare as "the same failure" only when they share that
/// instance.
#[derive(Debug, Clone)]
pub struct NodeError(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl NodeError {
    /// Wrap an error (or message) as a storable node failure.
    pub fn new<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self(Arc::from(error.into()))
    }

    /// Check whether two handles refer to the same stored failure.
    pub fn same_as(&self, other: &NodeError) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for NodeError {
    fn from(error: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self(Arc::from(error))
    }
}

/// Tagged node state: result and failure are mutually exclusive.
///
/// `Empty` only exists between construction and the first assignment.
enum Content<T> {
    Empty,
    Value(T),
    Failed(NodeError),
}

struct NodeInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    name: String,
    description: String,
    content: RwLock<Content<T>>,
    callbacks: RwLock<Vec<(CallbackId, Callback<T>)>>,
    sink: RwLock<Arc<dyn DiagnosticSink>>,
}

/// A named cell holding a current result-or-error plus change observers.
///
/// # Example
///
/// ```rust,ignore
/// let node = Node::new("pressure");
///
/// node.subscribe(CallbackId::new(), |node| {
///     println!("{} changed", node.name());
///     Ok(())
/// });
///
/// node.set_result(4.2); // observers run
/// node.set_result(4.2); // unchanged, observers stay quiet
/// ```
pub struct Node<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    inner: Arc<NodeInner<T>>,
}

impl<T> Node<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a node whose description defaults to its name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let description = name.clone();
        Self::with_description(name, description)
    }

    /// Create a node with an explicit description.
    pub fn with_description(name: impl Into<String>, description: impl Into<String>) -> Self {
        let sink: Arc<dyn DiagnosticSink> = Arc::new(TracingSink);
        Self {
            inner: Arc::new(NodeInner {
                name: name.into(),
                description: description.into(),
                content: RwLock::new(Content::Empty),
                callbacks: RwLock::new(Vec::new()),
                sink: RwLock::new(sink),
            }),
        }
    }

    /// Get the node's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Get the node's description.
    pub fn description(&self) -> &str {
        &self.inner.description
    }

    /// Route observer-failure diagnostics to the given sink.
    pub fn set_diagnostic_sink(&self, sink: Arc<dyn DiagnosticSink>) {
        *self.inner.sink.write() = sink;
    }

    /// Store a successful result, notifying observers if it changed.
    ///
    /// The content is replaced either way; only the notification is
    /// change-gated. Recovering from a stored failure always counts as a
    /// change, as does the first assignment.
    pub fn set_result(&self, value: T) {
        let changed = {
            let mut content = self.inner.content.write();
            let changed = match &*content {
                Content::Failed(_) => true,
                Content::Empty => true,
                Content::Value(current) => *current != value,
            };
            *content = Content::Value(value);
            changed
        };
        if changed {
            self.notify();
        }
    }

    /// Store a captured failure, notifying observers if it changed.
    ///
    /// Replacing a result with a failure always counts as a change;
    /// re-storing the same shared error instance does not.
    pub fn set_exception(&self, error: NodeError) {
        let changed = {
            let mut content = self.inner.content.write();
            let changed = match &*content {
                Content::Value(_) => true,
                Content::Empty => true,
                Content::Failed(current) => !current.same_as(&error),
            };
            *content = Content::Failed(error);
            changed
        };
        if changed {
            self.notify();
        }
    }

    /// Get the current result.
    ///
    /// This is the unwrap of the node's tagged state: a stored failure is
    /// returned as `Err` instead of a value. `Ok(None)` means the node has
    /// not been assigned since construction.
    pub fn result(&self) -> Result<Option<T>, NodeError> {
        match &*self.inner.content.read() {
            Content::Failed(error) => Err(error.clone()),
            Content::Value(value) => Ok(Some(value.clone())),
            Content::Empty => Ok(None),
        }
    }

    /// Get the current failure, if any. Never fails.
    pub fn exception(&self) -> Option<NodeError> {
        match &*self.inner.content.read() {
            Content::Failed(error) => Some(error.clone()),
            _ => None,
        }
    }

    /// Register an observer callback under the given id.
    pub fn subscribe<F>(&self, id: CallbackId, callback: F)
    where
        F: Fn(&Node<T>) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.inner.callbacks.write().push((id, Arc::new(callback)));
    }

    /// Remove the observer registered under the given id, if present.
    pub fn unsubscribe(&self, id: CallbackId) {
        self.inner
            .callbacks
            .write()
            .retain(|(existing, _)| *existing != id);
    }

    /// Check whether an observer is registered under the given id.
    pub fn is_subscribed(&self, id: CallbackId) -> bool {
        self.inner
            .callbacks
            .read()
            .iter()
            .any(|(existing, _)| *existing == id)
    }

    /// Get the number of registered observers.
    pub fn callback_count(&self) -> usize {
        self.inner.callbacks.read().len()
    }

    /// Invoke every observer with this node, in registration order.
    ///
    /// A failing observer is reported to the diagnostic sink and the
    /// remaining observers still run.
    pub fn notify(&self) {
        // Snapshot the list so observers may subscribe or unsubscribe
        // without holding the callbacks lock through their own execution.
        let callbacks: Vec<Callback<T>> = self
            .inner
            .callbacks
            .read()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();

        for callback in callbacks {
            if let Err(error) = callback(self) {
                let sink = self.inner.sink.read().clone();
                sink.emit(Diagnostic::CallbackFailed {
                    node: self.inner.name.clone(),
                    error: error.to_string(),
                });
            }
        }
    }
}

impl<T> Clone for Node<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Node<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.content.read() {
            Content::Empty => "empty",
            Content::Value(_) => "value",
            Content::Failed(_) => "failed",
        };
        f.debug_struct("Node")
            .field("name", &self.inner.name)
            .field("state", &state)
            .field("callback_count", &self.callback_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::MemorySink;
    use std::sync::atomic::AtomicI32;

    fn counting_callback(
        count: Arc<AtomicI32>,
    ) -> impl Fn(&Node<i32>) -> Result<(), CallbackError> {
        move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn callback_ids_are_unique() {
        let id1 = CallbackId::new();
        let id2 = CallbackId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn equal_results_notify_once() {
        let node = Node::new("n");
        let count = Arc::new(AtomicI32::new(0));
        node.subscribe(CallbackId::new(), counting_callback(count.clone()));

        node.set_result(5);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Same value: content replaced silently.
        node.set_result(5);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        node.set_result(7);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn same_failure_instance_notifies_once() {
        let node: Node<i32> = Node::new("n");
        let count = Arc::new(AtomicI32::new(0));
        node.subscribe(CallbackId::new(), counting_callback(count.clone()));

        let error = NodeError::new("broken input");
        node.set_exception(error.clone());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Same shared instance: no change.
        node.set_exception(error);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // A fresh error, even with the same message, is a change.
        node.set_exception(NodeError::new("broken input"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn result_unwraps_the_stored_failure() {
        let node = Node::new("n");

        assert!(matches!(node.result(), Ok(None)));
        assert!(node.exception().is_none());

        node.set_exception(NodeError::new("no reading"));
        assert!(node.result().is_err());
        assert!(node.exception().is_some());

        // Recovery: a subsequent result clears the failure.
        node.set_result(3);
        assert_eq!(node.result().unwrap(), Some(3));
        assert!(node.exception().is_none());
    }

    #[test]
    fn switching_between_result_and_failure_notifies() {
        let node = Node::new("n");
        let count = Arc::new(AtomicI32::new(0));
        node.subscribe(CallbackId::new(), counting_callback(count.clone()));

        node.set_result(1);
        node.set_exception(NodeError::new("gone"));
        node.set_result(1);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn failing_observer_does_not_block_the_rest() {
        let node = Node::new("valve");
        let sink = Arc::new(MemorySink::new());
        node.set_diagnostic_sink(sink.clone());

        let count = Arc::new(AtomicI32::new(0));
        node.subscribe(CallbackId::new(), |_| Err("observer exploded".into()));
        node.subscribe(CallbackId::new(), counting_callback(count.clone()));

        node.set_result(1);

        // The second observer still ran.
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(
            sink.events(),
            vec![Diagnostic::CallbackFailed {
                node: "valve".into(),
                error: "observer exploded".into(),
            }]
        );
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let node: Node<i32> = Node::new("n");
        let id = CallbackId::new();
        node.subscribe(id, |_| Ok(()));
        assert!(node.is_subscribed(id));

        node.unsubscribe(id);
        assert!(!node.is_subscribed(id));
        node.unsubscribe(id);
        assert_eq!(node.callback_count(), 0);
    }

    #[test]
    fn clone_shares_state() {
        let node1 = Node::new("n");
        let node2 = node1.clone();

        node1.set_result(42);
        assert_eq!(node2.result().unwrap(), Some(42));
    }

    #[test]
    fn description_defaults_to_name() {
        let node: Node<i32> = Node::new("flow");
        assert_eq!(node.description(), "flow");

        let node: Node<i32> = Node::with_description("flow", "measured flow rate");
        assert_eq!(node.description(), "measured flow rate");
    }
}
