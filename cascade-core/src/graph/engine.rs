//! Propagation Engine
//!
//! The graph is the registry, dependency compiler and propagation
//! scheduler in one: it owns every node by name, the derivation rules
//! linking them, and the transient state of the current propagation pass.
//!
//! # Algorithm
//!
//! Building compiles the declared rules into three maps:
//!
//! 1. `updates` - per rule, the user function together with its input
//!    nodes resolved from names to handles, callable with no further
//!    lookup.
//! 2. `subscriptions` - for each publisher, the set of nodes whose rule
//!    reads it directly.
//! 3. `dependencies` - for each ruled node, the transitive closure of its
//!    rule inputs, computed by a worklist fixed-point. A node appearing in
//!    its own closure is a cycle and fails the build.
//!
//! After a successful compile the graph subscribes its own callback to
//! every publisher. From then on, a content change on any publisher marks
//! that publisher's subscribers pending and drains the pending set in
//! dependency order: each step picks a pending node none of whose
//! dependencies are themselves pending, runs its rule, and stores the
//! outcome back into the node - which may extend the pending set through
//! the same callback. The `propagating` flag flattens this reentrancy
//! into iterative growth of the pending set, so fan-out depth never nests
//! propagation passes.
//!
//! # Threading
//!
//! The engine is single-threaded and cooperative. Its locks make the
//! handles `Send + Sync` and keep reentrant notify chains well-defined;
//! they do NOT make concurrent mutation safe. The surrounding framework
//! must serialize all `set_result`/`set_exception` calls.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::diagnostics::{Diagnostic, DiagnosticSink, TracingSink};

use super::node::{CallbackId, Node, NodeError};
use super::GraphError;

/// Error type derivation rules may return.
pub type RuleError = Box<dyn std::error::Error + Send + Sync>;

type RuleFn<T> = Arc<dyn Fn(&[Node<T>]) -> Result<T, RuleError> + Send + Sync>;

/// A declared rule: the user function plus its input names, unresolved.
struct Rule<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    func: RuleFn<T>,
    bind: SmallVec<[String; 4]>,
}

/// A compiled rule: inputs resolved to node handles at build time.
///
/// This is the fixed-arity form of the rule - invoking it hands the
/// publisher nodes to the user function in bind order, with no name
/// resolution left to do.
#[derive(Clone)]
struct Update<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    func: RuleFn<T>,
    publishers: SmallVec<[Node<T>; 4]>,
}

impl<T> Update<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn run(&self) -> Result<T, RuleError> {
        (self.func)(&self.publishers)
    }
}

#[derive(Default)]
struct PropagationState {
    pending: HashSet<String>,
    propagating: bool,
}

struct GraphShared<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    sink: Arc<dyn DiagnosticSink>,
    callback_id: CallbackId,
    nodes: RwLock<IndexMap<String, Node<T>>>,
    rules: RwLock<IndexMap<String, Rule<T>>>,
    updates: RwLock<HashMap<String, Update<T>>>,
    dependencies: RwLock<HashMap<String, HashSet<String>>>,
    subscriptions: RwLock<HashMap<String, HashSet<String>>>,
    propagation: Mutex<PropagationState>,
}

/// Clears the `propagating` flag when a pass completes or unwinds.
struct PropagateGuard<'a, T>(&'a GraphShared<T>)
where
    T: Clone + PartialEq + Send + Sync + 'static;

impl<T> Drop for PropagateGuard<'_, T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.0.propagation.lock().propagating = false;
    }
}

impl<T> GraphShared<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// The callback the graph plants on every publisher node.
    ///
    /// Marks the publisher's direct subscribers pending, then starts a
    /// propagation pass unless one is already running - in that case the
    /// running pass observes the growth and continues.
    fn on_change(&self, node: &Node<T>) {
        let subscribers = self
            .subscriptions
            .read()
            .get(node.name())
            .cloned()
            .unwrap_or_default();

        let start = {
            let mut state = self.propagation.lock();
            state.pending.extend(subscribers);
            if state.propagating {
                false
            } else {
                state.propagating = true;
                true
            }
        };
        if start {
            self.propagate();
        }
    }

    /// Drain the pending set to quiescence.
    fn propagate(&self) {
        let _guard = PropagateGuard(self);
        loop {
            let Some((name, stalled)) = self.next_pending() else {
                return;
            };
            if stalled {
                self.sink.emit(Diagnostic::PropagationStalled {
                    forced: name.clone(),
                });
            }
            self.update(&name);
        }
    }

    /// Pick the next pending node whose dependencies are all resolved.
    ///
    /// For an acyclic compiled graph a ready node always exists; if none
    /// does (pending corrupted externally), an arbitrary node is forced
    /// so the pass still terminates. The flag in the returned pair marks
    /// that forced pick.
    fn next_pending(&self) -> Option<(String, bool)> {
        let mut state = self.propagation.lock();
        if state.pending.is_empty() {
            return None;
        }

        let dependencies = self.dependencies.read();
        let ready = {
            let pending = &state.pending;
            pending
                .iter()
                .find(|name| {
                    dependencies
                        .get(*name)
                        .map_or(true, |deps| deps.is_disjoint(pending))
                })
                .cloned()
        };

        match ready {
            Some(name) => {
                state.pending.remove(&name);
                Some((name, false))
            }
            None => {
                let forced = state.pending.iter().next().cloned()?;
                state.pending.remove(&forced);
                Some((forced, true))
            }
        }
    }

    /// Run one node's compiled rule and store the outcome.
    ///
    /// A failing rule is captured on the node, never raised out of the
    /// pass - one broken derivation must not stall its siblings.
    fn update(&self, name: &str) {
        let Some(update) = self.updates.read().get(name).cloned() else {
            return;
        };
        let Some(node) = self.nodes.read().get(name).cloned() else {
            return;
        };
        match update.run() {
            Ok(result) => node.set_result(result),
            Err(error) => node.set_exception(NodeError::from(error)),
        }
    }
}

/// The dependency-graph propagation engine.
///
/// Nodes are registered by unique name, linked by rules, and compiled
/// with [`build`](Graph::build). After a build, pushing a value or error
/// into any registered node recomputes every node that transitively
/// depends on it, at most once per pass, in dependency order.
///
/// `Graph` is a cheap-to-clone handle; clones share the same engine. The
/// callbacks it plants on nodes hold only weak references back to it, so
/// dropping every handle disarms them.
///
/// # Example
///
/// ```rust,ignore
/// let graph = Graph::new();
/// graph.add_node(Node::new("a"))?;
/// graph.add_node(Node::new("b"))?;
/// graph.add_node(Node::new("sum"))?;
/// graph.add_rule("sum", &["a", "b"], |inputs| {
///     let a = inputs[0].result()?.ok_or("a is not set")?;
///     let b = inputs[1].result()?.ok_or("b is not set")?;
///     Ok(a + b)
/// })?;
/// graph.build()?;
///
/// graph.get("a").unwrap().set_result(1);
/// graph.get("b").unwrap().set_result(2);
/// assert_eq!(graph.get("sum").unwrap().result()?, Some(3));
/// ```
pub struct Graph<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    shared: Arc<GraphShared<T>>,
}

impl<T> Graph<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create an empty graph reporting diagnostics through `tracing`.
    pub fn new() -> Self {
        Self::with_sink(Arc::new(TracingSink))
    }

    /// Create an empty graph with an explicit diagnostic sink.
    pub fn with_sink(sink: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            shared: Arc::new(GraphShared {
                sink,
                callback_id: CallbackId::new(),
                nodes: RwLock::new(IndexMap::new()),
                rules: RwLock::new(IndexMap::new()),
                updates: RwLock::new(HashMap::new()),
                dependencies: RwLock::new(HashMap::new()),
                subscriptions: RwLock::new(HashMap::new()),
                propagation: Mutex::new(PropagationState::default()),
            }),
        }
    }

    /// Register a node under its name.
    pub fn add_node(&self, node: Node<T>) -> Result<(), GraphError> {
        let name = node.name().to_owned();
        let mut nodes = self.shared.nodes.write();
        if nodes.contains_key(&name) {
            return Err(GraphError::DuplicateNode(name));
        }
        nodes.insert(name, node);
        Ok(())
    }

    /// Associate a derivation rule with a registered node.
    ///
    /// `bind` names the publisher nodes, in the order the rule wants
    /// them. The rule receives those *nodes* (not their values) and calls
    /// [`Node::result`] itself, so it can also branch on
    /// [`Node::exception`]. Bind names are resolved at build time.
    pub fn add_rule<F>(&self, name: &str, bind: &[&str], func: F) -> Result<(), GraphError>
    where
        F: Fn(&[Node<T>]) -> Result<T, RuleError> + Send + Sync + 'static,
    {
        if !self.shared.nodes.read().contains_key(name) {
            return Err(GraphError::UnknownNode(name.to_owned()));
        }
        let mut rules = self.shared.rules.write();
        if rules.contains_key(name) {
            return Err(GraphError::DuplicateRule(name.to_owned()));
        }
        rules.insert(
            name.to_owned(),
            Rule {
                func: Arc::new(func),
                bind: bind.iter().map(|input| (*input).to_owned()).collect(),
            },
        );
        Ok(())
    }

    /// Compile the declared rules and arm the graph.
    ///
    /// The compile is all-or-nothing: an unknown bind name or a cyclic
    /// dependency anywhere aborts it and nothing is armed, though the
    /// declared nodes and rules survive for a retry. On success the graph
    /// subscribes itself to every publisher with at least one subscriber,
    /// exactly once even across repeated builds.
    pub fn build(&self) -> Result<(), GraphError> {
        let nodes = self.shared.nodes.read();
        let rules = self.shared.rules.read();

        let mut updates = HashMap::with_capacity(rules.len());
        let mut dependencies = HashMap::with_capacity(rules.len());
        let mut subscriptions: HashMap<String, HashSet<String>> = HashMap::new();

        for (name, rule) in rules.iter() {
            // Resolve bind names to node handles, in bind order.
            let mut publishers: SmallVec<[Node<T>; 4]> = SmallVec::new();
            for input in &rule.bind {
                let publisher = nodes.get(input).ok_or_else(|| GraphError::UnknownInput {
                    node: name.clone(),
                    input: input.clone(),
                })?;
                publishers.push(publisher.clone());
                subscriptions
                    .entry(input.clone())
                    .or_default()
                    .insert(name.clone());
            }
            updates.insert(
                name.clone(),
                Update {
                    func: rule.func.clone(),
                    publishers,
                },
            );

            // Transitive closure of the rule's inputs, expanding through
            // every encountered node that itself has a rule.
            let mut seen: HashSet<String> = HashSet::new();
            let mut work: Vec<String> = rule.bind.iter().cloned().collect();
            while let Some(current) = work.pop() {
                if !seen.insert(current.clone()) {
                    continue;
                }
                if let Some(upstream) = rules.get(&current) {
                    for input in &upstream.bind {
                        if !seen.contains(input) {
                            work.push(input.clone());
                        }
                    }
                }
            }
            if seen.contains(name) {
                return Err(GraphError::CyclicDependency(name.clone()));
            }
            dependencies.insert(name.clone(), seen);
        }

        // Commit only once every rule compiled.
        let publisher_names: Vec<String> = subscriptions.keys().cloned().collect();
        *self.shared.updates.write() = updates;
        *self.shared.dependencies.write() = dependencies;
        *self.shared.subscriptions.write() = subscriptions;

        for name in publisher_names {
            if let Some(publisher) = nodes.get(&name) {
                if !publisher.is_subscribed(self.shared.callback_id) {
                    let weak = Arc::downgrade(&self.shared);
                    publisher.subscribe(self.shared.callback_id, move |node| {
                        if let Some(shared) = weak.upgrade() {
                            shared.on_change(node);
                        }
                        Ok(())
                    });
                }
            }
        }
        Ok(())
    }

    /// Disarm the graph, keeping the declared nodes and rules.
    ///
    /// Detaches the graph callback from every publisher and clears the
    /// compiled and propagation state, returning the graph to its
    /// pre-build condition. A subsequent [`build`](Graph::build)
    /// recompiles from the same declarations.
    pub fn reset(&self) {
        let nodes = self.shared.nodes.read();
        for name in self.shared.subscriptions.read().keys() {
            if let Some(publisher) = nodes.get(name) {
                publisher.unsubscribe(self.shared.callback_id);
            }
        }
        drop(nodes);

        self.shared.updates.write().clear();
        self.shared.dependencies.write().clear();
        self.shared.subscriptions.write().clear();

        let mut state = self.shared.propagation.lock();
        state.pending.clear();
        state.propagating = false;
    }

    // ------------------------------------------------------------------
    // Read-only mapping view
    // ------------------------------------------------------------------

    /// Look up a node by name.
    pub fn get(&self, name: &str) -> Option<Node<T>> {
        self.shared.nodes.read().get(name).cloned()
    }

    /// Check whether a node with the given name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.shared.nodes.read().contains_key(name)
    }

    /// Get all node names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.shared.nodes.read().keys().cloned().collect()
    }

    /// Get handles to all nodes, in registration order.
    pub fn nodes(&self) -> Vec<Node<T>> {
        self.shared.nodes.read().values().cloned().collect()
    }

    /// Get the number of registered nodes.
    pub fn len(&self) -> usize {
        self.shared.nodes.read().len()
    }

    /// Check whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.shared.nodes.read().is_empty()
    }
}

impl<T> Clone for Graph<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for Graph<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Graph<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.len())
            .field("rules", &self.shared.rules.read().len())
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

    fn sum_rule(inputs: &[Node<i32>]) -> Result<i32, RuleError> {
        let mut total = 0;
        for input in inputs {
            total += input.result()?.ok_or("input is not set")?;
        }
        Ok(total)
    }

    fn sum_graph() -> Graph<i32> {
        let graph = Graph::new();
        graph.add_node(Node::new("a")).unwrap();
        graph.add_node(Node::new("b")).unwrap();
        graph.add_node(Node::new("sum")).unwrap();
        graph.add_rule("sum", &["a", "b"], sum_rule).unwrap();
        graph
    }

    #[test]
    fn duplicate_node_is_rejected() {
        let graph: Graph<i32> = Graph::new();
        graph.add_node(Node::new("a")).unwrap();
        assert_eq!(
            graph.add_node(Node::new("a")),
            Err(GraphError::DuplicateNode("a".into()))
        );
    }

    #[test]
    fn rule_on_unknown_node_is_rejected() {
        let graph: Graph<i32> = Graph::new();
        assert_eq!(
            graph.add_rule("ghost", &[], |_| Ok(0)),
            Err(GraphError::UnknownNode("ghost".into()))
        );
    }

    #[test]
    fn duplicate_rule_is_rejected() {
        let graph: Graph<i32> = Graph::new();
        graph.add_node(Node::new("a")).unwrap();
        graph.add_rule("a", &[], |_| Ok(0)).unwrap();
        assert_eq!(
            graph.add_rule("a", &[], |_| Ok(1)),
            Err(GraphError::DuplicateRule("a".into()))
        );
    }

    #[test]
    fn unknown_bind_name_fails_the_build() {
        let graph: Graph<i32> = Graph::new();
        graph.add_node(Node::new("a")).unwrap();
        graph.add_rule("a", &["missing"], sum_rule).unwrap();
        assert_eq!(
            graph.build(),
            Err(GraphError::UnknownInput {
                node: "a".into(),
                input: "missing".into()
            })
        );
    }

    #[test]
    fn direct_self_reference_is_a_cycle() {
        let graph: Graph<i32> = Graph::new();
        graph.add_node(Node::new("a")).unwrap();
        graph.add_rule("a", &["a"], sum_rule).unwrap();
        assert_eq!(
            graph.build(),
            Err(GraphError::CyclicDependency("a".into()))
        );
    }

    #[test]
    fn declarations_survive_a_failed_build() {
        let graph: Graph<i32> = Graph::new();
        graph.add_node(Node::new("a")).unwrap();
        graph.add_rule("a", &["missing"], sum_rule).unwrap();
        assert!(graph.build().is_err());

        // Fixing the rule set makes the same declarations buildable.
        graph.add_node(Node::new("missing")).unwrap();
        assert!(graph.build().is_ok());
    }

    #[test]
    fn propagation_recomputes_the_sum() {
        let graph = sum_graph();
        graph.build().unwrap();

        graph.get("a").unwrap().set_result(1);
        graph.get("b").unwrap().set_result(2);

        assert_eq!(graph.get("sum").unwrap().result().unwrap(), Some(3));

        graph.get("a").unwrap().set_result(10);
        assert_eq!(graph.get("sum").unwrap().result().unwrap(), Some(12));
    }

    #[test]
    fn repeated_builds_attach_the_callback_once() {
        let graph = sum_graph();
        graph.build().unwrap();
        graph.build().unwrap();

        assert_eq!(graph.get("a").unwrap().callback_count(), 1);
        assert_eq!(graph.get("b").unwrap().callback_count(), 1);
        // The ruled node publishes nothing, so it carries no callback.
        assert_eq!(graph.get("sum").unwrap().callback_count(), 0);
    }

    #[test]
    fn reset_then_build_reproduces_the_maps() {
        let graph = sum_graph();
        graph.build().unwrap();

        let dependencies = graph.shared.dependencies.read().clone();
        let subscriptions = graph.shared.subscriptions.read().clone();

        graph.reset();
        assert!(graph.shared.dependencies.read().is_empty());
        assert!(graph.shared.subscriptions.read().is_empty());
        assert_eq!(graph.get("a").unwrap().callback_count(), 0);

        graph.build().unwrap();
        assert_eq!(*graph.shared.dependencies.read(), dependencies);
        assert_eq!(*graph.shared.subscriptions.read(), subscriptions);
        assert_eq!(graph.get("a").unwrap().callback_count(), 1);
    }

    #[test]
    fn reset_disarms_propagation() {
        let graph = sum_graph();
        graph.build().unwrap();
        graph.get("a").unwrap().set_result(1);
        graph.get("b").unwrap().set_result(2);
        graph.reset();

        graph.get("a").unwrap().set_result(100);
        // No propagation: the sum keeps its last computed value.
        assert_eq!(graph.get("sum").unwrap().result().unwrap(), Some(3));
    }

    #[test]
    fn dependency_closure_is_transitive() {
        let graph: Graph<i32> = Graph::new();
        for name in ["a", "b", "c"] {
            graph.add_node(Node::new(name)).unwrap();
        }
        graph.add_rule("b", &["a"], sum_rule).unwrap();
        graph.add_rule("c", &["b"], sum_rule).unwrap();
        graph.build().unwrap();

        let dependencies = graph.shared.dependencies.read();
        assert_eq!(
            dependencies["c"],
            HashSet::from(["a".to_string(), "b".to_string()])
        );
        assert_eq!(dependencies["b"], HashSet::from(["a".to_string()]));
    }

    #[test]
    fn deadlock_fallback_terminates_with_one_diagnostic() {
        let sink = Arc::new(MemorySink::new());
        let graph: Graph<i32> = Graph::with_sink(sink.clone());
        graph.add_node(Node::new("a")).unwrap();
        graph.add_node(Node::new("b")).unwrap();
        graph
            .add_rule("a", &["b"], |inputs| {
                Ok(inputs[0].result()?.unwrap_or(0) + 1)
            })
            .unwrap();
        graph.build().unwrap();

        // Simulate external corruption: both nodes pending, each recorded
        // as depending on the other, so no pending node is ever ready.
        {
            let mut dependencies = graph.shared.dependencies.write();
            dependencies.insert("a".into(), HashSet::from(["b".to_string()]));
            dependencies.insert("b".into(), HashSet::from(["a".to_string()]));
        }
        {
            let mut state = graph.shared.propagation.lock();
            state.pending.insert("a".into());
            state.pending.insert("b".into());
            state.propagating = true;
        }

        graph.shared.propagate();

        let stalls = sink
            .events()
            .iter()
            .filter(|event| matches!(event, Diagnostic::PropagationStalled { .. }))
            .count();
        assert_eq!(stalls, 1);

        let state = graph.shared.propagation.lock();
        assert!(state.pending.is_empty());
        assert!(!state.propagating);
    }

    #[test]
    fn read_view_is_a_name_keyed_mapping() {
        let graph = sum_graph();

        assert_eq!(graph.len(), 3);
        assert!(!graph.is_empty());
        assert!(graph.contains("a"));
        assert!(!graph.contains("z"));
        assert_eq!(graph.names(), vec!["a", "b", "sum"]);
        assert!(graph.get("sum").is_some());
        assert!(graph.get("z").is_none());
        assert_eq!(graph.nodes().len(), 3);
    }

    #[test]
    fn dropping_every_handle_disarms_the_node_callbacks() {
        let graph = sum_graph();
        graph.build().unwrap();
        let a = graph.get("a").unwrap();
        drop(graph);

        // The planted callback only holds a weak reference; with the
        // graph gone this is a quiet no-op rather than a propagation.
        a.set_result(5);
        assert_eq!(a.result().unwrap(), Some(5));
    }
}
