//! The node contract and the leaf classes the driver must know about.

use std::any::Any;
use std::cell::Cell;
use std::sync::Arc;

use crate::data::{DataMap, SpanMut};

/// A dependency edge as reported by a node: the upstream server plus whether
/// the edge carries a value (as opposed to shape information only).
pub struct ServerEdge {
    pub server: Arc<dyn Node>,
    pub value_carrying: bool,
}

impl ServerEdge {
    /// A value-carrying edge.
    pub fn value(server: Arc<dyn Node>) -> Self {
        ServerEdge {
            server,
            value_carrying: true,
        }
    }

    /// A shape-only edge.
    pub fn shape(server: Arc<dyn Node>) -> Self {
        ServerEdge {
            server,
            value_carrying: false,
        }
    }
}

/// A value producer in the computation graph.
///
/// Identity is handle identity; the driver additionally treats distinct
/// handles with the same name as aliases of one storage slot. Kernels resolve
/// their servers' outputs through the [`DataMap`] passed to `compute_batch`.
pub trait Node: Any {
    /// Display name; also the key data columns are bound by and the key the
    /// analyzer deduplicates on.
    fn name(&self) -> &str;

    /// Class tag shown in diagnostics.
    fn class_name(&self) -> &str;

    /// Upstream dependencies in declaration order.
    fn servers(&self) -> Vec<ServerEdge> {
        Vec::new()
    }

    /// Evaluates the node over a batch, writing `out.len()` results. The map
    /// carries every server's current span and, on the device side, this
    /// node's kernel configuration.
    fn compute_batch(&self, out: SpanMut, data: &DataMap);

    /// Whether this node's kernel has a device implementation.
    fn can_compute_on_gpu(&self) -> bool {
        false
    }

    /// Whether this node collapses a batched input into a scalar.
    fn is_reducer(&self) -> bool {
        false
    }

    /// Driver-assigned token for O(1) identity-to-index resolution.
    fn data_token(&self) -> Option<usize> {
        None
    }

    fn set_data_token(&self, _token: usize) {}

    fn reset_data_token(&self) {}

    fn as_any(&self) -> &dyn Any;
}

/// Interior-mutable storage for the driver-assigned data token, for use by
/// node implementations.
#[derive(Debug, Default)]
pub struct TokenCell(Cell<Option<usize>>);

impl TokenCell {
    pub fn get(&self) -> Option<usize> {
        self.0.get()
    }

    pub fn set(&self, token: usize) {
        self.0.set(Some(token));
    }

    pub fn reset(&self) {
        self.0.set(None);
    }
}

/// A mutable scalar leaf holding one fitted parameter.
///
/// Every mutation bumps the reset counter, which is how the scheduler detects
/// changed parameters between evaluations.
#[derive(Debug)]
pub struct RealVar {
    name: String,
    value: Cell<f64>,
    reset_counter: Cell<u64>,
    token: TokenCell,
}

impl RealVar {
    pub fn new(name: &str, value: f64) -> Arc<Self> {
        Arc::new(RealVar {
            name: name.to_string(),
            value: Cell::new(value),
            reset_counter: Cell::new(0),
            token: TokenCell::default(),
        })
    }

    pub fn value(&self) -> f64 {
        self.value.get()
    }

    pub fn set_value(&self, value: f64) {
        self.value.set(value);
        self.reset_counter.set(self.reset_counter.get() + 1);
    }

    /// Monotonically increasing mutation counter.
    pub fn reset_counter(&self) -> u64 {
        self.reset_counter.get()
    }
}

impl Node for RealVar {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &str {
        "RealVar"
    }

    fn compute_batch(&self, mut out: SpanMut, _data: &DataMap) {
        let value = self.value.get();
        for slot in out.as_mut_slice() {
            *slot = value;
        }
    }

    fn data_token(&self) -> Option<usize> {
        self.token.get()
    }

    fn set_data_token(&self, token: usize) {
        self.token.set(token);
    }

    fn reset_data_token(&self) {
        self.token.reset();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A discrete leaf selecting between named states. Category leaves must be
/// data-bound before evaluation.
#[derive(Debug)]
pub struct Category {
    name: String,
    states: Vec<String>,
    current: Cell<usize>,
    token: TokenCell,
}

impl Category {
    pub fn new(name: &str, states: &[&str]) -> Arc<Self> {
        Arc::new(Category {
            name: name.to_string(),
            states: states.iter().map(|s| s.to_string()).collect(),
            current: Cell::new(0),
            token: TokenCell::default(),
        })
    }

    pub fn states(&self) -> &[String] {
        &self.states
    }

    pub fn current_index(&self) -> usize {
        self.current.get()
    }

    pub fn set_index(&self, index: usize) {
        assert!(index < self.states.len(), "state index out of range");
        self.current.set(index);
    }
}

impl Node for Category {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &str {
        "Category"
    }

    fn compute_batch(&self, mut out: SpanMut, _data: &DataMap) {
        let index = self.current.get() as f64;
        for slot in out.as_mut_slice() {
            *slot = index;
        }
    }

    fn data_token(&self) -> Option<usize> {
        self.token.get()
    }

    fn set_data_token(&self, token: usize) {
        self.token.set(token);
    }

    fn reset_data_token(&self) {
        self.token.reset();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
