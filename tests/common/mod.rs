//! Shared node classes and helpers for driver tests.

#![allow(dead_code)]

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::sync::Arc;

use batchfit::{DataMap, Node, ServerEdge, SpanMut, TokenCell};

pub const EPSILON: f64 = 1e-12;

pub fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() < EPSILON
}

fn broadcast(span: &[f64], i: usize) -> f64 {
    if span.len() == 1 {
        span[0]
    } else {
        span[i]
    }
}

/// An elementwise binary function with scalar broadcast, counting its kernel
/// invocations.
pub struct BinaryFn {
    name: String,
    class: &'static str,
    op: fn(f64, f64) -> f64,
    lhs: Arc<dyn Node>,
    rhs: Arc<dyn Node>,
    gpu: bool,
    invocations: Cell<usize>,
    token: TokenCell,
}

impl BinaryFn {
    pub fn new(
        name: &str,
        class: &'static str,
        op: fn(f64, f64) -> f64,
        lhs: Arc<dyn Node>,
        rhs: Arc<dyn Node>,
        gpu: bool,
    ) -> Arc<Self> {
        Arc::new(BinaryFn {
            name: name.to_string(),
            class,
            op,
            lhs,
            rhs,
            gpu,
            invocations: Cell::new(0),
            token: TokenCell::default(),
        })
    }

    pub fn add(name: &str, lhs: Arc<dyn Node>, rhs: Arc<dyn Node>) -> Arc<Self> {
        Self::new(name, "AddFn", |a, b| a + b, lhs, rhs, false)
    }

    pub fn mul(name: &str, lhs: Arc<dyn Node>, rhs: Arc<dyn Node>) -> Arc<Self> {
        Self::new(name, "MulFn", |a, b| a * b, lhs, rhs, false)
    }

    pub fn invocations(&self) -> usize {
        self.invocations.get()
    }
}

impl Node for BinaryFn {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &str {
        self.class
    }

    fn servers(&self) -> Vec<ServerEdge> {
        vec![
            ServerEdge::value(Arc::clone(&self.lhs)),
            ServerEdge::value(Arc::clone(&self.rhs)),
        ]
    }

    fn compute_batch(&self, mut out: SpanMut, data: &DataMap) {
        self.invocations.set(self.invocations.get() + 1);
        let lhs = data.at(self.lhs.as_ref());
        let rhs = data.at(self.rhs.as_ref());
        let lhs = lhs.as_slice();
        let rhs = rhs.as_slice();
        for (i, slot) in out.as_mut_slice().iter_mut().enumerate() {
            *slot = (self.op)(broadcast(lhs, i), broadcast(rhs, i));
        }
    }

    fn can_compute_on_gpu(&self) -> bool {
        self.gpu
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

/// An elementwise unary function, counting its kernel invocations.
pub struct UnaryFn {
    name: String,
    class: &'static str,
    op: fn(f64) -> f64,
    src: Arc<dyn Node>,
    gpu: bool,
    invocations: Cell<usize>,
    token: TokenCell,
}

impl UnaryFn {
    pub fn new(
        name: &str,
        class: &'static str,
        op: fn(f64) -> f64,
        src: Arc<dyn Node>,
        gpu: bool,
    ) -> Arc<Self> {
        Arc::new(UnaryFn {
            name: name.to_string(),
            class,
            op,
            src,
            gpu,
            invocations: Cell::new(0),
            token: TokenCell::default(),
        })
    }

    pub fn exp(name: &str, src: Arc<dyn Node>) -> Arc<Self> {
        Self::new(name, "ExpFn", f64::exp, src, false)
    }

    pub fn log(name: &str, src: Arc<dyn Node>) -> Arc<Self> {
        Self::new(name, "LogFn", f64::ln, src, false)
    }

    pub fn invocations(&self) -> usize {
        self.invocations.get()
    }
}

impl Node for UnaryFn {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &str {
        self.class
    }

    fn servers(&self) -> Vec<ServerEdge> {
        vec![ServerEdge::value(Arc::clone(&self.src))]
    }

    fn compute_batch(&self, mut out: SpanMut, data: &DataMap) {
        self.invocations.set(self.invocations.get() + 1);
        let src = data.at(self.src.as_ref());
        let src = src.as_slice();
        for (i, slot) in out.as_mut_slice().iter_mut().enumerate() {
            *slot = (self.op)(broadcast(src, i));
        }
    }

    fn can_compute_on_gpu(&self) -> bool {
        self.gpu
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

/// Collapses its batched input into one sum.
pub struct SumFn {
    name: String,
    src: Arc<dyn Node>,
    gpu: bool,
    invocations: Cell<usize>,
    token: TokenCell,
}

impl SumFn {
    pub fn new(name: &str, src: Arc<dyn Node>, gpu: bool) -> Arc<Self> {
        Arc::new(SumFn {
            name: name.to_string(),
            src,
            gpu,
            invocations: Cell::new(0),
            token: TokenCell::default(),
        })
    }

    pub fn invocations(&self) -> usize {
        self.invocations.get()
    }
}

impl Node for SumFn {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &str {
        "SumFn"
    }

    fn servers(&self) -> Vec<ServerEdge> {
        vec![ServerEdge::value(Arc::clone(&self.src))]
    }

    fn compute_batch(&self, mut out: SpanMut, data: &DataMap) {
        self.invocations.set(self.invocations.get() + 1);
        let src = data.at(self.src.as_ref());
        out.as_mut_slice()[0] = src.as_slice().iter().sum();
    }

    fn can_compute_on_gpu(&self) -> bool {
        self.gpu
    }

    fn is_reducer(&self) -> bool {
        true
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

/// A function node whose server list can be rewired after construction, used
/// to build deliberately broken graphs.
pub struct RewirableFn {
    name: String,
    servers: RefCell<Vec<(Arc<dyn Node>, bool)>>,
    token: TokenCell,
}

impl RewirableFn {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(RewirableFn {
            name: name.to_string(),
            servers: RefCell::new(Vec::new()),
            token: TokenCell::default(),
        })
    }

    pub fn add_server(&self, server: Arc<dyn Node>) {
        self.servers.borrow_mut().push((server, true));
    }

    pub fn add_shape_server(&self, server: Arc<dyn Node>) {
        self.servers.borrow_mut().push((server, false));
    }
}

impl Node for RewirableFn {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &str {
        "RewirableFn"
    }

    fn servers(&self) -> Vec<ServerEdge> {
        self.servers
            .borrow()
            .iter()
            .map(|(server, value_carrying)| ServerEdge {
                server: Arc::clone(server),
                value_carrying: *value_carrying,
            })
            .collect()
    }

    fn compute_batch(&self, mut out: SpanMut, data: &DataMap) {
        let servers = self.servers.borrow();
        for (i, slot) in out.as_mut_slice().iter_mut().enumerate() {
            *slot = servers
                .iter()
                .filter(|(_, value_carrying)| *value_carrying)
                .map(|(server, _)| {
                    let span = data.at(server.as_ref());
                    broadcast(span.as_slice(), i)
                })
                .sum();
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
