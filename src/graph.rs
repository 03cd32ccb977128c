//! Graph analysis: ordering, token assignment and dependency records.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::buffer::ScratchBuffer;
#[cfg(feature = "cuda")]
use crate::cuda;
use crate::error::{EvalError, Result};
use crate::node::{Category, Node, RealVar};

/// Per-node scheduling record owned by the driver for the lifetime of a fit.
///
/// Dependency records hold indices into the driver's info vector rather than
/// pointers, covering value-carrying edges only and preserving edge
/// multiplicity.
pub struct NodeInfo {
    pub node: Arc<dyn Node>,
    /// Position in the ordered node list.
    pub token: usize,
    pub from_dataset: bool,
    pub is_variable: bool,
    pub is_category: bool,
    pub is_dirty: bool,
    /// Set at bind time for batched nodes, which are never cached.
    pub always_dirty: bool,
    pub output_size: usize,
    pub last_reset_count: u64,
    /// Inline output slot for scalar nodes; batched outputs use the pool.
    pub scalar_slot: f64,
    pub buffer: Option<Box<dyn ScratchBuffer>>,
    pub server_infos: Vec<usize>,
    pub client_infos: Vec<usize>,
    /// The output crosses the device boundary and must be staged in pinned
    /// memory.
    pub copy_after_eval: bool,
    pub logged_gpu_miss: bool,
    #[cfg(feature = "cuda")]
    pub stream: Option<Arc<cuda::Stream>>,
    #[cfg(feature = "cuda")]
    pub event: Option<cuda::Event>,
    #[cfg(feature = "cuda")]
    pub rem_clients: i32,
    #[cfg(feature = "cuda")]
    pub rem_servers: i32,
}

impl NodeInfo {
    fn new(node: Arc<dyn Node>, token: usize, is_variable: bool, is_category: bool) -> Self {
        NodeInfo {
            node,
            token,
            from_dataset: false,
            is_variable,
            is_category,
            is_dirty: true,
            always_dirty: false,
            output_size: 1,
            last_reset_count: u64::MAX,
            scalar_slot: 0.0,
            buffer: None,
            server_infos: Vec::new(),
            client_infos: Vec::new(),
            copy_after_eval: false,
            logged_gpu_miss: false,
            #[cfg(feature = "cuda")]
            stream: None,
            #[cfg(feature = "cuda")]
            event: None,
            #[cfg(feature = "cuda")]
            rem_clients: 0,
            #[cfg(feature = "cuda")]
            rem_servers: 0,
        }
    }

    pub fn is_scalar(&self) -> bool {
        self.output_size == 1
    }

    /// The device this node is placed on: GPU iff it is a reducer or batched,
    /// and its kernel has a device implementation.
    pub fn compute_in_gpu(&self) -> bool {
        (self.node.is_reducer() || !self.is_scalar()) && self.node.can_compute_on_gpu()
    }
}

/// Collects all value-reachable nodes below (and including) `top` in
/// topological order, servers first, `top` last. Nodes are deduplicated by
/// name so that handle-distinct aliases share one entry.
pub fn sorted_computation_graph(top: &Arc<dyn Node>) -> Result<Vec<Arc<dyn Node>>> {
    let mut order = Vec::new();
    let mut visited = FxHashSet::default();
    let mut in_stack = FxHashSet::default();
    visit(top, &mut visited, &mut in_stack, &mut order)?;
    Ok(order)
}

fn visit(
    node: &Arc<dyn Node>,
    visited: &mut FxHashSet<String>,
    in_stack: &mut FxHashSet<String>,
    order: &mut Vec<Arc<dyn Node>>,
) -> Result<()> {
    let name = node.name();
    if in_stack.contains(name) {
        return Err(EvalError::GraphCycle(name.to_string()));
    }
    if visited.contains(name) {
        return Ok(());
    }
    in_stack.insert(name.to_string());
    for edge in node.servers() {
        if edge.value_carrying {
            visit(&edge.server, visited, in_stack, order)?;
        }
    }
    in_stack.remove(name);
    visited.insert(name.to_string());
    order.push(Arc::clone(node));
    Ok(())
}

/// Analyzes the graph below `top`: orders it, assigns tokens, and fills in
/// the per-node dependency records.
///
/// Variables intentionally do not receive their token through the node; all
/// other nodes do, so kernels can resolve them in O(1).
pub fn analyze(top: &Arc<dyn Node>) -> Result<Vec<NodeInfo>> {
    let server_set = sorted_computation_graph(top)?;

    let mut index_of: FxHashMap<String, usize> = FxHashMap::default();
    let mut nodes = Vec::with_capacity(server_set.len());
    for (token, arg) in server_set.into_iter().enumerate() {
        let is_variable = arg.as_ref().as_any().downcast_ref::<RealVar>().is_some();
        let is_category = arg.as_ref().as_any().downcast_ref::<Category>().is_some();
        if !is_variable {
            arg.set_data_token(token);
        }
        index_of.insert(arg.name().to_string(), token);
        nodes.push(NodeInfo::new(arg, token, is_variable, is_category));
    }

    for i in 0..nodes.len() {
        let node = Arc::clone(&nodes[i].node);
        for edge in node.servers() {
            if !edge.value_carrying {
                continue;
            }
            let server = *index_of
                .get(edge.server.name())
                .expect("value server missing from the sorted computation graph");
            nodes[i].server_infos.push(server);
            nodes[server].client_infos.push(i);
        }
    }

    sync_data_tokens(&nodes);
    Ok(nodes)
}

/// Rewrites the data token of aliased duplicate servers so they share the
/// slot of the node already known to the driver. Must run after analysis and
/// again after every data bind.
pub fn sync_data_tokens(nodes: &[NodeInfo]) {
    for info in nodes {
        let mut i_value_server = 0;
        for edge in info.node.servers() {
            if !edge.value_carrying {
                continue;
            }
            let known = &nodes[info.server_infos[i_value_server]].node;
            if let Some(token) = known.data_token() {
                edge.server.set_data_token(token);
            }
            i_value_server += 1;
        }
    }
}
