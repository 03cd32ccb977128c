//! Graph analysis: ordering, tokens, dependency records and placement.

mod common;

use std::sync::Arc;

use batchfit::bind::mark_gpu_nodes;
use batchfit::graph::{analyze, sorted_computation_graph};
use batchfit::{EvalError, Node, RealVar};

use common::{BinaryFn, RewirableFn, SumFn, UnaryFn};

fn token_of(nodes: &[batchfit::NodeInfo], name: &str) -> usize {
    nodes
        .iter()
        .position(|info| info.node.name() == name)
        .unwrap_or_else(|| panic!("node '{name}' not analyzed"))
}

#[test]
fn ordered_list_is_topological() {
    let x = RealVar::new("x", 1.0);
    let a = UnaryFn::exp("a", x.clone());
    let b = UnaryFn::log("b", x.clone());
    let top: Arc<dyn Node> = BinaryFn::add("c", a, b);

    let nodes = analyze(&top).unwrap();

    assert_eq!(nodes.len(), 4);
    assert_eq!(nodes.last().unwrap().node.name(), "c");
    for info in &nodes {
        for &server in &info.server_infos {
            assert!(server < info.token, "server listed after its client");
        }
    }
}

#[test]
fn reverse_edges_are_consistent_with_multiplicity() {
    let x = RealVar::new("x", 1.0);
    let a = UnaryFn::exp("a", x.clone());
    let top: Arc<dyn Node> = BinaryFn::add("dup", a.clone(), a);

    let nodes = analyze(&top).unwrap();
    let ia = token_of(&nodes, "a");
    let idup = token_of(&nodes, "dup");

    // The twice-listed server appears twice on both sides of the edge.
    assert_eq!(nodes[idup].server_infos, vec![ia, ia]);
    let dup_clients: Vec<_> = nodes[ia]
        .client_infos
        .iter()
        .filter(|&&client| client == idup)
        .collect();
    assert_eq!(dup_clients.len(), 2);

    for info in &nodes {
        for &server in &info.server_infos {
            let forward = info
                .server_infos
                .iter()
                .filter(|&&s| s == server)
                .count();
            let backward = nodes[server]
                .client_infos
                .iter()
                .filter(|&&c| c == info.token)
                .count();
            assert_eq!(forward, backward);
        }
    }
}

#[test]
fn aliased_duplicate_servers_share_one_token() {
    let v = RealVar::new("v", 3.0);
    let m1 = BinaryFn::mul("vsq", v.clone(), v.clone());
    let m2 = BinaryFn::mul("vsq", v.clone(), v.clone());
    let top: Arc<dyn Node> = BinaryFn::add("z", m1.clone(), m2.clone());

    let nodes = analyze(&top).unwrap();

    // One storage slot for both handles.
    assert_eq!(nodes.len(), 3);
    assert!(m1.data_token().is_some());
    assert_eq!(m1.data_token(), m2.data_token());

    // Distinct nodes keep distinct tokens.
    let mut tokens: Vec<_> = nodes.iter().map(|info| info.token).collect();
    tokens.dedup();
    assert_eq!(tokens.len(), nodes.len());
}

#[test]
fn variables_receive_no_token_through_the_node() {
    let x = RealVar::new("x", 1.0);
    let top: Arc<dyn Node> = UnaryFn::exp("f", x.clone());

    let nodes = analyze(&top).unwrap();

    assert_eq!(x.data_token(), None);
    assert_eq!(top.data_token(), Some(1));
    assert!(nodes[token_of(&nodes, "x")].is_variable);
}

#[test]
fn shape_only_edges_are_ignored() {
    let x = RealVar::new("x", 1.0);
    let y = RealVar::new("y", 2.0);
    let f = RewirableFn::new("f");
    f.add_server(x.clone());
    f.add_shape_server(y.clone());
    let top: Arc<dyn Node> = f;

    let nodes = analyze(&top).unwrap();

    assert_eq!(nodes.len(), 2);
    assert!(nodes.iter().all(|info| info.node.name() != "y"));
    assert_eq!(nodes[token_of(&nodes, "f")].server_infos.len(), 1);
}

#[test]
fn cyclic_graph_is_rejected() {
    let f = RewirableFn::new("f");
    let g = RewirableFn::new("g");
    f.add_server(g.clone());
    g.add_server(f.clone());
    let top: Arc<dyn Node> = f;

    let result = sorted_computation_graph(&top);
    assert!(matches!(result, Err(EvalError::GraphCycle(_))));
}

#[test]
fn self_cycle_is_rejected() {
    let f = RewirableFn::new("f");
    f.add_server(f.clone());
    let top: Arc<dyn Node> = f;

    assert!(matches!(
        analyze(&top),
        Err(EvalError::GraphCycle(name)) if name == "f"
    ));
}

#[test]
fn gpu_marking_leaves_pure_device_chains_unstaged() {
    // t = sum(a * w) with device-capable kernels: the product is consumed on
    // the GPU only, the reducer's scalar lands in the host slot.
    let a = RealVar::new("a", 0.0);
    let w = RealVar::new("w", 0.0);
    let prod = BinaryFn::new("prod", "MulFn", |x, y| x * y, a, w, true);
    let top: Arc<dyn Node> = SumFn::new("t", prod, true);

    let mut nodes = analyze(&top).unwrap();
    let idx_a = token_of(&nodes, "a");
    nodes[idx_a].output_size = 1024;
    let idx_w = token_of(&nodes, "w");
    nodes[idx_w].output_size = 1024;
    let idx_prod = token_of(&nodes, "prod");
    nodes[idx_prod].output_size = 1024;

    mark_gpu_nodes(&mut nodes);

    assert!(nodes[token_of(&nodes, "prod")].compute_in_gpu());
    assert!(nodes[token_of(&nodes, "t")].compute_in_gpu());
    assert!(!nodes[token_of(&nodes, "prod")].copy_after_eval);
    assert!(!nodes[token_of(&nodes, "t")].copy_after_eval);
}

#[test]
fn gpu_marking_stages_outputs_crossing_the_device_boundary() {
    // f1 = exp(a) runs on the device, f2 = log(f1) only on the host, so f1
    // must stage its output.
    let a = RealVar::new("a", 0.0);
    let f1 = UnaryFn::new("f1", "ExpFn", f64::exp, a, true);
    let f2 = UnaryFn::log("f2", f1);
    let top: Arc<dyn Node> = SumFn::new("t", f2, false);

    let mut nodes = analyze(&top).unwrap();
    for name in ["a", "f1", "f2"] {
        let token = token_of(&nodes, name);
        nodes[token].output_size = 64;
    }

    mark_gpu_nodes(&mut nodes);

    assert!(nodes[token_of(&nodes, "f1")].compute_in_gpu());
    assert!(!nodes[token_of(&nodes, "f2")].compute_in_gpu());
    assert!(nodes[token_of(&nodes, "f1")].copy_after_eval);
    assert!(!nodes[token_of(&nodes, "f2")].copy_after_eval);
    // The batched observable feeding a device node is itself staged data.
    assert!(nodes[token_of(&nodes, "a")].copy_after_eval);
}
