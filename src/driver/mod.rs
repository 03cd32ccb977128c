//! The evaluation driver: graph preparation, data binding and scheduling.
//!
//! A driver is created once per fit session, then `get_value` is invoked
//! repeatedly by the outer minimizer. The CPU scheduler below walks the
//! ordered node list and recomputes the dirty subgraph; the heterogeneous
//! scheduler lives in the `hetero` submodule and is compiled with the `cuda`
//! feature.

#[cfg(feature = "cuda")]
mod hetero;

use std::io;
use std::sync::{Arc, Mutex};

use log::info;
use rustc_hash::FxHashMap;

use crate::bind::{self, Dataset};
use crate::buffer::BufferManager;
#[cfg(feature = "cuda")]
use crate::cuda;
use crate::data::{DataMap, DataSpan, SpanMut};
use crate::error::{EvalError, Result};
use crate::graph::{self, NodeInfo};
use crate::node::{Node, RealVar};

/// Where node kernels are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    Cpu,
    Cuda,
}

/// Evaluates the value of a computation graph's top node over a batch of
/// observations.
pub struct EvalDriver {
    top: Arc<dyn Node>,
    mode: EvalMode,
    nodes: Vec<NodeInfo>,
    data_map_cpu: DataMap,
    #[cfg(feature = "cuda")]
    data_map_cuda: DataMap,
    buffers: BufferManager,
    /// Owned storage backing the spans produced by the last bind.
    vector_buffers: Vec<Vec<f64>>,
    #[cfg(feature = "cuda")]
    cuda_env: Option<cuda::CudaEnv>,
    #[cfg(feature = "cuda")]
    device_dataset: Option<cuda::DeviceArray>,
    get_val_invocations: usize,
}

impl EvalDriver {
    /// Analyzes the graph below `top` and prepares the scheduling metadata.
    /// In CUDA mode this also creates the per-node streams and events.
    pub fn new(top: Arc<dyn Node>, mode: EvalMode) -> Result<Self> {
        #[cfg(not(feature = "cuda"))]
        if mode == EvalMode::Cuda {
            return Err(EvalError::UnsupportedMode(
                "CUDA mode requested but this build carries no device runtime".into(),
            ));
        }
        #[cfg(feature = "cuda")]
        if mode == EvalMode::Cuda && !cuda::has_cuda() {
            return Err(EvalError::UnsupportedMode(
                "CUDA mode requested but no CUDA device is available".into(),
            ));
        }

        log_architecture_info(mode);

        let nodes = graph::analyze(&top)?;

        let mut driver = EvalDriver {
            top,
            mode,
            nodes,
            data_map_cpu: DataMap::new(),
            #[cfg(feature = "cuda")]
            data_map_cuda: DataMap::new(),
            buffers: BufferManager::new(),
            vector_buffers: Vec::new(),
            #[cfg(feature = "cuda")]
            cuda_env: None,
            #[cfg(feature = "cuda")]
            device_dataset: None,
            get_val_invocations: 0,
        };
        driver.data_map_cpu.resize(driver.nodes.len());

        #[cfg(feature = "cuda")]
        if mode == EvalMode::Cuda {
            driver.init_cuda()?;
        }

        Ok(driver)
    }

    /// The node whose value the driver returns.
    pub fn top_node(&self) -> &Arc<dyn Node> {
        &self.top
    }

    pub fn mode(&self) -> EvalMode {
        self.mode
    }

    /// Number of `get_value` invocations so far.
    pub fn evaluations(&self) -> usize {
        self.get_val_invocations
    }

    /// Binds `data` to the graph leaves, going through the span-building
    /// helpers for range filtering, selector splitting and weight handling.
    pub fn bind_dataset(
        &mut self,
        data: &Dataset,
        range_name: Option<&str>,
        selector: Option<&str>,
        skip_zero_weights: bool,
        global_obs_from_data: bool,
    ) -> Result<()> {
        self.vector_buffers.clear();
        let spans = bind::data_spans(
            data,
            range_name,
            selector,
            skip_zero_weights,
            global_obs_from_data,
            &mut self.vector_buffers,
        )?;
        self.bind_spans(spans)
    }

    /// Binds a prebuilt name-to-span map. The spans must stay valid for the
    /// lifetime of the bind.
    pub fn bind_spans(&mut self, spans: FxHashMap<String, DataSpan>) -> Result<()> {
        self.data_map_cpu.resize(self.nodes.len());

        let mut total_size = 0;
        for i in 0..self.nodes.len() {
            self.nodes[i].buffer = None;
            let node = Arc::clone(&self.nodes[i].node);
            if let Some(span) = spans.get(node.name()) {
                node.set_data_token(i);
                self.data_map_cpu.set(node.as_ref(), *span);
                self.nodes[i].from_dataset = true;
                self.nodes[i].is_dirty = false;
                self.nodes[i].output_size = span.len();
                total_size += span.len();
            } else {
                self.nodes[i].from_dataset = false;
                self.nodes[i].is_dirty = true;
                self.nodes[i].output_size = 1;
                // The span table was cleared above, so every unbound node has
                // to republish on the next pass, variables included.
                self.nodes[i].last_reset_count = u64::MAX;
            }
        }

        graph::sync_data_tokens(&self.nodes);
        bind::determine_output_sizes(&mut self.nodes)?;

        for info in &mut self.nodes {
            // Dirty flags only drive the scalar path; batched nodes are
            // recomputed unconditionally. Disabling the scalar cache as well
            // makes some fits drastically slower for reasons that are not
            // understood yet. TODO: find out why and unify both paths.
            info.always_dirty = !info.is_scalar() && !info.from_dataset;
            if info.is_category && !info.from_dataset {
                return Err(EvalError::UnboundRequiredObservable(
                    info.node.name().to_string(),
                ));
            }
        }

        #[cfg(feature = "cuda")]
        if self.mode == EvalMode::Cuda {
            self.stage_device_data(total_size)?;
            bind::mark_gpu_nodes(&mut self.nodes);
        }
        #[cfg(not(feature = "cuda"))]
        let _ = total_size;

        Ok(())
    }

    /// Evaluates the top node once and returns its first value.
    pub fn get_value(&mut self) -> f64 {
        self.get_val_invocations += 1;

        #[cfg(feature = "cuda")]
        if self.mode == EvalMode::Cuda {
            return self.get_value_heterogeneous();
        }

        for i in 0..self.nodes.len() {
            if self.nodes[i].from_dataset {
                continue;
            }
            if self.nodes[i].is_variable {
                self.process_variable(i);
            } else if self.nodes[i].is_dirty || self.nodes[i].always_dirty {
                self.set_clients_dirty(i);
                self.compute_cpu_node(i);
                self.nodes[i].is_dirty = false;
            }
        }

        self.data_map_cpu.at(self.top.as_ref()).as_slice()[0]
    }

    /// Evaluates once and copies the top node's full output span to the host.
    pub fn get_values(&mut self) -> Vec<f64> {
        self.get_value();
        self.data_map_cpu.at(self.top.as_ref()).as_slice().to_vec()
    }

    /// All variables not bound to data, sorted by name for determinism.
    pub fn parameters(&self) -> Vec<Arc<dyn Node>> {
        let mut parameters: Vec<Arc<dyn Node>> = self
            .nodes
            .iter()
            .filter(|info| info.is_variable && !info.from_dataset)
            .map(|info| Arc::clone(&info.node))
            .collect();
        parameters.sort_by(|a, b| a.name().cmp(b.name()));
        parameters
    }

    /// Checks a variable's reset counter and recomputes it, flagging its
    /// clients dirty, when the value changed since the last pass. Kept as a
    /// named function so it shows up in performance profiles.
    fn process_variable(&mut self, i: usize) {
        let node = Arc::clone(&self.nodes[i].node);
        let var = node
            .as_ref()
            .as_any()
            .downcast_ref::<RealVar>()
            .expect("variable info without a RealVar node");
        if self.nodes[i].last_reset_count != var.reset_counter() {
            self.nodes[i].last_reset_count = var.reset_counter();
            self.set_clients_dirty(i);
            self.compute_cpu_node(i);
            self.nodes[i].is_dirty = false;
        }
    }

    /// Flags all clients of node `i` dirty. Kept as a named function so it
    /// shows up in performance profiles.
    fn set_clients_dirty(&mut self, i: usize) {
        for k in 0..self.nodes[i].client_infos.len() {
            let client = self.nodes[i].client_infos[k];
            self.nodes[client].is_dirty = true;
        }
    }

    /// Runs node `i`'s kernel on the host and publishes the result span.
    fn compute_cpu_node(&mut self, i: usize) {
        let node = Arc::clone(&self.nodes[i].node);
        let n_out = self.nodes[i].output_size;

        let out_ptr: *mut f64;
        if n_out == 1 {
            out_ptr = &mut self.nodes[i].scalar_slot;
            #[cfg(feature = "cuda")]
            if self.mode == EvalMode::Cuda {
                self.data_map_cuda
                    .set(node.as_ref(), DataSpan::new(out_ptr, 1));
            }
        } else {
            #[cfg(feature = "cuda")]
            if self.mode == EvalMode::Cuda && !self.nodes[i].logged_gpu_miss {
                info!(
                    "The argument {}::{} could not be evaluated on the GPU \
                     because the class doesn't support it.",
                    node.class_name(),
                    node.name()
                );
                self.nodes[i].logged_gpu_miss = true;
            }
            if self.nodes[i].buffer.is_none() {
                #[cfg(feature = "cuda")]
                let buffer = if self.nodes[i].copy_after_eval {
                    let stream = self.nodes[i]
                        .stream
                        .clone()
                        .expect("stream exists in CUDA mode");
                    self.buffers.make_pinned(n_out, stream)
                } else {
                    self.buffers.make_host(n_out)
                };
                #[cfg(not(feature = "cuda"))]
                let buffer = self.buffers.make_host(n_out);
                self.nodes[i].buffer = Some(buffer);
            }
            out_ptr = self.nodes[i]
                .buffer
                .as_mut()
                .expect("buffer just ensured")
                .cpu_write_ptr();
        }

        self.data_map_cpu
            .set(node.as_ref(), DataSpan::new(out_ptr, n_out));
        node.compute_batch(SpanMut::new(out_ptr, n_out), &self.data_map_cpu);

        #[cfg(feature = "cuda")]
        if self.nodes[i].copy_after_eval {
            let gpu_ptr = self.nodes[i]
                .buffer
                .as_ref()
                .expect("pinned buffer present")
                .gpu_read_ptr();
            self.data_map_cuda
                .set(node.as_ref(), DataSpan::new(gpu_ptr, n_out));
            if let (Some(event), Some(stream)) = (&self.nodes[i].event, &self.nodes[i].stream) {
                event.record(stream);
            }
        }
    }

    /// Renders the node table: one row per node in evaluation order.
    pub fn print(&self, out: &mut dyn io::Write) -> io::Result<()> {
        const WIDTHS: [usize; 6] = [9, 37, 20, 9, 10, 20];

        fn rule(out: &mut dyn io::Write) -> io::Result<()> {
            let total: usize = WIDTHS.iter().map(|w| w + 2).sum();
            writeln!(out, "{}|", "-".repeat(total))
        }

        fn row(out: &mut dyn io::Write, cells: &[String; 6]) -> io::Result<()> {
            write!(out, "|")?;
            for (cell, width) in cells.iter().zip(WIDTHS) {
                write!(out, " {cell:<width$}|")?;
            }
            writeln!(out)
        }

        rule(out)?;
        row(
            out,
            &[
                "Index".into(),
                "Name".into(),
                "Class".into(),
                "Size".into(),
                "FromData".into(),
                "FirstValue".into(),
            ],
        )?;
        rule(out)?;

        for info in &self.nodes {
            let first_value = self
                .data_map_cpu
                .get(info.node.as_ref())
                .filter(|span| !span.is_empty())
                .map(|span| span.as_slice()[0].to_string())
                .unwrap_or_else(|| "-".into());
            row(
                out,
                &[
                    info.token.to_string(),
                    info.node.name().to_string(),
                    info.node.class_name().to_string(),
                    info.output_size.to_string(),
                    info.from_dataset.to_string(),
                    first_value,
                ],
            )?;
            rule(out)?;
        }
        Ok(())
    }
}

impl Drop for EvalDriver {
    fn drop(&mut self) {
        for info in &self.nodes {
            info.node.reset_data_token();
        }
    }
}

/// Logs which compute library variant this build carries, at most once per
/// distinct mode.
fn log_architecture_info(mode: EvalMode) {
    static LAST_MODE: Mutex<Option<EvalMode>> = Mutex::new(None);
    let mut last = LAST_MODE.lock().expect("architecture log guard poisoned");
    if *last == Some(mode) {
        return;
    }
    *last = Some(mode);

    match cpu_architecture_name() {
        None => info!("using generic CPU library compiled with no vectorizations"),
        Some(arch) => info!("using CPU computation library compiled with -m{arch}"),
    }
    if mode == EvalMode::Cuda {
        info!("using CUDA computation library");
    }
}

fn cpu_architecture_name() -> Option<&'static str> {
    if cfg!(target_feature = "avx512f") {
        Some("avx512")
    } else if cfg!(target_feature = "avx2") {
        Some("avx2")
    } else if cfg!(target_feature = "avx") {
        Some("avx")
    } else if cfg!(target_feature = "sse4.1") {
        Some("sse4")
    } else {
        None
    }
}
