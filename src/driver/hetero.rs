//! The heterogeneous scheduler: dependency-driven mixed CPU/GPU evaluation.
//!
//! `rem_servers` doubles as the per-node state machine: `-2` fully
//! evaluated, `-1` in flight on the GPU, `>= 0` still waiting for that many
//! servers. Cross-device reads are staged through pinned buffers by the
//! producer, never by a client.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::cuda;
use crate::data::{DataSpan, KernelConfig, SpanMut};
use crate::error::Result;

use super::EvalDriver;

impl EvalDriver {
    /// Creates the CUDA environment plus one stream and one event per node,
    /// and registers each node's stream in the device data map.
    pub(super) fn init_cuda(&mut self) -> Result<()> {
        let env = cuda::CudaEnv::new()?;

        self.data_map_cuda.resize(self.nodes.len());
        self.buffers.set_alloc_stream(env.default_stream());

        for info in &mut self.nodes {
            let stream = env.new_stream();
            let mut cfg = KernelConfig::default();
            cfg.set_stream(Arc::clone(&stream));
            self.data_map_cuda.set_config(info.node.as_ref(), cfg);
            info.stream = Some(stream);
            info.event = Some(env.new_event());
        }

        self.cuda_env = Some(env);
        Ok(())
    }

    /// Copies all batched bound columns into one contiguous device array and
    /// publishes the device-side spans. Scalar observables are aliased from
    /// the host map.
    pub(super) fn stage_device_data(&mut self, total_size: usize) -> Result<()> {
        let env = self
            .cuda_env
            .as_ref()
            .expect("CUDA environment exists in CUDA mode");
        let stream = env.default_stream();

        let mut device_data = cuda::DeviceArray::zeros(&stream, total_size.max(1));
        let mut idx = 0;
        for i in 0..self.nodes.len() {
            if !self.nodes[i].from_dataset {
                continue;
            }
            let node = Arc::clone(&self.nodes[i].node);
            let size = self.nodes[i].output_size;
            let span = self.data_map_cpu.at(node.as_ref());
            if size == 1 {
                self.data_map_cuda.set(node.as_ref(), span);
            } else {
                device_data.copy_from_host(idx, span.as_slice());
                self.data_map_cuda
                    .set(node.as_ref(), DataSpan::new(device_data.ptr_at(idx), size));
                idx += size;
            }
        }
        self.device_dataset = Some(device_data);
        Ok(())
    }

    pub(super) fn get_value_heterogeneous(&mut self) -> f64 {
        for info in &mut self.nodes {
            info.rem_clients = info.client_infos.len() as i32;
            info.rem_servers = info.server_infos.len() as i32;
            info.buffer = None;
        }

        // Leaves placed on the GPU can start right away.
        for i in 0..self.nodes.len() {
            if self.nodes[i].rem_servers == 0 && self.nodes[i].compute_in_gpu() {
                self.assign_to_gpu(i);
            }
        }

        let top = self.nodes.len() - 1;
        while self.nodes[top].rem_servers != -2 {
            // Finalize GPU nodes whose stream has drained.
            for i in 0..self.nodes.len() {
                if self.nodes[i].rem_servers == -1 {
                    let idle = !self.nodes[i]
                        .stream
                        .as_ref()
                        .expect("stream exists in CUDA mode")
                        .is_active();
                    if idle {
                        self.nodes[i].rem_servers = -2;
                        self.update_dependents(i);
                    }
                }
            }

            // Pick the first ready CPU node; with none ready, back off
            // instead of spinning.
            let next = (0..self.nodes.len())
                .find(|&i| self.nodes[i].rem_servers == 0 && !self.nodes[i].compute_in_gpu());
            let Some(i) = next else {
                thread::sleep(Duration::from_millis(1));
                continue;
            };

            self.nodes[i].rem_servers = -2;
            if !self.nodes[i].from_dataset {
                self.compute_cpu_node(i);
            }
            self.update_dependents(i);
        }

        self.data_map_cpu.at(self.top.as_ref()).as_slice()[0]
    }

    /// Propagates completion of node `i`: every client loses one pending
    /// server (and is launched once GPU-ready), every server loses one
    /// pending client (and its scratch is released with the last one).
    fn update_dependents(&mut self, i: usize) {
        for k in 0..self.nodes[i].client_infos.len() {
            let client = self.nodes[i].client_infos[k];
            self.nodes[client].rem_servers -= 1;
            if self.nodes[client].rem_servers == 0 && self.nodes[client].compute_in_gpu() {
                self.assign_to_gpu(client);
            }
        }
        for k in 0..self.nodes[i].server_infos.len() {
            let server = self.nodes[i].server_infos[k];
            self.nodes[server].rem_clients -= 1;
            if self.nodes[server].rem_clients == 0 {
                self.nodes[server].buffer = None;
            }
        }
    }

    /// Launches node `i` on its stream: synchronises on the servers' events,
    /// allocates the output, runs the kernel and records this node's event.
    fn assign_to_gpu(&mut self, i: usize) {
        let node = Arc::clone(&self.nodes[i].node);
        self.nodes[i].rem_servers = -1;

        let stream = self.nodes[i]
            .stream
            .clone()
            .expect("stream exists in CUDA mode");
        for k in 0..self.nodes[i].server_infos.len() {
            let server = self.nodes[i].server_infos[k];
            if let Some(event) = &self.nodes[server].event {
                stream.wait_event(event);
            }
        }

        let n_out = self.nodes[i].output_size;
        let out_ptr: *mut f64;
        if n_out == 1 {
            out_ptr = &mut self.nodes[i].scalar_slot;
            self.data_map_cpu
                .set(node.as_ref(), DataSpan::new(out_ptr, 1));
        } else {
            let buffer = if self.nodes[i].copy_after_eval {
                self.buffers.make_pinned(n_out, Arc::clone(&stream))
            } else {
                self.buffers.make_device(n_out)
            };
            self.nodes[i].buffer = Some(buffer);
            out_ptr = self.nodes[i]
                .buffer
                .as_mut()
                .expect("buffer just set")
                .gpu_write_ptr();
        }

        self.data_map_cuda
            .set(node.as_ref(), DataSpan::new(out_ptr, n_out));
        node.compute_batch(SpanMut::new(out_ptr, n_out), &self.data_map_cuda);
        self.nodes[i]
            .event
            .as_ref()
            .expect("event exists in CUDA mode")
            .record(&stream);

        if self.nodes[i].copy_after_eval {
            let cpu_ptr = self.nodes[i]
                .buffer
                .as_ref()
                .expect("pinned buffer present")
                .cpu_read_ptr();
            self.data_map_cpu
                .set(node.as_ref(), DataSpan::new(cpu_ptr, n_out));
        }
    }
}
