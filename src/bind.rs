//! Data binding: observation columns, row filtering and output widths.

use rustc_hash::FxHashMap;

use crate::data::DataSpan;
use crate::error::{EvalError, Result};
use crate::graph::NodeInfo;

/// An in-memory batch of observations.
///
/// Columns are bound to graph leaves by name. The optional weight column is
/// published under the name `weight`, a category column can serve as the row
/// selector, and named ranges give per-column row filters.
#[derive(Debug, Default)]
pub struct Dataset {
    columns: Vec<(String, Vec<f64>)>,
    weights: Option<Vec<f64>>,
    category: Option<(String, Vec<String>)>,
    ranges: FxHashMap<String, Vec<RangeCut>>,
    global_observables: Vec<(String, f64)>,
}

#[derive(Debug)]
struct RangeCut {
    column: String,
    lo: f64,
    hi: f64,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column(mut self, name: &str, values: Vec<f64>) -> Self {
        if let Some(n) = self.row_count() {
            assert_eq!(values.len(), n, "column '{}' length differs", name);
        }
        self.columns.push((name.to_string(), values));
        self
    }

    pub fn with_weights(mut self, weights: Vec<f64>) -> Self {
        if let Some(n) = self.row_count() {
            assert_eq!(weights.len(), n, "weight column length differs");
        }
        self.weights = Some(weights);
        self
    }

    /// Attaches a per-row category column usable as the bind selector.
    pub fn with_category(mut self, name: &str, labels: Vec<String>) -> Self {
        if let Some(n) = self.row_count() {
            assert_eq!(labels.len(), n, "category column length differs");
        }
        self.category = Some((name.to_string(), labels));
        self
    }

    /// Adds a `[lo, hi]` cut on `column` to the named range.
    pub fn with_range(mut self, range: &str, column: &str, lo: f64, hi: f64) -> Self {
        assert!(
            self.columns.iter().any(|(name, _)| name.as_str() == column),
            "range cut references unknown column '{}'",
            column
        );
        self.ranges
            .entry(range.to_string())
            .or_default()
            .push(RangeCut {
                column: column.to_string(),
                lo,
                hi,
            });
        self
    }

    pub fn with_global_observable(mut self, name: &str, value: f64) -> Self {
        self.global_observables.push((name.to_string(), value));
        self
    }

    pub fn len(&self) -> usize {
        self.row_count().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn global_observables(&self) -> &[(String, f64)] {
        &self.global_observables
    }

    fn row_count(&self) -> Option<usize> {
        self.columns
            .first()
            .map(|(_, values)| values.len())
            .or_else(|| self.weights.as_ref().map(Vec::len))
    }

    fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|(col, _)| col.as_str() == name)
            .map(|(_, values)| values.as_slice())
    }
}

/// Builds the name-to-span map for a bind from `data`.
///
/// Filtered rows are compacted into `buffers`, which the caller must keep
/// alive for as long as the returned spans are in use. With a selector, every
/// column is additionally published per category label as `<label>/<column>`.
pub fn data_spans(
    data: &Dataset,
    range_name: Option<&str>,
    selector: Option<&str>,
    skip_zero_weights: bool,
    global_obs_from_data: bool,
    buffers: &mut Vec<Vec<f64>>,
) -> Result<FxHashMap<String, DataSpan>> {
    let n = data.len();
    let mut keep = vec![true; n];

    if let Some(range) = range_name {
        if let Some(cuts) = data.ranges.get(range) {
            for cut in cuts {
                let values = data
                    .column(&cut.column)
                    .expect("range cut references a known column");
                for (row, &value) in values.iter().enumerate() {
                    if value < cut.lo || value > cut.hi {
                        keep[row] = false;
                    }
                }
            }
        }
    }

    if skip_zero_weights {
        if let Some(weights) = &data.weights {
            for (row, &weight) in weights.iter().enumerate() {
                if weight == 0.0 {
                    keep[row] = false;
                }
            }
        }
    }

    let mut spans = FxHashMap::default();

    for (name, values) in &data.columns {
        push_span(buffers, &mut spans, name.clone(), masked(values, &keep));
    }
    if let Some(weights) = &data.weights {
        push_span(buffers, &mut spans, "weight".into(), masked(weights, &keep));
    }

    if let Some(selector) = selector {
        let (_, labels) = data
            .category
            .as_ref()
            .filter(|(name, _)| name.as_str() == selector)
            .ok_or_else(|| EvalError::UnboundRequiredObservable(selector.to_string()))?;

        let mut seen = Vec::new();
        for label in labels {
            if !seen.contains(label) {
                seen.push(label.clone());
            }
        }
        for label in &seen {
            let submask: Vec<bool> = keep
                .iter()
                .zip(labels)
                .map(|(&kept, row_label)| kept && row_label == label)
                .collect();
            for (name, values) in &data.columns {
                push_span(
                    buffers,
                    &mut spans,
                    format!("{label}/{name}"),
                    masked(values, &submask),
                );
            }
            if let Some(weights) = &data.weights {
                push_span(
                    buffers,
                    &mut spans,
                    format!("{label}/weight"),
                    masked(weights, &submask),
                );
            }
        }
    }

    if global_obs_from_data {
        for (name, value) in &data.global_observables {
            push_span(buffers, &mut spans, name.clone(), vec![*value]);
        }
    }

    Ok(spans)
}

fn masked(values: &[f64], keep: &[bool]) -> Vec<f64> {
    values
        .iter()
        .zip(keep)
        .filter(|(_, &kept)| kept)
        .map(|(&value, _)| value)
        .collect()
}

fn push_span(
    buffers: &mut Vec<Vec<f64>>,
    spans: &mut FxHashMap<String, DataSpan>,
    name: String,
    values: Vec<f64>,
) {
    buffers.push(values);
    let stored = buffers.last().expect("just pushed");
    spans.insert(name, DataSpan::from_slice(stored));
}

/// Computes every node's output width by upward propagation: bound leaves
/// keep their span length, reducers collapse to a scalar, and any other node
/// broadcasts to the widest of its value servers.
pub fn determine_output_sizes(nodes: &mut [NodeInfo]) -> Result<()> {
    for i in 0..nodes.len() {
        if nodes[i].from_dataset {
            continue;
        }
        let mut size = 1;
        for k in 0..nodes[i].server_infos.len() {
            let server_size = nodes[nodes[i].server_infos[k]].output_size;
            if server_size > 1 && size > 1 && server_size != size {
                return Err(EvalError::ShapeMismatch {
                    node: nodes[i].node.name().to_string(),
                    left: size,
                    right: server_size,
                });
            }
            size = size.max(server_size);
        }
        if nodes[i].node.is_reducer() {
            size = 1;
        }
        nodes[i].output_size = size;
    }
    Ok(())
}

/// Device-placement pre-pass: a batched node whose output is read on the
/// opposite device at least once must stage its result in pinned memory.
pub fn mark_gpu_nodes(nodes: &mut [NodeInfo]) {
    for i in 0..nodes.len() {
        let copy_after_eval = {
            let info = &nodes[i];
            !info.is_scalar() && {
                let device = info.compute_in_gpu();
                info.client_infos
                    .iter()
                    .any(|&client| nodes[client].compute_in_gpu() != device)
            }
        };
        nodes[i].copy_after_eval = copy_after_eval;
    }
}
