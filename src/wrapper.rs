//! Facade presenting a whole driver as one composite real-valued node.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::bind::Dataset;
use crate::data::{DataMap, SpanMut};
use crate::driver::EvalDriver;
use crate::error::Result;
use crate::node::{Node, RealVar, ServerEdge, TokenCell};

static NEXT_WRAPPER_ID: AtomicUsize = AtomicUsize::new(0);

fn next_wrapper_name() -> String {
    format!(
        "driver_wrapper_{}",
        NEXT_WRAPPER_ID.fetch_add(1, Ordering::SeqCst)
    )
}

/// Wraps a driver as a single node suitable for an outer minimizer.
///
/// The wrapper can be cloned freely; all clones share the underlying driver.
/// Every instance carries its own node name (generated unless overridden
/// with [`with_name`](Self::with_name)), so wrappers sitting side by side
/// under a common parent are never deduplicated into one storage slot.
pub struct DriverWrapper {
    name: String,
    driver: Rc<RefCell<EvalDriver>>,
    range_name: Option<String>,
    selector: Option<String>,
    take_global_observables_from_data: bool,
    bound_globals: Rc<RefCell<Vec<(String, f64)>>>,
    token: TokenCell,
}

impl DriverWrapper {
    pub fn new(
        driver: EvalDriver,
        range_name: Option<&str>,
        selector: Option<&str>,
        take_global_observables_from_data: bool,
    ) -> Self {
        DriverWrapper {
            name: next_wrapper_name(),
            driver: Rc::new(RefCell::new(driver)),
            range_name: range_name.map(str::to_string),
            selector: selector.map(str::to_string),
            take_global_observables_from_data,
            bound_globals: Rc::new(RefCell::new(Vec::new())),
            token: TokenCell::default(),
        }
    }

    /// Replaces the generated node name.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Forwards the dataset to the driver with the configured range name,
    /// selector and flags.
    pub fn bind_data(&self, data: &Dataset) -> Result<()> {
        *self.bound_globals.borrow_mut() = data.global_observables().to_vec();
        self.driver.borrow_mut().bind_dataset(
            data,
            self.range_name.as_deref(),
            self.selector.as_deref(),
            true,
            self.take_global_observables_from_data,
        )
    }

    pub fn get_value(&self) -> f64 {
        self.driver.borrow_mut().get_value()
    }

    pub fn get_values(&self) -> Vec<f64> {
        self.driver.borrow_mut().get_values()
    }

    /// All fit parameters that are not observables, sorted by name. With
    /// global observables taken from data, the data-sourced snapshot stands
    /// in for same-named variables.
    pub fn parameters(&self, observables: &[&str]) -> Vec<Arc<dyn Node>> {
        let mut parameters: Vec<Arc<dyn Node>> = self
            .driver
            .borrow()
            .parameters()
            .into_iter()
            .filter(|parameter| !observables.contains(&parameter.name()))
            .collect();

        if self.take_global_observables_from_data {
            for (name, value) in self.bound_globals.borrow().iter() {
                let snapshot: Arc<dyn Node> = RealVar::new(name, *value);
                match parameters.iter_mut().find(|p| p.name() == name.as_str()) {
                    Some(slot) => *slot = snapshot,
                    None => parameters.push(snapshot),
                }
            }
            parameters.sort_by(|a, b| a.name().cmp(b.name()));
        }

        parameters
    }
}

impl Clone for DriverWrapper {
    /// Clones share the driver but receive a fresh node name and token, so a
    /// clone and its original stay distinct nodes to any analyzer that sees
    /// both.
    fn clone(&self) -> Self {
        DriverWrapper {
            name: next_wrapper_name(),
            driver: Rc::clone(&self.driver),
            range_name: self.range_name.clone(),
            selector: self.selector.clone(),
            take_global_observables_from_data: self.take_global_observables_from_data,
            bound_globals: Rc::clone(&self.bound_globals),
            token: TokenCell::default(),
        }
    }
}

impl Node for DriverWrapper {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &str {
        "DriverWrapper"
    }

    fn servers(&self) -> Vec<ServerEdge> {
        vec![ServerEdge::value(Arc::clone(
            self.driver.borrow().top_node(),
        ))]
    }

    fn compute_batch(&self, mut out: SpanMut, _data: &DataMap) {
        let value = self.driver.borrow_mut().get_value();
        if let Some(slot) = out.as_mut_slice().first_mut() {
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
