//! batchfit: a batch-mode evaluation engine for statistical computation
//! graphs.
//!
//! Given a DAG of mathematical nodes (variables, categorical selectors and
//! composite real-valued functions), the driver evaluates the value of a
//! designated top node over a batch of observations, dispatching each node's
//! kernel to the host CPU or, with the `cuda` feature, to a CUDA GPU under an
//! ahead-of-time device-placement policy. Between evaluations it recognises
//! which parameters changed and recomputes only the affected subgraph.
//!
//! # Example
//!
//! ```rust
//! use batchfit::{EvalDriver, EvalMode, RealVar};
//!
//! let x = RealVar::new("x", 2.0);
//! let mut driver = EvalDriver::new(x.clone(), EvalMode::Cpu).unwrap();
//!
//! assert_eq!(driver.get_value(), 2.0);
//!
//! x.set_value(3.5);
//! assert_eq!(driver.get_value(), 3.5);
//! ```

pub mod bind;
pub mod buffer;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod data;
pub mod driver;
pub mod error;
pub mod graph;
pub mod node;
pub mod wrapper;

pub use bind::Dataset;
pub use buffer::{BufferManager, ScratchBuffer};
pub use data::{DataMap, DataSpan, KernelConfig, SpanMut};
pub use driver::{EvalDriver, EvalMode};
pub use error::EvalError;
pub use graph::NodeInfo;
pub use node::{Category, Node, RealVar, ServerEdge, TokenCell};
pub use wrapper::DriverWrapper;
