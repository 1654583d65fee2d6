//! Multi-device collective all-reduce engine.
//!
//! Given N devices (1..=8) each holding an equal-shaped tensor, `all_reduce`
//! computes the element-wise sum across all of them and delivers the
//! identical result to every device's output buffer.
//!
//! # Architecture
//!
//! - [`Signal`] — per-device counter tables implementing a lock-free
//!   cross-device barrier with an optional release/acquire fence, plus the
//!   scratch region used by the two-stage algorithm.
//! - [`can_enable_p2p`] — pairwise peer-access probing with idempotent
//!   enablement.
//! - Single-stage kernel — every rank reads all peers directly; latency
//!   optimal for small payloads.
//! - Two-stage kernel — reduce-scatter into peer-visible scratch, fenced
//!   barrier, all-gather; bandwidth optimal for large payloads.
//! - Staged-copy fallback — serial stage-and-accumulate when peer access is
//!   unavailable; also the correctness reference.
//! - [`all_reduce`] — validation, capability probing, and threshold-driven
//!   strategy selection.
//!
//! # Usage
//!
//! ```
//! use allreduce_core::{all_reduce, DeviceBuffer, DeviceMesh, Signal};
//!
//! let mesh = DeviceMesh::new(2);
//! let inputs: Vec<_> = (0..2)
//!     .map(|d| DeviceBuffer::from_slice(&mesh, d, &[1.0f32; 1024]).unwrap())
//!     .collect();
//! let mut outputs: Vec<_> = (0..2)
//!     .map(|d| DeviceBuffer::<f32>::zeros(&mesh, d, 1024).unwrap())
//!     .collect();
//! let signals: Vec<_> = (0..2).map(|_| Signal::new(0)).collect();
//!
//! all_reduce(&mesh, &inputs, &mut outputs, &signals, None).unwrap();
//! assert_eq!(outputs[0].to_vec(), vec![2.0; 1024]);
//! ```

mod config;
mod dispatch;
mod element;
mod error;
mod fallback;
mod p2p;
mod runtime;
mod signal;
mod single_stage;
mod tensor;
mod two_stage;

pub use config::{CollectiveConfig, Strategy, MAX_BLOCKS, MAX_DEVICES};
pub use dispatch::{all_reduce, all_reduce_with_config, select_strategy, Epilogue};
pub use element::{DType, Element, VECTOR_BYTES};
pub use error::{CollectiveError, Result};
pub use p2p::can_enable_p2p;
pub use runtime::{DeviceBuffer, DeviceMesh};
pub use signal::Signal;
pub use tensor::{all_reduce_tensors, buffer_from_tensor, dtype_from_candle, tensor_from_buffer};
