//! Dense 2-D tensors used by the autodiff tape and the losses
//!
//! Everything is row-major f64; column vectors are `[n, 1]`, row vectors
//! `[1, n]` and scalars `[1, 1]`, so broadcasting only ever has to consider
//! two axes.

pub mod core;
pub mod devices;

pub use self::core::{Shape, Tensor};
pub use devices::Device;
