//! proxy-anchor - Proxy Anchor losses for deep metric learning
//!
//! Features:
//! - Proxy Anchor loss with a fixed margin
//! - Adaptive and autoscaled variants with a learned per-class margin
//! - A variant whose margin is derived from embedding and proxy norms
//! - Pass-through adapters over an injected metric-learning library
//! - A compact reverse-mode autodiff tape so every loss is differentiable
//!   with respect to the embeddings and its own parameters
//!
//! ```no_run
//! use proxy_anchor::{AutogradEngine, MetricLoss, ProxyAnchorLoss, Tensor};
//!
//! let loss = ProxyAnchorLoss::new(3, 2, 0.1, 32.0)?;
//! let engine = AutogradEngine::new();
//! let embeddings = engine.variable(
//!     Tensor::from_rows(&[vec![1.0, 0.0], vec![0.0, 1.0], vec![-1.0, 0.5]])?,
//!     true,
//! );
//! let value = loss.forward(&embeddings, &[0, 1, 2])?;
//! let grads = value.backward()?;
//! let proxy_grad = loss.proxies().grad(&grads);
//! # Ok::<(), proxy_anchor::LossError>(())
//! ```

pub mod autograd;
pub mod config;
pub mod error;
pub mod nn;
pub mod tensor;
pub mod training;
pub mod verification;

pub use autograd::{AutogradEngine, Gradients, Variable};
pub use config::{ConfigBuilder, LossConfig, ProxyAnchorConfig};
pub use error::{LossError, LossResult};
pub use nn::{
    AdaptiveProxyAnchorLoss, AutoscaledProxyAnchorLoss, LossFactory, MetricLearningLibrary, MetricLoss, Module,
    NewtonProxyAnchorLoss, Parameter, ProxyAnchorLoss, StateDict,
};
pub use tensor::{Device, Shape, Tensor};
pub use training::{Checkpoint, CheckpointManager};

/// Install a `tracing` subscriber for the losses' logs.
///
/// Safe to call more than once; only the first call installs anything.
pub fn init() -> LossResult<()> {
    if tracing_subscriber::fmt().try_init().is_ok() {
        tracing::info!(version = version(), "proxy-anchor initialized");
    }
    Ok(())
}

/// Get the current crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
