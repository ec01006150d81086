//! Pass-through wrappers over an injected metric-learning library
//!
//! The library is any implementation of [`MetricLearningLibrary`]. Each
//! adapter asks it once, at construction, for a loss (and for some a miner)
//! with fixed hyperparameters, and on every call forwards the batch through
//! the miner and then the loss. The library's result is returned unchanged.

use crate::{
    autograd::Variable,
    error::{LossError, LossResult},
    nn::parameter::{Module, Parameter},
};

use super::MetricLoss;

/// Index tuples chosen by a miner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MinedTuples {
    /// Positive pairs `(anchor_pos[j], positive[j])` and negative pairs
    /// `(anchor_neg[j], negative[j])`
    Pairs {
        anchor_pos: Vec<usize>,
        positive: Vec<usize>,
        anchor_neg: Vec<usize>,
        negative: Vec<usize>,
    },
    /// Triplets `(anchor[j], positive[j], negative[j])`
    Triplets {
        anchor: Vec<usize>,
        positive: Vec<usize>,
        negative: Vec<usize>,
    },
}

impl MinedTuples {
    /// Number of mined pairs or triplets
    pub fn len(&self) -> usize {
        match self {
            MinedTuples::Pairs {
                anchor_pos, anchor_neg, ..
            } => anchor_pos.len() + anchor_neg.len(),
            MinedTuples::Triplets { anchor, .. } => anchor.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A loss the library is asked to build
#[derive(Debug, Clone, PartialEq)]
pub enum LossSpec {
    ProxyNca {
        num_classes: usize,
        embedding_size: usize,
        softmax_scale: f64,
    },
    MultiSimilarity {
        scale_pos: f64,
        scale_neg: f64,
        thresh: f64,
    },
    Contrastive {
        neg_margin: f64,
    },
    TripletMargin {
        margin: f64,
    },
    NPairs {
        l2_reg_weight: f64,
        normalize_embeddings: bool,
    },
}

/// A miner the library is asked to build
#[derive(Debug, Clone, PartialEq)]
pub enum MinerSpec {
    MultiSimilarity { epsilon: f64 },
    /// Triplets whose negative lies within `margin` but farther than the positive
    SemihardTriplet { margin: f64 },
}

/// Selects informative tuples from a batch
pub trait PairMiner: Send + Sync {
    fn mine(&self, embeddings: &Variable, labels: &[usize]) -> LossResult<MinedTuples>;
}

/// A standard loss implemented by the library
pub trait ReferenceLoss: Send + Sync {
    /// Scalar loss, restricted to `tuples` when a miner supplied them
    fn compute(&self, embeddings: &Variable, labels: &[usize], tuples: Option<&MinedTuples>) -> LossResult<Variable>;

    /// Trainable state owned by the loss, e.g. Proxy-NCA proxies
    fn parameters(&self) -> Vec<&Parameter> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        Vec::new()
    }
}

/// Factory for the library's losses and miners
pub trait MetricLearningLibrary: Send + Sync {
    fn loss(&self, spec: &LossSpec) -> LossResult<Box<dyn ReferenceLoss>>;

    fn miner(&self, spec: &MinerSpec) -> LossResult<Box<dyn PairMiner>>;
}

/// Miner followed by loss, as built by the library
struct Delegate {
    miner: Option<Box<dyn PairMiner>>,
    loss: Box<dyn ReferenceLoss>,
}

impl Delegate {
    fn build(library: &dyn MetricLearningLibrary, loss: LossSpec, miner: Option<MinerSpec>) -> LossResult<Self> {
        tracing::debug!(?loss, ?miner, "building library loss");
        let miner = miner.map(|spec| library.miner(&spec)).transpose()?;
        Ok(Self {
            miner,
            loss: library.loss(&loss)?,
        })
    }

    fn forward(&self, embeddings: &Variable, labels: &[usize], name: &str) -> LossResult<Variable> {
        if labels.len() != embeddings.shape().rows() {
            return Err(LossError::shape_error(
                &format!("{} labels", embeddings.shape().rows()),
                &format!("{} labels", labels.len()),
                Some("pass exactly one label per embedding row"),
            ));
        }
        let tuples = self
            .miner
            .as_ref()
            .map(|miner| miner.mine(embeddings, labels))
            .transpose()?;
        if let Some(tuples) = &tuples {
            tracing::debug!(loss = name, mined = tuples.len(), "mined tuples");
        }
        self.loss.compute(embeddings, labels, tuples.as_ref())
    }
}

macro_rules! library_loss {
    ($(#[$meta:meta])* $name:ident, $loss_name:literal) => {
        $(#[$meta])*
        pub struct $name {
            delegate: Delegate,
        }

        impl Module for $name {
            fn parameters(&self) -> Vec<&Parameter> {
                self.delegate.loss.parameters()
            }

            fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
                self.delegate.loss.parameters_mut()
            }
        }

        impl MetricLoss for $name {
            fn forward(&self, embeddings: &Variable, labels: &[usize]) -> LossResult<Variable> {
                self.delegate.forward(embeddings, labels, $loss_name)
            }

            fn name(&self) -> &'static str {
                $loss_name
            }
        }
    };
}

library_loss!(
    /// Proxy-NCA with learned proxies owned by the library loss
    ProxyNcaLoss,
    "proxy_nca"
);

impl ProxyNcaLoss {
    pub fn new(
        library: &dyn MetricLearningLibrary,
        num_classes: usize,
        embedding_dim: usize,
        softmax_scale: f64,
    ) -> LossResult<Self> {
        let spec = LossSpec::ProxyNca {
            num_classes,
            embedding_size: embedding_dim,
            softmax_scale,
        };
        Ok(Self {
            delegate: Delegate::build(library, spec, None)?,
        })
    }
}

library_loss!(
    /// Multi-Similarity loss over pairs from a Multi-Similarity miner
    MultiSimilarityLoss,
    "multi_similarity"
);

impl MultiSimilarityLoss {
    pub const EPSILON: f64 = 0.1;
    pub const SCALE_POS: f64 = 2.0;
    pub const SCALE_NEG: f64 = 50.0;
    pub const THRESH: f64 = 0.5;

    pub fn new(library: &dyn MetricLearningLibrary) -> LossResult<Self> {
        let loss = LossSpec::MultiSimilarity {
            scale_pos: Self::SCALE_POS,
            scale_neg: Self::SCALE_NEG,
            thresh: Self::THRESH,
        };
        let miner = MinerSpec::MultiSimilarity { epsilon: Self::EPSILON };
        Ok(Self {
            delegate: Delegate::build(library, loss, Some(miner))?,
        })
    }
}

library_loss!(
    /// Contrastive loss on all pairs of the batch
    ContrastiveLoss,
    "contrastive"
);

impl ContrastiveLoss {
    pub fn new(library: &dyn MetricLearningLibrary, neg_margin: f64) -> LossResult<Self> {
        Ok(Self {
            delegate: Delegate::build(library, LossSpec::Contrastive { neg_margin }, None)?,
        })
    }
}

library_loss!(
    /// Triplet-margin loss over semihard triplets
    TripletLoss,
    "triplet"
);

impl TripletLoss {
    pub fn new(library: &dyn MetricLearningLibrary, margin: f64) -> LossResult<Self> {
        let miner = MinerSpec::SemihardTriplet { margin };
        Ok(Self {
            delegate: Delegate::build(library, LossSpec::TripletMargin { margin }, Some(miner))?,
        })
    }
}

library_loss!(
    /// N-pairs loss on unnormalised embeddings
    NPairLoss,
    "n_pair"
);

impl NPairLoss {
    pub fn new(library: &dyn MetricLearningLibrary, l2_reg_weight: f64) -> LossResult<Self> {
        let spec = LossSpec::NPairs {
            l2_reg_weight,
            normalize_embeddings: false,
        };
        Ok(Self {
            delegate: Delegate::build(library, spec, None)?,
        })
    }
}
