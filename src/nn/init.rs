//! Weight initialisation

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use crate::tensor::{Device, Shape, Tensor};

/// Deterministic RNG when a seed is given, entropy-seeded otherwise
pub fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Kaiming-normal initialisation in fan-out mode for a `[out, in]` weight.
///
/// Uses the ReLU gain, so `std = sqrt(2 / out)`.
pub fn kaiming_normal_fan_out(shape: Shape, device: Device, rng: &mut StdRng) -> Tensor {
    let fan_out = shape.rows().max(1) as f64;
    let std = (2.0 / fan_out).sqrt();
    let mut tensor = Tensor::zeros(shape, device);
    for v in tensor.as_slice_mut() {
        let z: f64 = StandardNormal.sample(rng);
        *v = z * std;
    }
    tensor
}
