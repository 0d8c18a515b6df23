#![allow(dead_code)]

use ndarray::Array4;
use ndarray_rand::{rand_distr::Uniform, RandomExt};
use pyke_schedulers::SchedulerTensor;
use rand::{rngs::StdRng, SeedableRng};

pub const SHAPE: (usize, usize, usize, usize) = (4, 3, 8, 8);

/// Uniform random sample in `[0, 1)`.
pub fn dummy_sample() -> Array4<f64> {
	Array4::random_using(SHAPE, Uniform::new(0.0, 1.0), &mut StdRng::seed_from_u64(0))
}

/// A deterministic ramp over `[0, 1)`, laid out channels-first then batch.
pub fn dummy_sample_deter() -> Array4<f64> {
	let (batch_size, num_channels, height, width) = SHAPE;
	let num_elems = (batch_size * num_channels * height * width) as f64;
	Array4::from_shape_fn(SHAPE, |(b, c, h, w)| ((c * height * width + h * width + w) * batch_size + b) as f64 / num_elems)
}

/// A toy noise model: `sample * t / (t + 1)`.
pub fn dummy_model<T: SchedulerTensor>(sample: &T, t: f64) -> anyhow::Result<T> {
	sample.scale(t / (t + 1.0))
}

pub fn abs_sum(sample: &Array4<f64>) -> f64 {
	sample.iter().map(|v| v.abs()).sum()
}

pub fn abs_mean(sample: &Array4<f64>) -> f64 {
	abs_sum(sample) / sample.len() as f64
}

pub fn abs_diff_sum(a: &Array4<f64>, b: &Array4<f64>) -> f64 {
	a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum()
}
