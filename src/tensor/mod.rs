// Copyright 2022-2023 pyke.io
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// 	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The numeric backend schedulers are written against.
//!
//! Schedule tables (betas, cumulative alpha products, sigmas) are small and always live on the host as
//! [`ndarray::Array1`]; only the sample-sized math goes through [`SchedulerTensor`]. Plain [`ndarray`] arrays of any
//! float element type and dimensionality implement it, as does `candle_core::Tensor` with the `candle` feature.

use ndarray::{ArrayD, IxDyn};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::Rng;

mod array;
#[cfg(feature = "candle")]
mod candle;

/// Elementwise math needed to advance a diffusion sample.
///
/// Scalars are always passed as `f64` and converted to the backend's element type at the last moment, so a scheduler
/// computes its per-step coefficients once regardless of backend.
pub trait SchedulerTensor: Clone + Sized {
	/// The shape of this tensor.
	fn dims(&self) -> Vec<usize>;

	/// A tensor of zeros with the same shape, element type and device.
	fn zeros_like(&self) -> anyhow::Result<Self>;

	/// Computes `self * mul + add` elementwise.
	fn affine(&self, mul: f64, add: f64) -> anyhow::Result<Self>;

	/// Elementwise sum. Both tensors must have the same shape.
	fn add(&self, rhs: &Self) -> anyhow::Result<Self>;

	/// Elementwise difference. Both tensors must have the same shape.
	fn sub(&self, rhs: &Self) -> anyhow::Result<Self>;

	/// Clamps every element to `[min, max]`.
	fn clip(&self, min: f64, max: f64) -> anyhow::Result<Self>;

	/// Mean over the batch (first) axis of the L2 norm of each batch item.
	fn batch_norm_mean(&self) -> anyhow::Result<f64>;

	/// Copies this tensor to a host array of `f64`.
	fn to_host(&self) -> anyhow::Result<ArrayD<f64>>;

	/// Builds a tensor from a host array, with the element type and device of `like`.
	fn from_host_like(array: &ArrayD<f64>, like: &Self) -> anyhow::Result<Self>;

	/// Samples standard normal noise shaped like `self`.
	///
	/// Noise is always drawn on the host from the caller's RNG, so two backends seeded identically see the same noise.
	fn randn_like<R: Rng + ?Sized>(&self, rng: &mut R) -> anyhow::Result<Self> {
		let noise = ArrayD::<f64>::random_using(IxDyn(&self.dims()), StandardNormal, rng);
		Self::from_host_like(&noise, self)
	}

	/// Multiplies every element by `factor`.
	fn scale(&self, factor: f64) -> anyhow::Result<Self> {
		self.affine(factor, 0.0)
	}

	/// Computes `Σ weight_i * tensor_i`, accumulating left to right.
	fn linear_combination(terms: &[(f64, &Self)]) -> anyhow::Result<Self> {
		let ((weight, first), rest) = terms.split_first().ok_or_else(|| anyhow::anyhow!("linear combination of zero tensors"))?;
		let mut acc = first.scale(*weight)?;
		for (weight, tensor) in rest {
			acc = acc.add(&tensor.scale(*weight)?)?;
		}
		Ok(acc)
	}
}
