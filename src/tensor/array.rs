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

use ndarray::{Array, ArrayD, Axis, Dimension, ScalarOperand, Zip};
use num_traits::Float;

use super::SchedulerTensor;

/// Converts a scalar to the array element type, saturating values that do not fit.
fn elem<A: Float>(value: f64) -> A {
	A::from(value).unwrap_or_else(|| if value.is_sign_negative() { A::neg_infinity() } else { A::infinity() })
}

fn ensure_same_shape(lhs: &[usize], rhs: &[usize]) -> anyhow::Result<()> {
	if lhs != rhs {
		anyhow::bail!("shape mismatch: {lhs:?} vs {rhs:?}");
	}
	Ok(())
}

impl<A, D> SchedulerTensor for Array<A, D>
where
	A: Float + ScalarOperand,
	D: Dimension
{
	fn dims(&self) -> Vec<usize> {
		self.shape().to_vec()
	}

	fn zeros_like(&self) -> anyhow::Result<Self> {
		Ok(Array::zeros(self.raw_dim()))
	}

	fn affine(&self, mul: f64, add: f64) -> anyhow::Result<Self> {
		let (mul, add) = (elem::<A>(mul), elem::<A>(add));
		Ok(self.mapv(|v| v * mul + add))
	}

	fn add(&self, rhs: &Self) -> anyhow::Result<Self> {
		ensure_same_shape(self.shape(), rhs.shape())?;
		Ok(Zip::from(self).and(rhs).map_collect(|&a, &b| a + b))
	}

	fn sub(&self, rhs: &Self) -> anyhow::Result<Self> {
		ensure_same_shape(self.shape(), rhs.shape())?;
		Ok(Zip::from(self).and(rhs).map_collect(|&a, &b| a - b))
	}

	fn clip(&self, min: f64, max: f64) -> anyhow::Result<Self> {
		let (min, max) = (elem::<A>(min), elem::<A>(max));
		Ok(self.mapv(|v| v.max(min).min(max)))
	}

	fn batch_norm_mean(&self) -> anyhow::Result<f64> {
		let view = self.view().into_dyn();
		if view.ndim() == 0 {
			return Ok(view.iter().map(|v| v.abs().to_f64().unwrap_or(f64::NAN)).sum());
		}

		let batch_size = view.len_of(Axis(0));
		let norms: f64 = view
			.axis_iter(Axis(0))
			.map(|item| item.fold(A::zero(), |acc, &v| acc + v * v).sqrt().to_f64().unwrap_or(f64::NAN))
			.sum();
		Ok(norms / batch_size as f64)
	}

	fn to_host(&self) -> anyhow::Result<ArrayD<f64>> {
		Ok(self.mapv(|v| v.to_f64().unwrap_or(f64::NAN)).into_dyn())
	}

	fn from_host_like(array: &ArrayD<f64>, _: &Self) -> anyhow::Result<Self> {
		Ok(array.mapv(elem::<A>).into_dimensionality::<D>()?)
	}
}

#[cfg(test)]
mod tests {
	use ndarray::{array, Array2, Array4};
	use rand::{rngs::StdRng, SeedableRng};

	use super::*;

	#[test]
	fn test_linear_combination() {
		let a = array![[1.0_f64, 2.0], [3.0, 4.0]];
		let b = array![[0.5_f64, 0.5], [0.5, 0.5]];
		let out = Array2::linear_combination(&[(2.0, &a), (-4.0, &b)]).unwrap();
		assert_eq!(out, array![[0.0, 2.0], [4.0, 6.0]]);
	}

	#[test]
	fn test_clip_and_affine() {
		let a = array![-3.0_f32, -0.5, 0.25, 7.0];
		assert_eq!(a.clip(-1.0, 1.0).unwrap(), array![-1.0, -0.5, 0.25, 1.0]);
		assert_eq!(a.affine(2.0, 1.0).unwrap(), array![-5.0, 0.0, 1.5, 15.0]);
	}

	#[test]
	fn test_batch_norm_mean() {
		// per-item norms are 5 and 0
		let a = array![[3.0_f64, 4.0], [0.0, 0.0]];
		assert!((a.batch_norm_mean().unwrap() - 2.5).abs() < 1e-12);
	}

	#[test]
	fn test_shape_mismatch() {
		let a = Array2::<f32>::zeros((2, 3));
		let b = Array2::<f32>::zeros((3, 2));
		assert!(SchedulerTensor::add(&a, &b).is_err());
	}

	#[test]
	fn test_noise_is_precision_independent() {
		let a = Array4::<f32>::zeros((1, 2, 3, 3));
		let b = Array4::<f64>::zeros((1, 2, 3, 3));
		let noise_a = a.randn_like(&mut StdRng::seed_from_u64(42)).unwrap();
		let noise_b = b.randn_like(&mut StdRng::seed_from_u64(42)).unwrap();
		for (x, y) in noise_a.iter().zip(noise_b.iter()) {
			assert!((f64::from(*x) - y).abs() < 1e-6);
		}
	}
}
