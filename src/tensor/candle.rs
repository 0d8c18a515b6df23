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

use candle_core::{DType, Tensor};
use ndarray::{ArrayD, IxDyn};

use super::SchedulerTensor;

impl SchedulerTensor for Tensor {
	fn dims(&self) -> Vec<usize> {
		Tensor::dims(self).to_vec()
	}

	fn zeros_like(&self) -> anyhow::Result<Self> {
		Ok(Tensor::zeros_like(self)?)
	}

	fn affine(&self, mul: f64, add: f64) -> anyhow::Result<Self> {
		Ok(Tensor::affine(self, mul, add)?)
	}

	fn add(&self, rhs: &Self) -> anyhow::Result<Self> {
		Ok(Tensor::add(self, rhs)?)
	}

	fn sub(&self, rhs: &Self) -> anyhow::Result<Self> {
		Ok(Tensor::sub(self, rhs)?)
	}

	fn clip(&self, min: f64, max: f64) -> anyhow::Result<Self> {
		Ok(self.clamp(min, max)?)
	}

	fn batch_norm_mean(&self) -> anyhow::Result<f64> {
		let batch_size = Tensor::dims(self).first().copied().unwrap_or(1).max(1);
		let items = self.to_dtype(DType::F64)?.reshape((batch_size, self.elem_count() / batch_size))?;
		Ok(items.sqr()?.sum(1)?.sqrt()?.mean_all()?.to_scalar::<f64>()?)
	}

	fn to_host(&self) -> anyhow::Result<ArrayD<f64>> {
		let data = self.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
		Ok(ArrayD::from_shape_vec(IxDyn(Tensor::dims(self)), data)?)
	}

	fn from_host_like(array: &ArrayD<f64>, like: &Self) -> anyhow::Result<Self> {
		let data: Vec<f64> = array.iter().copied().collect();
		Ok(Tensor::from_vec(data, array.shape(), like.device())?.to_dtype(like.dtype())?)
	}
}

#[cfg(test)]
mod tests {
	use candle_core::Device;
	use ndarray::Array4;

	use super::*;

	#[test]
	fn test_host_round_trip_keeps_layout() {
		let host = Array4::from_shape_fn((2, 3, 2, 2), |(b, c, h, w)| (b * 12 + c * 4 + h * 2 + w) as f64).into_dyn();
		let like = Tensor::zeros((1,), DType::F32, &Device::Cpu).unwrap();
		let tensor = Tensor::from_host_like(&host, &like).unwrap();
		assert_eq!(tensor.dtype(), DType::F32);
		assert_eq!(SchedulerTensor::dims(&tensor), vec![2, 3, 2, 2]);
		assert_eq!(tensor.to_host().unwrap(), host);
	}

	#[test]
	fn test_clip_keeps_dtype() {
		let tensor = Tensor::new(&[-2.0_f32, 0.5, 3.0], &Device::Cpu).unwrap();
		let clipped = SchedulerTensor::clip(&tensor, -1.0, 1.0).unwrap();
		assert_eq!(clipped.dtype(), DType::F32);
		assert_eq!(clipped.to_vec1::<f32>().unwrap(), vec![-1.0, 0.5, 1.0]);
	}
}
