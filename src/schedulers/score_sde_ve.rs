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

use ndarray::{Array1, ArrayView1};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{DiffusionScheduler, SchedulerStepOutput};
use crate::{ConfigMixin, SchedulerError, SchedulerTensor};

/// Configuration for the [`ScoreSdeVeScheduler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreSdeVeSchedulerConfig {
	/// Number of diffusion steps used to train the model.
	pub num_train_timesteps: usize,
	/// Coefficient weighting the step from the model output to the sample in the corrector.
	pub snr: f64,
	/// Smallest sigma of the schedule; should be close to the noise scale of the data.
	pub sigma_min: f64,
	/// Largest sigma of the schedule; the initial sample is standard normal noise scaled by it.
	pub sigma_max: f64,
	/// The end value of the continuous timesteps, where sampling stops. Timesteps go from `1` down to this value.
	pub sampling_eps: f64,
	/// Number of corrector iterations to run after each predictor step.
	pub correct_steps: usize
}

impl Default for ScoreSdeVeSchedulerConfig {
	fn default() -> Self {
		Self {
			num_train_timesteps: 2000,
			snr: 0.15,
			sigma_min: 0.01,
			sigma_max: 1348.0,
			sampling_eps: 1e-5,
			correct_steps: 1
		}
	}
}

impl ScoreSdeVeSchedulerConfig {
	fn validate(&self) -> anyhow::Result<()> {
		if self.num_train_timesteps == 0 {
			anyhow::bail!(SchedulerError::invalid_config("num_train_timesteps must be >0"));
		}
		if !(self.sigma_min.is_normal() && self.sigma_max.is_finite() && 0.0 < self.sigma_min && self.sigma_min < self.sigma_max) {
			anyhow::bail!(SchedulerError::invalid_config(format!(
				"sigma_min ({}) and sigma_max ({}) must satisfy 0 < sigma_min < sigma_max",
				self.sigma_min, self.sigma_max
			)));
		}
		if !(self.snr.is_finite() && self.snr > 0.0) {
			anyhow::bail!(SchedulerError::invalid_config(format!("snr ({}) must be >0", self.snr)));
		}
		if !(self.sampling_eps > 0.0 && self.sampling_eps <= 1.0) {
			anyhow::bail!(SchedulerError::invalid_config(format!("sampling_eps ({}) must be in (0, 1]", self.sampling_eps)));
		}
		Ok(())
	}
}

/// The variance exploding stochastic differential equation (VE-SDE) scheduler from
/// [Score-Based Generative Modeling through Stochastic Differential Equations][sde].
///
/// Sampling alternates Langevin corrector steps ([`ScoreSdeVeScheduler::step_correct`], run
/// [`ScoreSdeVeScheduler::correct_steps`] times) with a reverse diffusion predictor step
/// ([`ScoreSdeVeScheduler::step_pred`]) for every continuous timestep. The model is evaluated on the sigma of the
/// current step:
/// ```ignore
/// scheduler.set_timesteps(num_inference_steps)?;
/// scheduler.set_sigmas(num_inference_steps)?;
/// for (i, t) in scheduler.timesteps().to_owned().into_iter().enumerate() {
/// 	let sigma = scheduler.sigmas()[i];
/// 	for _ in 0..scheduler.correct_steps() {
/// 		sample = scheduler.step_correct(&model(&sample, sigma)?, &sample, &mut rng)?;
/// 	}
/// 	let (prev, mean) = scheduler.step_pred(&model(&sample, sigma)?, t, &sample, &mut rng)?.into_parts();
/// 	(sample, sample_mean) = (prev, mean);
/// }
/// ```
///
/// The mean of the last predictor step is the final, noiseless sample.
///
/// [sde]: https://arxiv.org/abs/2011.13456
#[derive(Debug, Clone)]
pub struct ScoreSdeVeScheduler {
	timesteps: Array1<f64>,
	sigmas: Array1<f64>,
	discrete_sigmas: Array1<f64>,
	config: ScoreSdeVeSchedulerConfig
}

impl ScoreSdeVeScheduler {
	/// Creates a new instance of the scheduler. No timesteps or sigmas are set.
	///
	/// # Errors
	/// Fails with [`SchedulerError::InvalidConfig`] if:
	/// - `num_train_timesteps` is 0
	/// - `sigma_min` is not positive or not smaller than `sigma_max`
	/// - `snr` is not positive
	/// - `sampling_eps` is not in `(0, 1]`
	pub fn new(config: &ScoreSdeVeSchedulerConfig) -> anyhow::Result<Self> {
		config.validate()?;
		Ok(Self {
			timesteps: Array1::zeros(0),
			sigmas: Array1::zeros(0),
			discrete_sigmas: Array1::zeros(0),
			config: config.clone()
		})
	}

	/// The number of corrector iterations to run, each with a fresh model evaluation, before every predictor step.
	pub fn correct_steps(&self) -> usize {
		self.config.correct_steps
	}

	/// Sets the continuous timesteps used for the diffusion chain: `num_inference_steps` evenly spaced values from `1`
	/// down to `sampling_eps`.
	pub fn set_timesteps(&mut self, num_inference_steps: usize) -> anyhow::Result<()> {
		if num_inference_steps == 0 {
			anyhow::bail!(SchedulerError::invalid_config("num_inference_steps must be >0"));
		}
		self.timesteps = Array1::linspace(1.0, self.config.sampling_eps, num_inference_steps);
		tracing::debug!(num_inference_steps, "set score sde timesteps");
		Ok(())
	}

	/// Sets the noise scales used for the diffusion chain, setting the timesteps first if they are not set yet.
	///
	/// `discrete_sigmas` are `num_inference_steps` geometrically spaced values from `sigma_min` up to `sigma_max`; the
	/// sigma matching each continuous timestep `t` is `sigma_min * (sigma_max / sigma_min)^t`.
	pub fn set_sigmas(&mut self, num_inference_steps: usize) -> anyhow::Result<()> {
		if self.timesteps.is_empty() {
			self.set_timesteps(num_inference_steps)?;
		}
		if num_inference_steps == 0 {
			anyhow::bail!(SchedulerError::invalid_config("num_inference_steps must be >0"));
		}

		let (sigma_min, sigma_max) = (self.config.sigma_min, self.config.sigma_max);
		self.discrete_sigmas = Array1::linspace(sigma_min.ln(), sigma_max.ln(), num_inference_steps).mapv(f64::exp);
		self.sigmas = self.timesteps.mapv(|t| sigma_min * (sigma_max / sigma_min).powf(t));

		tracing::debug!(num_inference_steps, sigma_min, sigma_max, "set score sde sigmas");
		Ok(())
	}

	/// The sigma matching each timestep; empty until [`ScoreSdeVeScheduler::set_sigmas`] is called.
	pub fn sigmas(&self) -> ArrayView1<'_, f64> {
		self.sigmas.view()
	}

	/// Geometrically spaced sigmas from `sigma_min` to `sigma_max`, indexed by discretized timestep.
	pub fn discrete_sigmas(&self) -> ArrayView1<'_, f64> {
		self.discrete_sigmas.view()
	}

	/// The sigma of the step before `index`, or `0` for the first step.
	pub fn get_adjacent_sigma(&self, index: usize) -> f64 {
		match index {
			0 => 0.0,
			_ => self.discrete_sigmas.get(index - 1).copied().unwrap_or(0.0)
		}
	}

	/// Discretizes a continuous timestep into an index of `discrete_sigmas`.
	fn discretize(&self, timestep: f64) -> anyhow::Result<usize> {
		if self.timesteps.is_empty() || self.discrete_sigmas.is_empty() {
			anyhow::bail!(SchedulerError::TimestepsNotSet);
		}

		let scaled = timestep * (self.timesteps.len() - 1) as f64;
		let len = self.discrete_sigmas.len();
		if scaled.is_nan() || scaled < 0.0 || scaled as usize >= len {
			anyhow::bail!(SchedulerError::TimestepOutOfRange { timestep: scaled as usize, len });
		}
		Ok(scaled as usize)
	}

	/// Predict the sample at the previous timestep by reversing the SDE with noise drawn from `rng`.
	///
	/// Returns both the noisy `prev_sample` and its mean `prev_sample_mean`.
	pub fn step_pred<T: SchedulerTensor, R: Rng + ?Sized>(
		&self,
		model_output: &T,
		timestep: f64,
		sample: &T,
		rng: &mut R
	) -> anyhow::Result<SchedulerStepOutput<T>> {
		let noise = sample.randn_like(rng)?;
		self.step_pred_with_noise(model_output, timestep, sample, &noise)
	}

	/// [`ScoreSdeVeScheduler::step_pred`] with explicit standard normal `noise`.
	pub fn step_pred_with_noise<T: SchedulerTensor>(
		&self,
		model_output: &T,
		timestep: f64,
		sample: &T,
		noise: &T
	) -> anyhow::Result<SchedulerStepOutput<T>> {
		let index = self.discretize(timestep)?;
		let sigma = self.discrete_sigmas[index];
		let adjacent_sigma = self.get_adjacent_sigma(index);

		// equation 6 in the paper: the model output is the score, so the drift of the reverse SDE is -g(t)^2 * score
		let diffusion = (sigma.powi(2) - adjacent_sigma.powi(2)).sqrt();
		let prev_sample_mean = sample.add(&model_output.scale(diffusion.powi(2))?)?;
		let prev_sample = prev_sample_mean.add(&noise.scale(diffusion)?)?;

		tracing::trace!(timestep, index, sigma, "score sde predictor step");

		Ok(SchedulerStepOutput {
			prev_sample,
			pred_original_sample: None,
			prev_sample_mean: Some(prev_sample_mean)
		})
	}

	/// Correct the predicted sample with a Langevin step, using noise drawn from `rng`. This is often run repeatedly
	/// after making the prediction for the previous timestep.
	pub fn step_correct<T: SchedulerTensor, R: Rng + ?Sized>(&self, model_output: &T, sample: &T, rng: &mut R) -> anyhow::Result<T> {
		let noise = sample.randn_like(rng)?;
		self.step_correct_with_noise(model_output, sample, &noise)
	}

	/// [`ScoreSdeVeScheduler::step_correct`] with explicit standard normal `noise`.
	///
	/// The step size is `2 * (snr * ‖z‖ / ‖model_output‖)²`, with norms averaged over the batch; it is `0` if the model
	/// output is all zeros.
	pub fn step_correct_with_noise<T: SchedulerTensor>(&self, model_output: &T, sample: &T, noise: &T) -> anyhow::Result<T> {
		let grad_norm = model_output.batch_norm_mean()?;
		let noise_norm = noise.batch_norm_mean()?;
		let step_size = if grad_norm > 0.0 { (self.config.snr * noise_norm / grad_norm).powi(2) * 2.0 } else { 0.0 };

		let prev_sample_mean = sample.add(&model_output.scale(step_size)?)?;
		let prev_sample = prev_sample_mean.add(&noise.scale((step_size * 2.0).sqrt())?)?;

		tracing::trace!(grad_norm, noise_norm, step_size, "score sde corrector step");
		Ok(prev_sample)
	}
}

impl ConfigMixin for ScoreSdeVeScheduler {
	type Config = ScoreSdeVeSchedulerConfig;

	const CLASS_NAME: &'static str = "ScoreSdeVeScheduler";

	fn config(&self) -> &Self::Config {
		&self.config
	}

	fn from_config(config: &Self::Config) -> anyhow::Result<Self> {
		Self::new(config)
	}
}

impl DiffusionScheduler for ScoreSdeVeScheduler {
	type Timestep = f64;

	fn timesteps(&self) -> ArrayView1<'_, f64> {
		self.timesteps.view()
	}

	fn init_noise_sigma(&self) -> f64 {
		self.config.sigma_max
	}

	fn len(&self) -> usize {
		self.config.num_train_timesteps
	}
}
