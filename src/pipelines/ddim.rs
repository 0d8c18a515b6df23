use rand::Rng;

use super::{NoiseModel, SamplingOptions};
use crate::{DDIMScheduler, DiffusionScheduler, SchedulerTensor};

/// Sampling with a [`DDIMScheduler`] over a reduced number of inference steps.
#[derive(Debug, Clone)]
pub struct DDIMPipeline {
	scheduler: DDIMScheduler
}

impl DDIMPipeline {
	/// Creates a pipeline sampling with `scheduler`.
	pub fn new(scheduler: DDIMScheduler) -> Self {
		Self { scheduler }
	}

	/// The scheduler used for sampling.
	pub fn scheduler(&self) -> &DDIMScheduler {
		&self.scheduler
	}

	/// Denoises `noise` (standard normal) into a sample in `options.steps` steps. With `options.eta > 0`, noise is drawn
	/// from `rng` in every step.
	pub fn generate<T, M, R>(&self, model: &mut M, noise: &T, options: &SamplingOptions, rng: &mut R) -> anyhow::Result<T>
	where
		T: SchedulerTensor,
		M: NoiseModel<T>,
		R: Rng + ?Sized
	{
		let mut scheduler = self.scheduler.clone();
		scheduler.set_timesteps(options.steps)?;

		let mut sample = scheduler.initial_sample(noise)?;
		for (i, &t) in scheduler.timesteps().iter().enumerate() {
			let model_output = model.predict(&sample, t as f64)?;
			sample = scheduler.step(&model_output, t, &sample, options.eta, rng)?.into_prev_sample();

			tracing::debug!(step = i, timestep = t, "ddim pipeline step");
			if !options.keep_going(i, t as f64) {
				break;
			}
		}

		Ok(sample)
	}
}
