use rand::Rng;

use super::{NoiseModel, SamplingOptions};
use crate::{DDPMScheduler, DiffusionScheduler, SchedulerTensor};

/// Ancestral sampling with a [`DDPMScheduler`], visiting every training timestep.
#[derive(Debug, Clone)]
pub struct DDPMPipeline {
	scheduler: DDPMScheduler
}

impl DDPMPipeline {
	/// Creates a pipeline sampling with `scheduler`.
	pub fn new(scheduler: DDPMScheduler) -> Self {
		Self { scheduler }
	}

	/// The scheduler used for sampling.
	pub fn scheduler(&self) -> &DDPMScheduler {
		&self.scheduler
	}

	/// Denoises `noise` (standard normal) into a sample. Variance noise is drawn from `rng` after every step but the
	/// last.
	pub fn generate<T, M, R>(&self, model: &mut M, noise: &T, options: &SamplingOptions, rng: &mut R) -> anyhow::Result<T>
	where
		T: SchedulerTensor,
		M: NoiseModel<T>,
		R: Rng + ?Sized
	{
		let mut sample = self.scheduler.initial_sample(noise)?;

		for (i, &t) in self.scheduler.timesteps().iter().enumerate() {
			let model_output = model.predict(&sample, t as f64)?;
			sample = self.scheduler.step_with_noise(&model_output, t, &sample, rng)?.into_prev_sample();

			tracing::debug!(step = i, timestep = t, "ddpm pipeline step");
			if !options.keep_going(i, t as f64) {
				break;
			}
		}

		Ok(sample)
	}
}
