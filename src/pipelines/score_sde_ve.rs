use rand::Rng;

use super::{NoiseModel, SamplingOptions};
use crate::{DiffusionScheduler, ScoreSdeVeScheduler, SchedulerTensor};

/// Predictor-corrector sampling with a [`ScoreSdeVeScheduler`].
#[derive(Debug, Clone)]
pub struct ScoreSdeVePipeline {
	scheduler: ScoreSdeVeScheduler
}

impl ScoreSdeVePipeline {
	/// Creates a pipeline sampling with `scheduler`.
	pub fn new(scheduler: ScoreSdeVeScheduler) -> Self {
		Self { scheduler }
	}

	/// The scheduler used for sampling.
	pub fn scheduler(&self) -> &ScoreSdeVeScheduler {
		&self.scheduler
	}

	/// Denoises `noise` (standard normal, scaled by `sigma_max` here) into a sample in `options.steps` steps. Each step
	/// runs the configured number of corrector iterations, then a predictor step; the model is evaluated on the step's
	/// sigma. Returns the noiseless mean of the last predictor step.
	pub fn generate<T, M, R>(&self, model: &mut M, noise: &T, options: &SamplingOptions, rng: &mut R) -> anyhow::Result<T>
	where
		T: SchedulerTensor,
		M: NoiseModel<T>,
		R: Rng + ?Sized
	{
		let mut scheduler = self.scheduler.clone();
		scheduler.set_timesteps(options.steps)?;
		scheduler.set_sigmas(options.steps)?;

		let mut sample = scheduler.initial_sample(noise)?;
		let mut sample_mean = sample.clone();
		for (i, (&t, &sigma)) in scheduler.timesteps().iter().zip(scheduler.sigmas().iter()).enumerate() {
			for _ in 0..scheduler.correct_steps() {
				let model_output = model.predict(&sample, sigma)?;
				sample = scheduler.step_correct(&model_output, &sample, rng)?;
			}

			let model_output = model.predict(&sample, sigma)?;
			let (prev_sample, prev_sample_mean) = scheduler.step_pred(&model_output, t, &sample, rng)?.into_parts();
			sample = prev_sample;
			if let Some(mean) = prev_sample_mean {
				sample_mean = mean;
			}

			tracing::debug!(step = i, timestep = t, sigma, "score sde pipeline step");
			if !options.keep_going(i, t) {
				break;
			}
		}

		Ok(sample_mean)
	}
}
