use super::{NoiseModel, SamplingOptions};
use crate::{ConfigMixin, DiffusionScheduler, PNDMScheduler, PNDMSchedulerConfig, SchedulerTensor};

/// Sampling with a [`PNDMScheduler`]: a pseudo Runge-Kutta warmup followed by pseudo linear multistep updates.
///
/// The scheduler is stateful, so the pipeline keeps its config and builds a fresh scheduler for every run.
#[derive(Debug, Clone)]
pub struct PNDMPipeline {
	config: PNDMSchedulerConfig
}

impl PNDMPipeline {
	/// Creates a pipeline sampling with schedulers built from `config`.
	///
	/// # Errors
	/// Fails with [`crate::SchedulerError::InvalidConfig`] if `config` does not describe a valid scheduler.
	pub fn new(config: PNDMSchedulerConfig) -> anyhow::Result<Self> {
		config.validate()?;
		Ok(Self { config })
	}

	/// The config schedulers are built from.
	pub fn config(&self) -> &PNDMSchedulerConfig {
		&self.config
	}

	/// Denoises `noise` (standard normal) into a sample in `options.steps` inference steps. Sampling is deterministic;
	/// each inference step in the warmup evaluates the model 4 times.
	pub fn generate<T, M>(&self, model: &mut M, noise: &T, options: &SamplingOptions) -> anyhow::Result<T>
	where
		T: SchedulerTensor,
		M: NoiseModel<T>
	{
		let mut scheduler = PNDMScheduler::<T>::from_config(&self.config)?;
		scheduler.set_timesteps(options.steps)?;

		let mut sample = scheduler.initial_sample(noise)?;
		let timesteps = scheduler.timesteps().to_owned();
		for (i, &t) in timesteps.iter().enumerate() {
			let model_output = model.predict(&sample, t as f64)?;
			sample = scheduler.step(&model_output, i, &sample)?.into_prev_sample();

			tracing::debug!(step = i, timestep = t, mode = ?scheduler.mode(), "pndm pipeline step");
			if !options.keep_going(i, t as f64) {
				break;
			}
		}

		Ok(sample)
	}
}
