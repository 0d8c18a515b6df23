use ndarray::{Array1, ArrayView1};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{BetaSchedule, CoefficientTable, DiffusionScheduler, SchedulerStepOutput};
use crate::{ConfigMixin, SchedulerTensor};

/// Which variance is injected after each DDPM step.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DDPMVarianceType {
	/// The posterior variance `β̃_t`, computed from its clipped logarithm.
	#[default]
	FixedSmall,
	/// The clipped log posterior variance.
	FixedSmallLog,
	/// The forward process variance `β_t`.
	FixedLarge,
	/// `ln(β_t)`.
	FixedLargeLog,
	/// The raw posterior variance, for models that learn their own variance.
	#[serde(alias = "other")]
	Learned
}

impl DDPMVarianceType {
	fn is_log(&self) -> bool {
		matches!(self, Self::FixedSmallLog | Self::FixedLargeLog)
	}
}

/// Configuration for the [`DDPMScheduler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DDPMSchedulerConfig {
	/// Number of diffusion steps used to train the model.
	pub num_train_timesteps: usize,
	/// The starting `beta` value.
	pub beta_start: f64,
	/// The final `beta` value.
	pub beta_end: f64,
	/// The beta schedule, a mapping from a beta range to a sequence of betas for stepping the model.
	pub beta_schedule: BetaSchedule,
	/// Explicit betas, bypassing `beta_start`, `beta_end` and `beta_schedule`.
	pub trained_betas: Option<Vec<f32>>,
	/// The variance injected when adding noise to the denoised sample.
	pub variance_type: DDPMVarianceType,
	/// Option to clip the predicted sample between -1 and 1 for numerical stability.
	pub clip_sample: bool
}

impl Default for DDPMSchedulerConfig {
	fn default() -> Self {
		Self {
			num_train_timesteps: 1000,
			beta_start: 0.0001,
			beta_end: 0.02,
			beta_schedule: BetaSchedule::Linear,
			trained_betas: None,
			variance_type: DDPMVarianceType::FixedSmall,
			clip_sample: true
		}
	}
}

/// [Denoising diffusion probabilistic models][ddpm] (DDPMs) explores the connections between denoising score matching
/// and Langevin dynamics sampling.
///
/// [`DDPMScheduler::step`] is deterministic: it returns the posterior mean `μ̃_t(x_t, x̂_0)`. Ancestral sampling adds
/// `σ_t · z` on top of it for every timestep but `0`, either through [`DDPMScheduler::add_variance_noise`] with noise
/// of the caller's choosing or through [`DDPMScheduler::step_with_noise`].
///
/// [ddpm]: https://arxiv.org/abs/2006.11239
#[derive(Debug, Clone)]
pub struct DDPMScheduler {
	table: CoefficientTable,
	timesteps: Array1<usize>,
	config: DDPMSchedulerConfig
}

impl DDPMScheduler {
	/// Creates a new instance of the scheduler.
	///
	/// # Errors
	/// Fails with [`crate::SchedulerError::InvalidConfig`] if the beta schedule cannot be built; see
	/// [`CoefficientTable::new`].
	pub fn new(config: &DDPMSchedulerConfig) -> anyhow::Result<Self> {
		let table = CoefficientTable::new(
			config.num_train_timesteps,
			config.beta_start,
			config.beta_end,
			config.beta_schedule,
			config.trained_betas.as_deref()
		)?;
		let timesteps = (0..config.num_train_timesteps).rev().collect();

		Ok(Self { table, timesteps, config: config.clone() })
	}

	/// The precomputed coefficient table.
	pub fn table(&self) -> &CoefficientTable {
		&self.table
	}

	/// Returns the variance for `timestep` according to the configured [`DDPMVarianceType`]. For the log variance types,
	/// this is the log variance.
	///
	/// There is no variance at the end of the chain, so this is always `0` for timestep `0`.
	pub fn get_variance(&self, timestep: usize) -> anyhow::Result<f64> {
		let t = self.table.check_timestep(timestep)?;
		if t == 0 {
			return Ok(0.0);
		}

		Ok(match self.config.variance_type {
			DDPMVarianceType::FixedSmall => self.table.posterior_log_variance_clipped()[t].exp(),
			DDPMVarianceType::FixedSmallLog => self.table.posterior_log_variance_clipped()[t],
			DDPMVarianceType::FixedLarge => self.table.betas()[t],
			DDPMVarianceType::FixedLargeLog => self.table.betas()[t].ln(),
			DDPMVarianceType::Learned => self.table.posterior_variance()[t]
		})
	}

	/// The standard deviation `σ_t` of the noise added after stepping from `timestep`.
	fn noise_std(&self, timestep: usize) -> anyhow::Result<f64> {
		if timestep == 0 {
			return Ok(0.0);
		}
		let variance = self.get_variance(timestep)?;
		Ok(if self.config.variance_type.is_log() { (0.5 * variance).exp() } else { variance.sqrt() })
	}

	/// Predict the sample at the previous timestep by reversing the SDE, without injecting noise.
	///
	/// # Parameters
	/// - **`model_output`**: The direct output from the learned diffusion model.
	/// - **`timestep`**: The current discrete timestep in the diffusion chain.
	/// - **`sample`**: The current instance of sample being created by the diffusion process.
	pub fn step<T: SchedulerTensor>(&self, model_output: &T, timestep: usize, sample: &T) -> anyhow::Result<SchedulerStepOutput<T>> {
		let t = self.table.check_timestep(timestep)?;

		// 1. compute predicted original sample from predicted noise, also called "predicted x_0" of formula (15)
		let mut pred_original_sample = T::linear_combination(&[
			(self.table.sqrt_recip_alphas_cumprod()[t], sample),
			(-self.table.sqrt_recipm1_alphas_cumprod()[t], model_output)
		])?;

		// 2. clip predicted x_0
		if self.config.clip_sample {
			pred_original_sample = pred_original_sample.clip(-1.0, 1.0)?;
		}

		// 3. compute coefficients for pred_original_sample x_0 and current sample x_t, see formula (7)
		let pred_original_sample_coeff = self.table.posterior_mean_coef1()[t];
		let current_sample_coeff = self.table.posterior_mean_coef2()[t];

		// 4. compute predicted previous sample µ_t
		let prev_sample = T::linear_combination(&[(pred_original_sample_coeff, &pred_original_sample), (current_sample_coeff, sample)])?;

		tracing::trace!(timestep, "ddpm step");

		Ok(SchedulerStepOutput {
			prev_sample,
			pred_original_sample: Some(pred_original_sample),
			prev_sample_mean: None
		})
	}

	/// Adds `σ_t · noise` to the output of [`DDPMScheduler::step`]. Nothing is added at timestep `0`.
	pub fn add_variance_noise<T: SchedulerTensor>(&self, prev_sample: &T, timestep: usize, noise: &T) -> anyhow::Result<T> {
		let std = self.noise_std(self.table.check_timestep(timestep)?)?;
		if std == 0.0 {
			return Ok(prev_sample.clone());
		}
		prev_sample.add(&noise.scale(std)?)
	}

	/// Performs a full ancestral sampling step: [`DDPMScheduler::step`] followed by variance noise drawn from `rng`.
	///
	/// The returned output's `prev_sample_mean` holds the noiseless posterior mean.
	pub fn step_with_noise<T: SchedulerTensor, R: Rng + ?Sized>(
		&self,
		model_output: &T,
		timestep: usize,
		sample: &T,
		rng: &mut R
	) -> anyhow::Result<SchedulerStepOutput<T>> {
		let SchedulerStepOutput { prev_sample: mean, pred_original_sample, .. } = self.step(model_output, timestep, sample)?;
		let prev_sample = if timestep > 0 {
			let noise = model_output.randn_like(rng)?;
			self.add_variance_noise(&mean, timestep, &noise)?
		} else {
			mean.clone()
		};

		Ok(SchedulerStepOutput {
			prev_sample,
			pred_original_sample,
			prev_sample_mean: Some(mean)
		})
	}

	/// Diffuses `original_samples` forward to `timestep`: `sqrt(ᾱ_t) · x_0 + sqrt(1 - ᾱ_t) · noise`.
	pub fn add_noise<T: SchedulerTensor>(&self, original_samples: &T, noise: &T, timestep: usize) -> anyhow::Result<T> {
		let alpha_prod = self.table.alphas_cumprod()[self.table.check_timestep(timestep)?];
		T::linear_combination(&[(alpha_prod.sqrt(), original_samples), ((1.0 - alpha_prod).sqrt(), noise)])
	}
}

impl ConfigMixin for DDPMScheduler {
	type Config = DDPMSchedulerConfig;

	const CLASS_NAME: &'static str = "DDPMScheduler";

	fn config(&self) -> &Self::Config {
		&self.config
	}

	fn from_config(config: &Self::Config) -> anyhow::Result<Self> {
		Self::new(config)
	}
}

impl DiffusionScheduler for DDPMScheduler {
	type Timestep = usize;

	fn timesteps(&self) -> ArrayView1<'_, usize> {
		self.timesteps.view()
	}

	fn init_noise_sigma(&self) -> f64 {
		1.0
	}

	fn len(&self) -> usize {
		self.config.num_train_timesteps
	}
}
