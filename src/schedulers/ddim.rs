use ndarray::{s, Array1, ArrayView1};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{BetaSchedule, CoefficientTable, DiffusionScheduler, SchedulerStepOutput};
use crate::{ConfigMixin, SchedulerError, SchedulerTensor};

/// Configuration for the [`DDIMScheduler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DDIMSchedulerConfig {
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
	/// Option to clip the predicted sample between -1 and 1 for numerical stability.
	pub clip_sample: bool,
	/// Each diffusion step uses the value of alphas product at that step and at the previous one. For the final step,
	/// there is no previous alpha. When this option is true, the previous alpha product is fixed to `1`, otherwise it
	/// uses the value of alpha at step 0.
	pub set_alpha_to_one: bool
}

impl Default for DDIMSchedulerConfig {
	fn default() -> Self {
		Self {
			num_train_timesteps: 1000,
			beta_start: 0.0001,
			beta_end: 0.02,
			beta_schedule: BetaSchedule::Linear,
			trained_betas: None,
			clip_sample: true,
			set_alpha_to_one: true
		}
	}
}

/// Per-step options for [`DDIMScheduler::step_with_options`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DDIMStepOptions {
	/// Weight of the noise added in the step, `η` in the DDIM paper. `0` makes the step fully deterministic, `1`
	/// recovers DDPM.
	pub eta: f64,
	/// If true, re-derives the model output from the clipped predicted original sample. This is what Glide does; the
	/// predicted sample is only clipped when `clip_sample` is enabled.
	pub use_clipped_model_output: bool
}

impl Default for DDIMStepOptions {
	fn default() -> Self {
		Self { eta: 0.0, use_clipped_model_output: false }
	}
}

/// [Denoising diffusion implicit models][ddim] is a scheduler that extends the denoising procedure introduced in
/// denoising diffusion probabilistic models (DDPMs) with non-Markovian guidance.
///
/// DDIM can sample with far fewer steps than the model was trained with; call [`DDIMScheduler::set_timesteps`] before
/// stepping.
///
/// [ddim]: https://arxiv.org/abs/2010.02502
#[derive(Debug, Clone)]
pub struct DDIMScheduler {
	table: CoefficientTable,
	final_alpha_cumprod: f64,
	timesteps: Array1<usize>,
	num_inference_steps: Option<usize>,
	config: DDIMSchedulerConfig
}

impl DDIMScheduler {
	/// Creates a new instance of the scheduler.
	///
	/// # Errors
	/// Fails with [`SchedulerError::InvalidConfig`] if the beta schedule cannot be built; see [`CoefficientTable::new`].
	pub fn new(config: &DDIMSchedulerConfig) -> anyhow::Result<Self> {
		let table = CoefficientTable::new(
			config.num_train_timesteps,
			config.beta_start,
			config.beta_end,
			config.beta_schedule,
			config.trained_betas.as_deref()
		)?;

		// At every step in DDIM, we are looking into the previous alphas_cumprod
		// For the final step, there is no previous alphas_cumprod because we are already at 0
		let final_alpha_cumprod = if config.set_alpha_to_one { 1.0 } else { table.alphas_cumprod()[0] };

		let timesteps = (0..config.num_train_timesteps).rev().collect();

		Ok(Self {
			table,
			final_alpha_cumprod,
			timesteps,
			num_inference_steps: None,
			config: config.clone()
		})
	}

	/// The precomputed coefficient table.
	pub fn table(&self) -> &CoefficientTable {
		&self.table
	}

	/// The number of inference steps set by [`DDIMScheduler::set_timesteps`], if any.
	pub fn num_inference_steps(&self) -> Option<usize> {
		self.num_inference_steps
	}

	/// Sets the discrete timesteps used for the diffusion chain: every `num_train_timesteps / num_inference_steps`-th
	/// training timestep, in descending order.
	///
	/// # Errors
	/// Fails with [`SchedulerError::InvalidConfig`] unless `0 < num_inference_steps <= num_train_timesteps`.
	pub fn set_timesteps(&mut self, num_inference_steps: usize) -> anyhow::Result<()> {
		if num_inference_steps == 0 || num_inference_steps > self.config.num_train_timesteps {
			anyhow::bail!(SchedulerError::invalid_config(format!(
				"num_inference_steps ({num_inference_steps}) must be in 1..={}",
				self.config.num_train_timesteps
			)));
		}

		let step_ratio = self.config.num_train_timesteps / num_inference_steps;
		self.timesteps = Array1::from_iter((0..self.config.num_train_timesteps).step_by(step_ratio))
			.slice(s![..;-1])
			.to_owned();
		self.num_inference_steps = Some(num_inference_steps);

		tracing::debug!(num_inference_steps, step_ratio, "set ddim timesteps");
		Ok(())
	}

	fn alpha_prod_prev(&self, prev_timestep: isize) -> anyhow::Result<f64> {
		Ok(if prev_timestep >= 0 {
			self.table.alphas_cumprod()[self.table.check_timestep(prev_timestep as usize)?]
		} else {
			self.final_alpha_cumprod
		})
	}

	/// The variance `σ_t²` of formula (16) for a step from `timestep` to `prev_timestep`, before scaling by `η`.
	///
	/// `prev_timestep` is negative for the final step; `σ_t² = 0` whenever both timesteps are equal.
	pub fn get_variance(&self, timestep: usize, prev_timestep: isize) -> anyhow::Result<f64> {
		let alpha_prod_t = self.table.alphas_cumprod()[self.table.check_timestep(timestep)?];
		let alpha_prod_t_prev = self.alpha_prod_prev(prev_timestep)?;
		let beta_prod_t = 1.0 - alpha_prod_t;
		let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

		Ok((beta_prod_t_prev / beta_prod_t) * (1.0 - alpha_prod_t / alpha_prod_t_prev))
	}

	/// Predict the sample at the previous timestep by reversing the SDE. Noise is drawn from `rng` only if `eta > 0`.
	///
	/// # Parameters
	/// - **`model_output`**: The direct output from the learned diffusion model.
	/// - **`timestep`**: The current discrete timestep in the diffusion chain.
	/// - **`sample`**: The current instance of sample being created by the diffusion process.
	/// - **`eta`**: Weight of the noise added in the step.
	/// - **`rng`**: The random number generator used for the added noise.
	pub fn step<T: SchedulerTensor, R: Rng + ?Sized>(
		&self,
		model_output: &T,
		timestep: usize,
		sample: &T,
		eta: f64,
		rng: &mut R
	) -> anyhow::Result<SchedulerStepOutput<T>> {
		self.step_with_options(model_output, timestep, sample, &DDIMStepOptions { eta, ..Default::default() }, rng)
	}

	/// [`DDIMScheduler::step`] with all per-step options; see [`DDIMStepOptions`].
	pub fn step_with_options<T: SchedulerTensor, R: Rng + ?Sized>(
		&self,
		model_output: &T,
		timestep: usize,
		sample: &T,
		options: &DDIMStepOptions,
		rng: &mut R
	) -> anyhow::Result<SchedulerStepOutput<T>> {
		let num_inference_steps = self.num_inference_steps.ok_or(SchedulerError::TimestepsNotSet)?;

		// See formulas (12) and (16) of DDIM paper https://arxiv.org/pdf/2010.02502.pdf
		// Notation (<variable name> -> <name in paper>
		// - pred_noise_t -> e_theta(x_t, t)
		// - pred_original_sample -> f_theta(x_t, t) or x_0
		// - std_dev_t -> sigma_t
		// - eta -> η
		// - pred_sample_direction -> "direction pointing to x_t"
		// - pred_prev_sample -> "x_t-1"

		// 1. get previous step value (=t-1)
		let prev_timestep = timestep as isize - (self.config.num_train_timesteps / num_inference_steps) as isize;

		// 2. compute alphas, betas
		let alpha_prod_t = self.table.alphas_cumprod()[self.table.check_timestep(timestep)?];
		let alpha_prod_t_prev = self.alpha_prod_prev(prev_timestep)?;
		let beta_prod_t = 1.0 - alpha_prod_t;

		// 3. compute predicted original sample from predicted noise also called "predicted x_0" of formula (12)
		let mut pred_original_sample = sample.sub(&model_output.scale(beta_prod_t.sqrt())?)?.scale(1.0 / alpha_prod_t.sqrt())?;

		// 4. clip "predicted x_0"
		if self.config.clip_sample {
			pred_original_sample = pred_original_sample.clip(-1.0, 1.0)?;
		}

		// 5. compute variance: "sigma_t(η)" -> see formula (16)
		// σ_t = sqrt((1 − α_t−1)/(1 − α_t)) * sqrt(1 − α_t/α_t−1)
		let variance = self.get_variance(timestep, prev_timestep)?;
		let std_dev_t = options.eta * variance.sqrt();

		let model_output = if options.use_clipped_model_output {
			// the model_output is always re-derived from the clipped x_0 in Glide
			sample.sub(&pred_original_sample.scale(alpha_prod_t.sqrt())?)?.scale(1.0 / beta_prod_t.sqrt())?
		} else {
			model_output.clone()
		};

		// 6. compute "direction pointing to x_t" of formula (12) and x_t without "random noise" of formula (12)
		let direction_coeff = (1.0 - alpha_prod_t_prev - std_dev_t.powi(2)).sqrt();
		let mut prev_sample = T::linear_combination(&[(alpha_prod_t_prev.sqrt(), &pred_original_sample), (direction_coeff, &model_output)])?;

		if options.eta > 0.0 {
			let noise = model_output.randn_like(rng)?;
			prev_sample = prev_sample.add(&noise.scale(std_dev_t)?)?;
		}

		tracing::trace!(timestep, prev_timestep, std_dev_t, "ddim step");

		Ok(SchedulerStepOutput {
			prev_sample,
			pred_original_sample: Some(pred_original_sample),
			prev_sample_mean: None
		})
	}

	/// Diffuses `original_samples` forward to `timestep`: `sqrt(ᾱ_t) · x_0 + sqrt(1 - ᾱ_t) · noise`.
	pub fn add_noise<T: SchedulerTensor>(&self, original_samples: &T, noise: &T, timestep: usize) -> anyhow::Result<T> {
		let alpha_prod = self.table.alphas_cumprod()[self.table.check_timestep(timestep)?];
		T::linear_combination(&[(alpha_prod.sqrt(), original_samples), ((1.0 - alpha_prod).sqrt(), noise)])
	}
}

impl ConfigMixin for DDIMScheduler {
	type Config = DDIMSchedulerConfig;

	const CLASS_NAME: &'static str = "DDIMScheduler";

	fn config(&self) -> &Self::Config {
		&self.config
	}

	fn from_config(config: &Self::Config) -> anyhow::Result<Self> {
		Self::new(config)
	}
}

impl DiffusionScheduler for DDIMScheduler {
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
