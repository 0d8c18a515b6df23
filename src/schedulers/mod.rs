//! The schedule functions, denoted Schedulers in the library take in the output of a trained model, a sample which the
//! diffusion process is iterating on, and a timestep to return a denoised sample.
//!
//! * Schedulers define the methodology for iteratively adding noise to an image or for updating a sample based on model
//! outputs.
//!   - adding noise in different manners represent the algorithmic processes to train a diffusion model by adding noise
//!     to images.
//!   - for inference, the scheduler defines how to update a sample based on an output from a pretrained model.
//! * Schedulers are often defined by a noise schedule and an update rule to solve the differential equation
//! solution.
//!
//! Every scheduler is built from a strongly typed config (see [`ConfigMixin`]) and is generic over the sample type
//! through [`SchedulerTensor`]. Schedulers never call the noise model themselves; the caller evaluates it and feeds the
//! residual into the scheduler's step function.

use ndarray::ArrayView1;

use crate::{ConfigMixin, SchedulerTensor};

mod schedule;
pub use self::schedule::{BetaSchedule, CoefficientTable};

cfg_if::cfg_if! {
	if #[cfg(feature = "scheduler-ddpm")] {
		mod ddpm;
		pub use self::ddpm::*;
	}
}
cfg_if::cfg_if! {
	if #[cfg(feature = "scheduler-ddim")] {
		mod ddim;
		pub use self::ddim::*;
	}
}
cfg_if::cfg_if! {
	if #[cfg(feature = "scheduler-pndm")] {
		mod pndm;
		pub use self::pndm::*;
	}
}
cfg_if::cfg_if! {
	if #[cfg(feature = "scheduler-sde-ve")] {
		mod score_sde_ve;
		pub use self::score_sde_ve::*;
	}
}

/// The output returned by a scheduler's `step` function.
#[derive(Debug, Clone)]
pub struct SchedulerStepOutput<T> {
	pub(crate) prev_sample: T,
	pub(crate) pred_original_sample: Option<T>,
	pub(crate) prev_sample_mean: Option<T>
}

impl<T> SchedulerStepOutput<T> {
	pub(crate) fn new(prev_sample: T) -> Self {
		Self { prev_sample, pred_original_sample: None, prev_sample_mean: None }
	}

	/// Computed sample (`x_{t-1}`) of the previous timestep. `prev_sample` should be used as the next model input in
	/// the denoising loop.
	pub fn prev_sample(&self) -> &T {
		&self.prev_sample
	}

	/// Consumes the output, returning only `prev_sample`.
	pub fn into_prev_sample(self) -> T {
		self.prev_sample
	}

	/// The predicted denoised sample (`x_{0}`) based on the model output from the current timestep.
	/// `pred_original_sample` can be used to preview progress or for guidance.
	pub fn pred_original_sample(&self) -> Option<&T> {
		self.pred_original_sample.as_ref()
	}

	/// Mean averaged `prev_sample`, i.e. `prev_sample` before noise was injected. For the final step of a stochastic
	/// sampler, this is the sample to keep.
	pub fn prev_sample_mean(&self) -> Option<&T> {
		self.prev_sample_mean.as_ref()
	}

	/// Consumes the output, returning `(prev_sample, prev_sample_mean)`.
	pub fn into_parts(self) -> (T, Option<T>) {
		(self.prev_sample, self.prev_sample_mean)
	}
}

/// A scheduler to be used in diffusion pipelines.
#[allow(clippy::len_without_is_empty)]
pub trait DiffusionScheduler: ConfigMixin + Clone {
	/// The type of timestep passed to the noise model and the step functions.
	type Timestep: Copy + std::fmt::Debug;

	/// Returns the computed scheduler timesteps, in the order they should be visited. Schedulers with an inference
	/// schedule only return meaningful timesteps once it has been set.
	fn timesteps(&self) -> ArrayView1<'_, Self::Timestep>;

	/// Returns the initial sigma noise value.
	fn init_noise_sigma(&self) -> f64;

	/// Returns the number of train timesteps.
	fn len(&self) -> usize;

	/// Scales standard normal noise into the first sample of the denoising loop.
	fn initial_sample<T: SchedulerTensor>(&self, noise: &T) -> anyhow::Result<T> {
		noise.scale(self.init_noise_sigma())
	}
}
