//! Unconditional sampling pipelines.
//!
//! A pipeline owns a scheduler and drives the whole denoising loop: it scales the initial noise, evaluates the
//! [`NoiseModel`] at every timestep and feeds its output back into the scheduler. The model is anything that maps
//! `(sample, timestep)` to a residual of the same shape, including plain closures:
//! ```ignore
//! let pipeline = DDIMPipeline::new(DDIMScheduler::new(&DDIMSchedulerConfig::default())?);
//! let noise = Array4::<f32>::zeros((1, 3, 32, 32)).randn_like(&mut rng)?;
//! let image = pipeline.generate(&mut |x: &Array4<f32>, t: f64| unet.forward(x, t), &noise, &SamplingOptions::default().with_steps(50), &mut rng)?;
//! ```

use std::fmt::Debug;

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

/// A trained model predicting the residual (noise or score) for a sample at a given timestep.
///
/// The timestep is the scheduler's timestep as `f64`; for [`crate::ScoreSdeVeScheduler`] it is the noise scale sigma
/// of the current step. The returned residual must have the same shape as `sample`.
pub trait NoiseModel<T> {
	/// Predicts the residual for `sample` at `timestep`.
	fn predict(&mut self, sample: &T, timestep: f64) -> anyhow::Result<T>;
}

impl<T, F> NoiseModel<T> for F
where
	F: FnMut(&T, f64) -> anyhow::Result<T>
{
	fn predict(&mut self, sample: &T, timestep: f64) -> anyhow::Result<T> {
		self(sample, timestep)
	}
}

/// Options for sampling with a pipeline.
pub struct SamplingOptions {
	/// The number of inference steps. More steps typically yields higher quality samples. Ignored by
	/// [`DDPMPipeline`], which always visits every training timestep.
	pub steps: usize,
	/// Weight of the noise added in each DDIM step; only used by [`DDIMPipeline`].
	pub eta: f64,
	/// Called every `frequency` steps.
	pub callback: Option<SamplingCallback>
}

/// A callback reporting sampling progress.
///
/// Function Parameters:
/// - **`step`** (usize): The current step number.
/// - **`timestep`** (f64): This step's timestep.
///
/// Return `false` to stop sampling early; the sample of the last completed step is returned.
pub struct SamplingCallback {
	/// Describes how frequently to call this callback (3 = every 3 steps).
	pub frequency: usize,
	/// The callback itself.
	pub cb: Box<dyn Fn(usize, f64) -> bool>
}

impl Debug for SamplingCallback {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("<SamplingCallback>")
	}
}

impl Debug for SamplingOptions {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SamplingOptions")
			.field("steps", &self.steps)
			.field("eta", &self.eta)
			.field("callback", &self.callback)
			.finish()
	}
}

impl Default for SamplingOptions {
	fn default() -> Self {
		Self { steps: 50, eta: 0.0, callback: None }
	}
}

impl SamplingOptions {
	/// The number of inference steps to take.
	pub fn with_steps(mut self, steps: usize) -> Self {
		self.steps = steps;
		self
	}

	/// Set the DDIM `eta`. `0` is fully deterministic.
	pub fn with_eta(mut self, eta: f64) -> Self {
		self.eta = eta;
		self
	}

	/// Report progress every `frequency` steps. The callback returns whether to keep going.
	pub fn callback_progress<F>(mut self, frequency: usize, callback: F) -> Self
	where
		F: Fn(usize, f64) -> bool + 'static
	{
		self.callback = Some(SamplingCallback { frequency: frequency.max(1), cb: Box::new(callback) });
		self
	}

	/// Invokes the callback if it is due at step `i`; returns `false` if sampling should stop.
	pub(crate) fn keep_going(&self, i: usize, timestep: f64) -> bool {
		match &self.callback {
			Some(SamplingCallback { frequency, cb }) if i % frequency == 0 => cb(i, timestep),
			_ => true
		}
	}
}
