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

use std::collections::VecDeque;

use ndarray::{concatenate, Array1, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use super::{BetaSchedule, CoefficientTable, DiffusionScheduler, SchedulerStepOutput};
use crate::{ConfigMixin, SchedulerError, SchedulerTensor};

/// Order of the pseudo numerical methods: the Runge-Kutta warmup evaluates the model 4 times per timestep, and the
/// linear multistep update combines the 4 latest residuals.
const PNDM_ORDER: usize = 4;

/// Configuration for the [`PNDMScheduler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PNDMSchedulerConfig {
	/// Number of diffusion steps used to train the model.
	pub num_train_timesteps: usize,
	/// The starting `beta` value.
	pub beta_start: f64,
	/// The final `beta` value.
	pub beta_end: f64,
	/// The beta schedule, a mapping from a beta range to a sequence of betas for stepping the model.
	pub beta_schedule: BetaSchedule,
	/// Explicit betas, bypassing `beta_start`, `beta_end` and `beta_schedule`.
	pub trained_betas: Option<Vec<f32>>
}

impl Default for PNDMSchedulerConfig {
	fn default() -> Self {
		Self {
			num_train_timesteps: 1000,
			beta_start: 0.0001,
			beta_end: 0.02,
			beta_schedule: BetaSchedule::Linear,
			trained_betas: None
		}
	}
}

impl PNDMSchedulerConfig {
	/// Checks that this config describes a valid scheduler without building its coefficient table.
	///
	/// # Errors
	/// Fails with [`SchedulerError::InvalidConfig`] in the cases listed on [`CoefficientTable::new`].
	pub fn validate(&self) -> anyhow::Result<()> {
		CoefficientTable::validate(self.num_train_timesteps, self.beta_start, self.beta_end, self.beta_schedule, self.trained_betas.as_deref())
	}
}

/// Which update rule [`PNDMScheduler::step`] applies.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PNDMMode {
	/// Warm up with the pseudo Runge-Kutta method before switching to linear multistep updates.
	#[default]
	RungeKutta,
	/// Only use pseudo linear multistep (PLMS) updates. Requires a residual history.
	LinearMultistep
}

/// The most recent model residuals, oldest first. Holds at most 4 residuals; pushing into a full history evicts the
/// oldest one.
#[derive(Debug, Clone)]
pub struct ResidualHistory<T> {
	residuals: VecDeque<T>
}

impl<T> Default for ResidualHistory<T> {
	fn default() -> Self {
		Self { residuals: VecDeque::with_capacity(PNDM_ORDER) }
	}
}

impl<T> ResidualHistory<T> {
	/// The maximum number of residuals kept.
	pub const CAPACITY: usize = PNDM_ORDER;

	/// Appends a residual, evicting the oldest one if the history is full.
	pub fn push(&mut self, residual: T) {
		if self.residuals.len() == Self::CAPACITY {
			self.residuals.pop_front();
		}
		self.residuals.push_back(residual);
	}

	/// The number of buffered residuals.
	pub fn len(&self) -> usize {
		self.residuals.len()
	}

	/// Returns `true` if no residual is buffered.
	pub fn is_empty(&self) -> bool {
		self.residuals.is_empty()
	}

	/// Returns the `i`-th most recent residual; `0` is the latest.
	pub fn get_back(&self, i: usize) -> Option<&T> {
		self.residuals.len().checked_sub(i + 1).and_then(|idx| self.residuals.get(idx))
	}

	/// Removes all residuals.
	pub fn clear(&mut self) {
		self.residuals.clear();
	}

	/// Iterates over the residuals, oldest first.
	pub fn iter(&self) -> impl Iterator<Item = &T> {
		self.residuals.iter()
	}
}

impl<T> FromIterator<T> for ResidualHistory<T> {
	fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
		let mut history = Self::default();
		for residual in iter {
			history.push(residual);
		}
		history
	}
}

/// [Pseudo numerical methods for diffusion models][pndm] (PNDM) uses more advanced ODE integration techniques, namely
/// Runge-Kutta method and a linear multi-step method.
///
/// A sampling run first makes a pseudo Runge-Kutta warmup pass over [`PNDMScheduler::prk_timesteps`] (4 model
/// evaluations per timestep), which fills the residual history, then continues with pseudo linear multistep updates
/// over [`PNDMScheduler::plms_timesteps`]. [`PNDMScheduler::step`] dispatches between both based on the step index
/// into [`DiffusionScheduler::timesteps`]:
/// ```ignore
/// let mut scheduler = PNDMScheduler::new(&PNDMSchedulerConfig::default())?;
/// scheduler.set_timesteps(50)?;
/// for (i, t) in scheduler.timesteps().to_owned().into_iter().enumerate() {
/// 	let residual = unet(&sample, t)?;
/// 	sample = scheduler.step(&residual, i, &sample)?.into_prev_sample();
/// }
/// ```
///
/// The scheduler carries state across steps; reconstruct it (or clone a fresh one) for every sampling run.
///
/// [pndm]: https://arxiv.org/abs/2202.09778
#[derive(Debug, Clone)]
pub struct PNDMScheduler<T> {
	table: CoefficientTable,
	prk_timesteps: Array1<usize>,
	plms_timesteps: Array1<usize>,
	timesteps: Array1<usize>,
	num_inference_steps: Option<usize>,
	ets: ResidualHistory<T>,
	cur_residual: Option<T>,
	cur_sample: Option<T>,
	counter: usize,
	mode: PNDMMode,
	config: PNDMSchedulerConfig
}

impl<T: SchedulerTensor> PNDMScheduler<T> {
	/// Creates a new instance of the scheduler.
	///
	/// # Errors
	/// Fails with [`SchedulerError::InvalidConfig`] if the beta schedule cannot be built; see [`CoefficientTable::new`].
	pub fn new(config: &PNDMSchedulerConfig) -> anyhow::Result<Self> {
		let table = CoefficientTable::new(
			config.num_train_timesteps,
			config.beta_start,
			config.beta_end,
			config.beta_schedule,
			config.trained_betas.as_deref()
		)?;

		Ok(Self {
			table,
			prk_timesteps: Array1::default(0),
			plms_timesteps: Array1::default(0),
			timesteps: Array1::default(0),
			num_inference_steps: None,
			ets: ResidualHistory::default(),
			cur_residual: None,
			cur_sample: None,
			counter: 0,
			mode: PNDMMode::RungeKutta,
			config: config.clone()
		})
	}

	/// The precomputed coefficient table.
	pub fn table(&self) -> &CoefficientTable {
		&self.table
	}

	fn check_num_inference_steps(&self, num_inference_steps: usize) -> anyhow::Result<usize> {
		if num_inference_steps == 0 || num_inference_steps > self.config.num_train_timesteps {
			anyhow::bail!(SchedulerError::invalid_config(format!(
				"num_inference_steps ({num_inference_steps}) must be in 1..={}",
				self.config.num_train_timesteps
			)));
		}
		Ok(self.config.num_train_timesteps / num_inference_steps)
	}

	/// Returns the timesteps of the pseudo Runge-Kutta warmup for `num_inference_steps`.
	///
	/// The warmup covers the last 4 inference timesteps, each with a half-step in between, and visits every
	/// intermediate timestep twice:
	/// `[900, 850, 850, 800, 800, 750, 750, 700, 700, 650, 650, 600]` for 10 inference steps out of 1000.
	pub fn get_prk_time_steps(&self, num_inference_steps: usize) -> anyhow::Result<Array1<usize>> {
		let step_ratio = self.check_num_inference_steps(num_inference_steps)?;
		let inference_step_times: Vec<usize> = (0..self.config.num_train_timesteps).step_by(step_ratio).collect();

		let order_steps = &inference_step_times[inference_step_times.len().saturating_sub(PNDM_ORDER)..];
		let half_steps: Vec<usize> = order_steps.iter().flat_map(|&t| [t, t + step_ratio / 2]).collect();
		let Some((_, half_steps)) = half_steps.split_last() else {
			return Ok(Array1::default(0));
		};

		let repeated: Vec<usize> = half_steps.iter().flat_map(|&t| [t, t]).collect();
		let inner = &repeated[1..repeated.len() - 1];
		Ok(inner.iter().rev().copied().collect())
	}

	/// Returns the timesteps of the pseudo linear multistep phase for `num_inference_steps`: every inference timestep
	/// not covered by the warmup, in descending order.
	pub fn get_time_steps(&self, num_inference_steps: usize) -> anyhow::Result<Array1<usize>> {
		let step_ratio = self.check_num_inference_steps(num_inference_steps)?;
		let inference_step_times: Vec<usize> = (0..self.config.num_train_timesteps).step_by(step_ratio).collect();
		let plms_steps = &inference_step_times[..inference_step_times.len().saturating_sub(PNDM_ORDER - 1)];
		Ok(plms_steps.iter().rev().copied().collect())
	}

	/// Sets the discrete timesteps used for the diffusion chain.
	///
	/// This does not reset the residual history nor the mode; a fresh scheduler is needed for a new sampling run.
	pub fn set_timesteps(&mut self, num_inference_steps: usize) -> anyhow::Result<()> {
		self.prk_timesteps = self.get_prk_time_steps(num_inference_steps)?;
		self.plms_timesteps = self.get_time_steps(num_inference_steps)?;
		self.timesteps = concatenate(Axis(0), &[self.prk_timesteps.view(), self.plms_timesteps.view()])?;
		self.num_inference_steps = Some(num_inference_steps);
		self.cur_residual = None;
		self.cur_sample = None;

		tracing::debug!(num_inference_steps, prk_steps = self.prk_timesteps.len(), plms_steps = self.plms_timesteps.len(), "set pndm timesteps");
		Ok(())
	}

	/// The number of inference steps set by [`PNDMScheduler::set_timesteps`], if any.
	pub fn num_inference_steps(&self) -> Option<usize> {
		self.num_inference_steps
	}

	/// Timesteps of the pseudo Runge-Kutta warmup; empty until [`PNDMScheduler::set_timesteps`] is called.
	pub fn prk_timesteps(&self) -> ArrayView1<'_, usize> {
		self.prk_timesteps.view()
	}

	/// Timesteps of the pseudo linear multistep phase; empty until [`PNDMScheduler::set_timesteps`] is called.
	pub fn plms_timesteps(&self) -> ArrayView1<'_, usize> {
		self.plms_timesteps.view()
	}

	/// The current update rule used by [`PNDMScheduler::step`].
	pub fn mode(&self) -> PNDMMode {
		self.mode
	}

	/// Warm up with pseudo Runge-Kutta steps first. This is the default.
	pub fn set_prk_mode(&mut self) {
		tracing::debug!("pndm switched to runge-kutta mode");
		self.mode = PNDMMode::RungeKutta;
	}

	/// Skip the warmup and only use pseudo linear multistep updates, e.g. to resume from a saved residual history.
	pub fn set_plms_mode(&mut self) {
		tracing::debug!("pndm switched to linear multistep mode");
		self.mode = PNDMMode::LinearMultistep;
	}

	/// The number of steps taken so far.
	pub fn counter(&self) -> usize {
		self.counter
	}

	/// The buffered residual history.
	pub fn ets(&self) -> &ResidualHistory<T> {
		&self.ets
	}

	/// Mutable access to the residual history, for seeding it when resuming a run.
	pub fn ets_mut(&mut self) -> &mut ResidualHistory<T> {
		&mut self.ets
	}

	/// Replaces the residual history, keeping the 4 most recent residuals of `residuals` (oldest first).
	pub fn set_ets(&mut self, residuals: impl IntoIterator<Item = T>) {
		self.ets = residuals.into_iter().collect();
	}

	/// Advances `sample` by one step.
	///
	/// `index` is the position of the current timestep in [`DiffusionScheduler::timesteps`]: in
	/// [`PNDMMode::RungeKutta`] this covers the warmup followed by the multistep phase, in
	/// [`PNDMMode::LinearMultistep`] only the multistep phase.
	pub fn step(&mut self, model_output: &T, index: usize, sample: &T) -> anyhow::Result<SchedulerStepOutput<T>> {
		match self.mode {
			PNDMMode::RungeKutta if index < self.prk_timesteps.len() => self.step_prk(model_output, index, sample),
			PNDMMode::RungeKutta => self.step_plms(model_output, index - self.prk_timesteps.len(), sample),
			PNDMMode::LinearMultistep => self.step_plms(model_output, index, sample)
		}
	}

	/// Step function propagating the sample with the pseudo Runge-Kutta method. RK takes 4 forward passes to
	/// approximate the solution to the differential equation; `index` is the position in
	/// [`PNDMScheduler::prk_timesteps`].
	pub fn step_prk(&mut self, model_output: &T, index: usize, sample: &T) -> anyhow::Result<SchedulerStepOutput<T>> {
		if self.num_inference_steps.is_none() {
			anyhow::bail!(SchedulerError::TimestepsNotSet);
		}
		let len = self.prk_timesteps.len();
		if index >= len {
			anyhow::bail!(SchedulerError::TimestepOutOfRange { timestep: index, len });
		}

		let timestep = self.prk_timesteps[index / PNDM_ORDER * PNDM_ORDER];
		let prev_timestep = self.prk_timesteps[(index + 1).min(len - 1)];

		let residual = match index % PNDM_ORDER {
			0 => {
				self.cur_residual = Some(self.accumulate(model_output, 1.0 / 6.0)?);
				self.ets.push(model_output.clone());
				self.cur_sample = Some(sample.clone());
				model_output.clone()
			}
			1 | 2 => {
				self.cur_residual = Some(self.accumulate(model_output, 1.0 / 3.0)?);
				model_output.clone()
			}
			_ => {
				let residual = self.accumulate(model_output, 1.0 / 6.0)?;
				self.cur_residual = None;
				residual
			}
		};

		let cur_sample = self.cur_sample.as_ref().unwrap_or(sample);
		let prev_sample = self.get_prev_sample(cur_sample, timestep, prev_timestep, &residual)?;
		self.counter += 1;

		tracing::trace!(index, timestep, prev_timestep, "pndm runge-kutta step");
		Ok(SchedulerStepOutput::new(prev_sample))
	}

	fn accumulate(&self, model_output: &T, weight: f64) -> anyhow::Result<T> {
		match &self.cur_residual {
			Some(cur_residual) => cur_residual.add(&model_output.scale(weight)?),
			None => model_output.scale(weight)
		}
	}

	/// Step function propagating the sample with the pseudo linear multistep method. This has one forward pass with
	/// multiple times to approximate the solution; `index` is the position in [`PNDMScheduler::plms_timesteps`].
	///
	/// # Errors
	/// Fails with [`SchedulerError::InsufficientHistory`], leaving the scheduler untouched, unless at least 3 residuals
	/// were buffered by earlier steps.
	pub fn step_plms(&mut self, model_output: &T, index: usize, sample: &T) -> anyhow::Result<SchedulerStepOutput<T>> {
		if self.ets.len() < PNDM_ORDER - 1 {
			anyhow::bail!(SchedulerError::InsufficientHistory {
				required: PNDM_ORDER,
				available: self.ets.len() + 1
			});
		}
		if self.num_inference_steps.is_none() {
			anyhow::bail!(SchedulerError::TimestepsNotSet);
		}
		let len = self.plms_timesteps.len();
		if index >= len {
			anyhow::bail!(SchedulerError::TimestepOutOfRange { timestep: index, len });
		}

		let timestep = self.plms_timesteps[index];
		let prev_timestep = self.plms_timesteps[(index + 1).min(len - 1)];

		self.ets.push(model_output.clone());
		let [e1, e2, e3, e4] = [0, 1, 2, 3].map(|i| self.ets.get_back(i));
		let (Some(e1), Some(e2), Some(e3), Some(e4)) = (e1, e2, e3, e4) else {
			anyhow::bail!(SchedulerError::InsufficientHistory {
				required: PNDM_ORDER,
				available: self.ets.len()
			});
		};
		let residual = T::linear_combination(&[(55.0 / 24.0, e1), (-59.0 / 24.0, e2), (37.0 / 24.0, e3), (-9.0 / 24.0, e4)])?;

		let prev_sample = self.get_prev_sample(sample, timestep, prev_timestep, &residual)?;
		self.counter += 1;

		tracing::trace!(index, timestep, prev_timestep, "pndm linear multistep step");
		Ok(SchedulerStepOutput::new(prev_sample))
	}

	/// Formula (9) of the PNDM paper: computes `x_(t−δ)` from `x_t`, with `alpha_prod` lookups at `t + 1` clamped to the
	/// end of the table.
	///
	/// ```text
	/// x_(t−δ) = (α_(t−δ)^0.5 / α_t^0.5) · x_t
	///     − (α_(t−δ) − α_t) / (α_t · (1 − α_(t−δ))^0.5 + (α_t · (1 − α_t) · α_(t−δ))^0.5) · e_θ(x_t, t)
	/// ```
	pub fn get_prev_sample(&self, sample: &T, timestep: usize, prev_timestep: usize, residual: &T) -> anyhow::Result<T> {
		let last = self.table.len() - 1;
		let alpha_prod_t = self.table.alphas_cumprod()[(timestep + 1).min(last)];
		let alpha_prod_t_prev = self.table.alphas_cumprod()[(prev_timestep + 1).min(last)];
		let beta_prod_t = 1.0 - alpha_prod_t;
		let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

		let sample_coeff = (alpha_prod_t_prev / alpha_prod_t).sqrt();

		// denominator of e_θ(x_t, t)
		let model_output_denom_coeff = alpha_prod_t * beta_prod_t_prev.sqrt() + (alpha_prod_t * beta_prod_t * alpha_prod_t_prev).sqrt();

		T::linear_combination(&[(sample_coeff, sample), (-(alpha_prod_t_prev - alpha_prod_t) / model_output_denom_coeff, residual)])
	}
}

impl<T: SchedulerTensor> ConfigMixin for PNDMScheduler<T> {
	type Config = PNDMSchedulerConfig;

	const CLASS_NAME: &'static str = "PNDMScheduler";

	fn config(&self) -> &Self::Config {
		&self.config
	}

	fn from_config(config: &Self::Config) -> anyhow::Result<Self> {
		Self::new(config)
	}
}

impl<T: SchedulerTensor> DiffusionScheduler for PNDMScheduler<T> {
	type Timestep = usize;

	fn timesteps(&self) -> ArrayView1<'_, usize> {
		match self.mode {
			PNDMMode::RungeKutta => self.timesteps.view(),
			PNDMMode::LinearMultistep => self.plms_timesteps.view()
		}
	}

	fn init_noise_sigma(&self) -> f64 {
		1.0
	}

	fn len(&self) -> usize {
		self.config.num_train_timesteps
	}
}

#[cfg(test)]
mod tests {
	use ndarray::{array, Array1 as A1};

	use super::*;

	fn scheduler() -> PNDMScheduler<A1<f64>> {
		PNDMScheduler::new(&PNDMSchedulerConfig::default()).unwrap()
	}

	#[test]
	fn test_prk_time_steps() {
		let prk = scheduler().get_prk_time_steps(10).unwrap();
		assert_eq!(prk, array![900, 850, 850, 800, 800, 750, 750, 700, 700, 650, 650, 600]);
	}

	#[test]
	fn test_plms_time_steps() {
		let plms = scheduler().get_time_steps(10).unwrap();
		assert_eq!(plms, array![600, 500, 400, 300, 200, 100, 0]);
	}

	#[test]
	fn test_few_inference_steps() {
		let scheduler = scheduler();
		assert_eq!(scheduler.get_time_steps(2).unwrap().len(), 0);
		assert_eq!(scheduler.get_prk_time_steps(2).unwrap(), array![500, 250, 250, 0]);
		assert!(scheduler.get_prk_time_steps(0).is_err());
	}

	#[test]
	fn test_residual_history_evicts_oldest() {
		let mut history: ResidualHistory<u32> = (0..3).collect();
		assert_eq!(history.len(), 3);
		history.push(3);
		history.push(4);
		assert_eq!(history.len(), ResidualHistory::<u32>::CAPACITY);
		assert_eq!(history.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
		assert_eq!(history.get_back(0), Some(&4));
		assert_eq!(history.get_back(3), Some(&1));
		assert_eq!(history.get_back(4), None);
		history.clear();
		assert!(history.is_empty());
	}

	#[test]
	fn test_timesteps_follow_mode() {
		let mut scheduler = scheduler();
		scheduler.set_timesteps(10).unwrap();
		assert_eq!(scheduler.timesteps().len(), 19);
		scheduler.set_plms_mode();
		assert_eq!(scheduler.mode(), PNDMMode::LinearMultistep);
		assert_eq!(scheduler.timesteps().len(), 7);
	}
}
