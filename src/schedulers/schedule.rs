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

use std::{fmt, str::FromStr};

use ndarray::{Array1, ArrayView1, Zip};
use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// A mapping from a beta range to a sequence of betas for stepping the model.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BetaSchedule {
	/// Linear beta schedule.
	#[default]
	#[serde(rename = "linear")]
	Linear,
	/// Scaled linear beta schedule, linear in `sqrt(beta)`.
	#[serde(rename = "scaled_linear")]
	ScaledLinear,
	/// Glide cosine schedule, derived from a squared-cosine cumulative product of alphas and capped at `0.999`.
	#[serde(rename = "squaredcos_cap_v2")]
	SquaredcosCapV2
}

impl BetaSchedule {
	/// The name of the schedule as it appears in a scheduler config.
	pub fn as_str(&self) -> &'static str {
		match self {
			BetaSchedule::Linear => "linear",
			BetaSchedule::ScaledLinear => "scaled_linear",
			BetaSchedule::SquaredcosCapV2 => "squaredcos_cap_v2"
		}
	}
}

impl fmt::Display for BetaSchedule {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for BetaSchedule {
	type Err = SchedulerError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"linear" => Ok(BetaSchedule::Linear),
			"scaled_linear" => Ok(BetaSchedule::ScaledLinear),
			"squaredcos_cap_v2" => Ok(BetaSchedule::SquaredcosCapV2),
			_ => Err(SchedulerError::invalid_config(format!("unknown beta schedule `{s}`")))
		}
	}
}

/// Create a beta schedule that discretizes the given alpha_t_bar function, which defines the cumulative product of
/// `(1-beta)` over time from `t = [0,1]`.
///
/// Uses the squared-cosine `alpha_bar` from [Improved DDPM](https://arxiv.org/abs/2102.09672); every beta is clipped
/// to `[0, max_beta]` to prevent singularities as `t` approaches `1`.
pub(crate) fn betas_for_alpha_bar(num_diffusion_timesteps: usize, max_beta: f64) -> Array1<f32> {
	let alpha_bar = |time_step: f64| ((time_step + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
	(0..num_diffusion_timesteps)
		.map(|i| {
			let t1 = i as f64 / num_diffusion_timesteps as f64;
			let t2 = (i + 1) as f64 / num_diffusion_timesteps as f64;
			(1.0 - alpha_bar(t2) / alpha_bar(t1)).clamp(0.0, max_beta) as f32
		})
		.collect()
}

/// Coefficient arrays precomputed from a beta schedule, indexed by training timestep.
///
/// The base schedule (`betas`, `alphas`, `alphas_cumprod`) is accumulated in single precision, matching the tables
/// diffusion checkpoints are trained against; everything derived from it is computed in double precision. The table
/// is read-only once built, so equal configs always produce bit-identical tables.
#[derive(Debug, Clone, PartialEq)]
pub struct CoefficientTable {
	betas: Array1<f64>,
	alphas: Array1<f64>,
	alphas_cumprod: Array1<f64>,
	alphas_cumprod_prev: Array1<f64>,
	sqrt_recip_alphas_cumprod: Array1<f64>,
	sqrt_recipm1_alphas_cumprod: Array1<f64>,
	posterior_variance: Array1<f64>,
	posterior_log_variance_clipped: Array1<f64>,
	posterior_mean_coef1: Array1<f64>,
	posterior_mean_coef2: Array1<f64>
}

impl CoefficientTable {
	/// Builds the coefficient table.
	///
	/// # Parameters
	/// - **`num_train_timesteps`**: number of diffusion steps used to train the model.
	/// - **`beta_start`**: the starting `beta` value of inference.
	/// - **`beta_end`**: the final `beta` value.
	/// - **`beta_schedule`**: the beta schedule, a mapping from a beta range to a sequence of betas for stepping the
	///   model; see [`BetaSchedule`]. Ignored if `trained_betas` is given.
	/// - **`trained_betas`**: explicit betas, bypassing `beta_start`, `beta_end` and `beta_schedule`.
	///
	/// # Errors
	/// Fails with [`SchedulerError::InvalidConfig`] if:
	/// - `num_train_timesteps` is 0
	/// - `beta_start` or `beta_end` are not normal numbers (not zero, infinite, `NaN`, or subnormal)
	/// - `beta_end` is less than or equal to `beta_start`
	/// - `trained_betas` does not contain exactly `num_train_timesteps` values
	pub fn new(
		num_train_timesteps: usize,
		beta_start: f64,
		beta_end: f64,
		beta_schedule: BetaSchedule,
		trained_betas: Option<&[f32]>
	) -> anyhow::Result<Self> {
		Self::validate(num_train_timesteps, beta_start, beta_end, beta_schedule, trained_betas)?;

		let betas = match trained_betas {
			Some(betas) => Array1::from(betas.to_vec()),
			None => match beta_schedule {
				BetaSchedule::Linear => Array1::linspace(beta_start, beta_end, num_train_timesteps).mapv(|b| b as f32),
				BetaSchedule::ScaledLinear => {
					let mut betas = Array1::linspace(beta_start.sqrt(), beta_end.sqrt(), num_train_timesteps).mapv(|b| b as f32);
					betas.par_map_inplace(|f| *f = f.powi(2));
					betas
				}
				BetaSchedule::SquaredcosCapV2 => betas_for_alpha_bar(num_train_timesteps, 0.999)
			}
		};

		let alphas = betas.mapv(|beta| 1.0 - beta);

		let alphas_cumprod = alphas
			.view()
			.into_iter()
			.scan(1.0_f32, |prod, alpha| {
				*prod *= *alpha;
				Some(*prod)
			})
			.collect::<Array1<_>>();

		let betas = betas.mapv(f64::from);
		let alphas = alphas.mapv(f64::from);
		let alphas_cumprod = alphas_cumprod.mapv(f64::from);

		let mut alphas_cumprod_prev = Array1::ones(num_train_timesteps);
		alphas_cumprod_prev.slice_mut(ndarray::s![1..]).assign(&alphas_cumprod.slice(ndarray::s![..-1]));

		let sqrt_recip_alphas_cumprod = alphas_cumprod.mapv(|a| (1.0 / a).sqrt());
		let sqrt_recipm1_alphas_cumprod = alphas_cumprod.mapv(|a| (1.0 / a - 1.0).sqrt());

		// q(x_{t-1} | x_t, x_0)
		let posterior_variance = Zip::from(&betas)
			.and(&alphas_cumprod)
			.and(&alphas_cumprod_prev)
			.map_collect(|&beta, &alpha_prod, &alpha_prod_prev| beta * (1.0 - alpha_prod_prev) / (1.0 - alpha_prod));
		// the variance is 0 at the start of the chain
		let posterior_log_variance_clipped = posterior_variance.mapv(|v| v.max(1e-20).ln());
		let posterior_mean_coef1 = Zip::from(&betas)
			.and(&alphas_cumprod)
			.and(&alphas_cumprod_prev)
			.map_collect(|&beta, &alpha_prod, &alpha_prod_prev| beta * alpha_prod_prev.sqrt() / (1.0 - alpha_prod));
		let posterior_mean_coef2 = Zip::from(&alphas)
			.and(&alphas_cumprod)
			.and(&alphas_cumprod_prev)
			.map_collect(|&alpha, &alpha_prod, &alpha_prod_prev| (1.0 - alpha_prod_prev) * alpha.sqrt() / (1.0 - alpha_prod));

		tracing::debug!(num_train_timesteps, %beta_schedule, trained = trained_betas.is_some(), "built coefficient table");

		Ok(Self {
			betas,
			alphas,
			alphas_cumprod,
			alphas_cumprod_prev,
			sqrt_recip_alphas_cumprod,
			sqrt_recipm1_alphas_cumprod,
			posterior_variance,
			posterior_log_variance_clipped,
			posterior_mean_coef1,
			posterior_mean_coef2
		})
	}

	/// Checks the parameters of [`CoefficientTable::new`] without building the table.
	pub fn validate(
		num_train_timesteps: usize,
		beta_start: f64,
		beta_end: f64,
		beta_schedule: BetaSchedule,
		trained_betas: Option<&[f32]>
	) -> anyhow::Result<()> {
		if num_train_timesteps == 0 {
			anyhow::bail!(SchedulerError::invalid_config(format!("num_train_timesteps ({num_train_timesteps}) must be >0")));
		}

		match trained_betas {
			Some(betas) if betas.len() != num_train_timesteps => {
				anyhow::bail!(SchedulerError::invalid_config(format!("got {} trained betas for {num_train_timesteps} train timesteps", betas.len())));
			}
			Some(_) => {}
			None if beta_schedule != BetaSchedule::SquaredcosCapV2 => {
				if !beta_start.is_normal() || !beta_end.is_normal() {
					anyhow::bail!(SchedulerError::invalid_config(format!(
						"beta_start ({beta_start}) and beta_end ({beta_end}) must be normal (not zero, infinite, NaN, or subnormal)"
					)));
				}
				if beta_start >= beta_end {
					anyhow::bail!(SchedulerError::invalid_config("beta_start must be < beta_end"));
				}
			}
			None => {}
		}
		Ok(())
	}

	/// The number of training timesteps covered by this table.
	pub fn len(&self) -> usize {
		self.betas.len()
	}

	/// Always `false`; a table covers at least one timestep.
	pub fn is_empty(&self) -> bool {
		self.betas.is_empty()
	}

	/// Fails with [`SchedulerError::TimestepOutOfRange`] unless `timestep` indexes this table.
	pub fn check_timestep(&self, timestep: usize) -> anyhow::Result<usize> {
		if timestep >= self.len() {
			anyhow::bail!(SchedulerError::TimestepOutOfRange { timestep, len: self.len() });
		}
		Ok(timestep)
	}

	/// `beta_t`, the noise variance added at each training timestep.
	pub fn betas(&self) -> ArrayView1<'_, f64> {
		self.betas.view()
	}

	/// `alpha_t = 1 - beta_t`.
	pub fn alphas(&self) -> ArrayView1<'_, f64> {
		self.alphas.view()
	}

	/// `ᾱ_t`, the cumulative product of `alpha` up to and including `t`.
	pub fn alphas_cumprod(&self) -> ArrayView1<'_, f64> {
		self.alphas_cumprod.view()
	}

	/// `ᾱ_{t-1}`, with `ᾱ_{-1} = 1`.
	pub fn alphas_cumprod_prev(&self) -> ArrayView1<'_, f64> {
		self.alphas_cumprod_prev.view()
	}

	/// `sqrt(1 / ᾱ_t)`.
	pub fn sqrt_recip_alphas_cumprod(&self) -> ArrayView1<'_, f64> {
		self.sqrt_recip_alphas_cumprod.view()
	}

	/// `sqrt(1 / ᾱ_t - 1)`.
	pub fn sqrt_recipm1_alphas_cumprod(&self) -> ArrayView1<'_, f64> {
		self.sqrt_recipm1_alphas_cumprod.view()
	}

	/// Variance of the posterior `q(x_{t-1} | x_t, x_0)`.
	pub fn posterior_variance(&self) -> ArrayView1<'_, f64> {
		self.posterior_variance.view()
	}

	/// `ln(max(posterior_variance, 1e-20))`.
	pub fn posterior_log_variance_clipped(&self) -> ArrayView1<'_, f64> {
		self.posterior_log_variance_clipped.view()
	}

	/// Weight of the predicted `x_0` in the posterior mean.
	pub fn posterior_mean_coef1(&self) -> ArrayView1<'_, f64> {
		self.posterior_mean_coef1.view()
	}

	/// Weight of the current sample `x_t` in the posterior mean.
	pub fn posterior_mean_coef2(&self) -> ArrayView1<'_, f64> {
		self.posterior_mean_coef2.view()
	}
}
