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

//! Runs a short DDPM ancestral sampling loop twice: once assembling every update by hand from the scheduler's
//! coefficient table, once with `DDPMScheduler::step_with_noise`, and logs how far the two drift apart.
//!
//! `RUST_LOG=debug cargo run --example sample-loop` also shows the scheduler's own logs.

use ndarray::{Array4, Zip};
use pyke_schedulers::{BetaSchedule, DDPMScheduler, DDPMSchedulerConfig, DDPMVarianceType, DiffusionScheduler, SchedulerTensor};
use rand::{rngs::StdRng, SeedableRng};
use tracing_subscriber::EnvFilter;

const NUM_TRAIN_TIMESTEPS: usize = 10;

/// A stand-in for a trained network: shrinks the sample a little more at every timestep.
fn toy_model(sample: &Array4<f64>, timestep: usize) -> Array4<f64> {
	let t = timestep as f64;
	sample.mapv(|v| v * t / (t + 1.0))
}

fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let scheduler = DDPMScheduler::new(&DDPMSchedulerConfig {
		num_train_timesteps: NUM_TRAIN_TIMESTEPS,
		beta_schedule: BetaSchedule::SquaredcosCapV2,
		variance_type: DDPMVarianceType::FixedSmallLog,
		..Default::default()
	})?;
	let table = scheduler.table();

	let mut rng = StdRng::seed_from_u64(42);
	let noise = Array4::<f64>::zeros((1, 3, 8, 8)).randn_like(&mut rng)?;
	let mut by_hand = scheduler.initial_sample(&noise)?;
	let mut stepped = by_hand.clone();

	for &t in scheduler.timesteps() {
		// both loops consume the same draw
		let mut step_rng = rng.clone();
		let z = by_hand.randn_like(&mut rng)?;

		let model_output = toy_model(&by_hand, t);
		let mut pred_original_sample = &by_hand * table.sqrt_recip_alphas_cumprod()[t] - &model_output * table.sqrt_recipm1_alphas_cumprod()[t];
		pred_original_sample.mapv_inplace(|v| v.clamp(-1.0, 1.0));
		let mut mean = &pred_original_sample * table.posterior_mean_coef1()[t] + &by_hand * table.posterior_mean_coef2()[t];
		if t > 0 {
			let std = (0.5 * scheduler.get_variance(t)?).exp();
			Zip::from(&mut mean).and(&z).for_each(|m, &z| *m += std * z);
		}
		by_hand = mean;

		let model_output = toy_model(&stepped, t);
		stepped = scheduler.step_with_noise(&model_output, t, &stepped, &mut step_rng)?.into_prev_sample();

		let discrepancy = (&by_hand - &stepped).mapv(f64::abs).fold(0.0_f64, |acc, &v| acc.max(v));
		tracing::info!(timestep = t, discrepancy, "step");
	}

	tracing::info!(
		hand_mean = by_hand.mapv(f64::abs).mean().unwrap_or_default(),
		scheduler_mean = stepped.mapv(f64::abs).mean().unwrap_or_default(),
		"done"
	);

	Ok(())
}
