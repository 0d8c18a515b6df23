#![cfg(feature = "scheduler-ddim")]

mod common;

use common::*;
use pyke_schedulers::{
	BetaSchedule, ConfigMixin, DDIMScheduler, DDIMSchedulerConfig, DDIMStepOptions, DiffusionScheduler, SchedulerError, SchedulerTensor
};
use rand::{rngs::StdRng, SeedableRng};

fn check_over_configs(time_step: usize, eta: f64, num_inference_steps: usize, config: DDIMSchedulerConfig) {
	let sample = dummy_sample();
	let residual = sample.scale(0.1).unwrap();

	let mut scheduler = DDIMScheduler::new(&config).unwrap();
	let dir = tempfile::tempdir().unwrap();
	scheduler.save_config(dir.path()).unwrap();
	let mut new_scheduler = DDIMScheduler::from_pretrained(dir.path()).unwrap();
	assert_eq!(scheduler.config(), new_scheduler.config());

	scheduler.set_timesteps(num_inference_steps).unwrap();
	new_scheduler.set_timesteps(num_inference_steps).unwrap();

	let output = scheduler.step(&residual, time_step, &sample, eta, &mut StdRng::seed_from_u64(0)).unwrap().into_prev_sample();
	let new_output = new_scheduler.step(&residual, time_step, &sample, eta, &mut StdRng::seed_from_u64(0)).unwrap().into_prev_sample();
	assert!(abs_diff_sum(&output, &new_output) < 1e-5, "scheduler outputs are not identical");
}

#[test]
fn test_timesteps() {
	for num_train_timesteps in [100, 500, 1000] {
		check_over_configs(0, 0.0, 50, DDIMSchedulerConfig { num_train_timesteps, ..Default::default() });
	}
}

#[test]
fn test_betas() {
	for (beta_start, beta_end) in [(0.0001, 0.002), (0.001, 0.02), (0.01, 0.2), (0.1, 2.0)] {
		check_over_configs(0, 0.0, 50, DDIMSchedulerConfig { beta_start, beta_end, ..Default::default() });
	}
}

#[test]
fn test_schedules() {
	for beta_schedule in [BetaSchedule::Linear, BetaSchedule::ScaledLinear, BetaSchedule::SquaredcosCapV2] {
		check_over_configs(0, 0.0, 50, DDIMSchedulerConfig { beta_schedule, ..Default::default() });
	}
}

#[test]
fn test_clip_sample() {
	for clip_sample in [true, false] {
		check_over_configs(0, 0.0, 50, DDIMSchedulerConfig { clip_sample, ..Default::default() });
	}
}

#[test]
fn test_time_indices() {
	for t in [1, 10, 49] {
		check_over_configs(t, 0.0, 50, DDIMSchedulerConfig::default());
	}
}

#[test]
fn test_inference_steps() {
	for (t, num_inference_steps) in [(1, 10), (10, 50), (50, 500)] {
		check_over_configs(t, 0.0, num_inference_steps, DDIMSchedulerConfig::default());
	}
}

#[test]
fn test_eta() {
	for (t, eta) in [(1, 0.0), (10, 0.5), (50, 1.0)] {
		check_over_configs(t, eta, 50, DDIMSchedulerConfig::default());
	}
}

#[test]
fn test_set_timesteps() {
	let mut scheduler = DDIMScheduler::new(&DDIMSchedulerConfig::default()).unwrap();
	assert_eq!(scheduler.timesteps().len(), 1000);
	assert_eq!(scheduler.num_inference_steps(), None);

	scheduler.set_timesteps(10).unwrap();
	assert_eq!(scheduler.timesteps().to_vec(), vec![900, 800, 700, 600, 500, 400, 300, 200, 100, 0]);
	assert_eq!(scheduler.num_inference_steps(), Some(10));

	for num_inference_steps in [0, 1001] {
		let err = scheduler.set_timesteps(num_inference_steps).unwrap_err();
		assert!(matches!(err.downcast_ref::<SchedulerError>(), Some(SchedulerError::InvalidConfig(_))));
	}
}

#[test]
fn test_step_requires_timesteps() {
	let scheduler = DDIMScheduler::new(&DDIMSchedulerConfig::default()).unwrap();
	let sample = dummy_sample();
	let err = scheduler.step(&sample, 10, &sample, 0.0, &mut StdRng::seed_from_u64(0)).unwrap_err();
	assert!(matches!(err.downcast_ref::<SchedulerError>(), Some(SchedulerError::TimestepsNotSet)));
}

#[test]
fn test_step_shape() {
	let mut scheduler = DDIMScheduler::new(&DDIMSchedulerConfig::default()).unwrap();
	scheduler.set_timesteps(50).unwrap();
	let sample = dummy_sample();
	let residual = sample.scale(0.1).unwrap();

	let mut rng = StdRng::seed_from_u64(0);
	let output_0 = scheduler.step(&residual, 0, &sample, 0.0, &mut rng).unwrap().into_prev_sample();
	let output_1 = scheduler.step(&residual, 1, &sample, 0.0, &mut rng).unwrap().into_prev_sample();
	assert_eq!(output_0.shape(), sample.shape());
	assert_eq!(output_0.shape(), output_1.shape());
}

#[test]
fn test_variance() {
	let scheduler = DDIMScheduler::new(&DDIMSchedulerConfig::default()).unwrap();
	assert_eq!(scheduler.get_variance(0, 0).unwrap(), 0.0);
	assert!((scheduler.get_variance(420, 400).unwrap() - 0.14771).abs() < 1e-5);
	assert!((scheduler.get_variance(980, 960).unwrap() - 0.32460).abs() < 1e-5);
	assert!((scheduler.get_variance(487, 486).unwrap() - 0.00979).abs() < 1e-5);
	assert!((scheduler.get_variance(999, 998).unwrap() - 0.02).abs() < 1e-5);
}

#[test]
fn test_full_loop_no_noise() {
	let mut scheduler = DDIMScheduler::new(&DDIMSchedulerConfig::default()).unwrap();
	let mut rng = StdRng::seed_from_u64(0);
	let mut sample = dummy_sample_deter();

	scheduler.set_timesteps(10).unwrap();
	for &t in scheduler.timesteps() {
		let residual = dummy_model(&sample, t as f64).unwrap();
		sample = scheduler.step(&residual, t, &sample, 0.0, &mut rng).unwrap().into_prev_sample();
	}

	assert!((abs_sum(&sample) - 172.0067).abs() < 1e-2);
	assert!((abs_mean(&sample) - 0.223967).abs() < 1e-3);
}

#[test]
fn test_eta_adds_noise() {
	let mut scheduler = DDIMScheduler::new(&DDIMSchedulerConfig::default()).unwrap();
	scheduler.set_timesteps(50).unwrap();
	let sample = dummy_sample();
	let residual = sample.scale(0.1).unwrap();

	let deterministic = scheduler.step(&residual, 500, &sample, 0.0, &mut StdRng::seed_from_u64(1)).unwrap().into_prev_sample();
	let repeated = scheduler.step(&residual, 500, &sample, 0.0, &mut StdRng::seed_from_u64(2)).unwrap().into_prev_sample();
	assert_eq!(deterministic, repeated);

	let noisy = scheduler.step(&residual, 500, &sample, 1.0, &mut StdRng::seed_from_u64(1)).unwrap().into_prev_sample();
	assert!(abs_diff_sum(&deterministic, &noisy) > 1e-3);
}

#[test]
fn test_use_clipped_model_output() {
	let mut scheduler = DDIMScheduler::new(&DDIMSchedulerConfig::default()).unwrap();
	scheduler.set_timesteps(50).unwrap();
	let sample = dummy_sample().scale(4.0).unwrap();
	let residual = dummy_sample().scale(-2.0).unwrap();

	let options = DDIMStepOptions { use_clipped_model_output: true, ..Default::default() };
	let output = scheduler.step_with_options(&residual, 500, &sample, &options, &mut StdRng::seed_from_u64(0)).unwrap();
	let pred_original_sample = output.pred_original_sample().unwrap();
	assert!(pred_original_sample.iter().all(|v| (-1.0..=1.0).contains(v)));

	let plain = scheduler.step(&residual, 500, &sample, 0.0, &mut StdRng::seed_from_u64(0)).unwrap().into_prev_sample();
	assert!(abs_diff_sum(output.prev_sample(), &plain) > 1e-3);
}

#[test]
fn test_final_alpha_cumprod() {
	let sample = dummy_sample();
	let residual = sample.scale(0.1).unwrap();
	let step_from_zero = |set_alpha_to_one| {
		let mut scheduler = DDIMScheduler::new(&DDIMSchedulerConfig { set_alpha_to_one, clip_sample: false, ..Default::default() }).unwrap();
		scheduler.set_timesteps(50).unwrap();
		assert_eq!(scheduler.get_variance(0, -20).unwrap(), 0.0);
		scheduler.step(&residual, 0, &sample, 0.0, &mut StdRng::seed_from_u64(0)).unwrap()
	};

	// stepping to ᾱ[0] from timestep 0 leaves the sample unchanged
	let output = step_from_zero(false);
	assert!(abs_diff_sum(output.prev_sample(), &sample) < 1e-9);

	// with ᾱ_prev = 1, the step lands on the predicted original sample
	let output = step_from_zero(true);
	assert!(abs_diff_sum(output.prev_sample(), output.pred_original_sample().unwrap()) < 1e-9);
	assert!(abs_diff_sum(output.prev_sample(), &sample) > 1e-3);
}
