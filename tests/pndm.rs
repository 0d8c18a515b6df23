#![cfg(feature = "scheduler-pndm")]

mod common;

use common::*;
use ndarray::Array4;
use pyke_schedulers::{
	BetaSchedule, ConfigMixin, DiffusionScheduler, PNDMMode, PNDMPipeline, PNDMScheduler, PNDMSchedulerConfig, SamplingOptions, SchedulerError,
	SchedulerTensor
};

type Scheduler = PNDMScheduler<Array4<f64>>;

/// Seeds the residual history the way a resumed run would.
fn dummy_past_residuals(residual: &Array4<f64>) -> Vec<Array4<f64>> {
	[0.1, 0.05, 0.01, 0.001].iter().map(|&f| residual.affine(1.0, f).unwrap()).collect()
}

fn check_over_configs(time_step: usize, num_inference_steps: usize, config: PNDMSchedulerConfig) {
	let sample = dummy_sample();
	let residual = sample.scale(0.1).unwrap();

	let mut scheduler = Scheduler::new(&config).unwrap();
	let dir = tempfile::tempdir().unwrap();
	scheduler.save_config(dir.path()).unwrap();
	let mut new_scheduler = Scheduler::from_pretrained(dir.path()).unwrap();
	assert_eq!(scheduler.config(), new_scheduler.config());

	scheduler.set_timesteps(num_inference_steps).unwrap();
	new_scheduler.set_timesteps(num_inference_steps).unwrap();

	// pseudo Runge-Kutta
	let output = scheduler.step_prk(&residual, time_step, &sample).unwrap().into_prev_sample();
	let new_output = new_scheduler.step_prk(&residual, time_step, &sample).unwrap().into_prev_sample();
	assert!(abs_diff_sum(&output, &new_output) < 1e-5, "scheduler outputs are not identical");

	// pseudo linear multistep, from a seeded history
	scheduler.set_ets(dummy_past_residuals(&residual));
	new_scheduler.set_ets(dummy_past_residuals(&residual));
	let output = scheduler.step_plms(&residual, time_step, &sample).unwrap().into_prev_sample();
	let new_output = new_scheduler.step_plms(&residual, time_step, &sample).unwrap().into_prev_sample();
	assert!(abs_diff_sum(&output, &new_output) < 1e-5, "scheduler outputs are not identical");
}

#[test]
fn test_timesteps() {
	for num_train_timesteps in [100, 1000] {
		check_over_configs(1, 50, PNDMSchedulerConfig { num_train_timesteps, ..Default::default() });
	}
}

#[test]
fn test_betas() {
	for (beta_start, beta_end) in [(0.0001, 0.002), (0.001, 0.02), (0.01, 0.2), (0.1, 0.2)] {
		check_over_configs(1, 50, PNDMSchedulerConfig { beta_start, beta_end, ..Default::default() });
	}
}

#[test]
fn test_schedules() {
	for beta_schedule in [BetaSchedule::Linear, BetaSchedule::ScaledLinear, BetaSchedule::SquaredcosCapV2] {
		check_over_configs(1, 50, PNDMSchedulerConfig { beta_schedule, ..Default::default() });
	}
}

#[test]
fn test_time_indices() {
	for t in [1, 5, 10] {
		check_over_configs(t, 50, PNDMSchedulerConfig::default());
	}
}

#[test]
fn test_inference_steps() {
	for (t, num_inference_steps) in [(1, 10), (5, 50), (10, 100)] {
		check_over_configs(t, num_inference_steps, PNDMSchedulerConfig::default());
	}
}

#[test]
fn test_step_shape() {
	let mut scheduler = Scheduler::new(&PNDMSchedulerConfig::default()).unwrap();
	scheduler.set_timesteps(50).unwrap();
	let sample = dummy_sample();
	let residual = sample.scale(0.1).unwrap();

	let output_0 = scheduler.step_prk(&residual, 0, &sample).unwrap().into_prev_sample();
	let output_1 = scheduler.step_prk(&residual, 1, &sample).unwrap().into_prev_sample();
	assert_eq!(output_0.shape(), sample.shape());
	assert_eq!(output_0.shape(), output_1.shape());

	scheduler.set_ets(dummy_past_residuals(&residual));
	let output_0 = scheduler.step_plms(&residual, 0, &sample).unwrap().into_prev_sample();
	let output_1 = scheduler.step_plms(&residual, 1, &sample).unwrap().into_prev_sample();
	assert_eq!(output_0.shape(), sample.shape());
	assert_eq!(output_0.shape(), output_1.shape());
}

#[test]
fn test_inference_plms_no_past_residuals() {
	let mut scheduler = Scheduler::new(&PNDMSchedulerConfig::default()).unwrap();
	scheduler.set_plms_mode();
	assert_eq!(scheduler.mode(), PNDMMode::LinearMultistep);

	let sample = dummy_sample();
	let err = scheduler.step(&sample, 1, &sample).unwrap_err();
	assert!(matches!(err.downcast_ref::<SchedulerError>(), Some(SchedulerError::InsufficientHistory { required: 4, available: 1 })));

	// a failed step leaves the scheduler untouched
	assert!(scheduler.ets().is_empty());
	assert_eq!(scheduler.counter(), 0);
}

#[test]
fn test_plms_needs_three_buffered_residuals() {
	let mut scheduler = Scheduler::new(&PNDMSchedulerConfig::default()).unwrap();
	scheduler.set_timesteps(50).unwrap();
	scheduler.set_plms_mode();

	let sample = dummy_sample();
	let residual = sample.scale(0.1).unwrap();
	scheduler.set_ets(dummy_past_residuals(&residual).into_iter().take(2));
	assert!(scheduler.step(&residual, 0, &sample).is_err());
	assert_eq!(scheduler.ets().len(), 2);

	scheduler.ets_mut().push(residual.clone());
	assert!(scheduler.step(&residual, 0, &sample).is_ok());
	assert_eq!(scheduler.ets().len(), 4);
	assert_eq!(scheduler.counter(), 1);
}

#[test]
fn test_step_requires_timesteps() {
	let mut scheduler = Scheduler::new(&PNDMSchedulerConfig::default()).unwrap();
	let sample = dummy_sample();
	let err = scheduler.step_prk(&sample, 0, &sample).unwrap_err();
	assert!(matches!(err.downcast_ref::<SchedulerError>(), Some(SchedulerError::TimestepsNotSet)));
}

#[test]
fn test_full_loop_no_noise() {
	let mut scheduler = Scheduler::new(&PNDMSchedulerConfig::default()).unwrap();
	let mut sample = dummy_sample_deter();

	scheduler.set_timesteps(10).unwrap();
	let prk_timesteps = scheduler.prk_timesteps().to_owned();
	for (i, &t) in prk_timesteps.iter().enumerate() {
		let residual = dummy_model(&sample, t as f64).unwrap();
		sample = scheduler.step_prk(&residual, i, &sample).unwrap().into_prev_sample();
	}

	let plms_timesteps = scheduler.plms_timesteps().to_owned();
	for (i, &t) in plms_timesteps.iter().enumerate() {
		let residual = dummy_model(&sample, t as f64).unwrap();
		sample = scheduler.step_plms(&residual, i, &sample).unwrap().into_prev_sample();
	}

	assert!((abs_sum(&sample) - 199.1169).abs() < 1e-2);
	assert!((abs_mean(&sample) - 0.2593).abs() < 1e-3);
}

#[test]
fn test_step_dispatch_matches_manual_loop() {
	let mut manual = Scheduler::new(&PNDMSchedulerConfig::default()).unwrap();
	manual.set_timesteps(10).unwrap();
	let mut sample = dummy_sample_deter();
	let prk_timesteps = manual.prk_timesteps().to_owned();
	for (i, &t) in prk_timesteps.iter().enumerate() {
		sample = manual.step_prk(&dummy_model(&sample, t as f64).unwrap(), i, &sample).unwrap().into_prev_sample();
	}
	let plms_timesteps = manual.plms_timesteps().to_owned();
	for (i, &t) in plms_timesteps.iter().enumerate() {
		sample = manual.step_plms(&dummy_model(&sample, t as f64).unwrap(), i, &sample).unwrap().into_prev_sample();
	}

	let pipeline = PNDMPipeline::new(PNDMSchedulerConfig::default()).unwrap();
	let generated = pipeline
		.generate(&mut |x: &Array4<f64>, t: f64| dummy_model(x, t), &dummy_sample_deter(), &SamplingOptions::default().with_steps(10))
		.unwrap();

	assert!(abs_diff_sum(&sample, &generated) < 1e-9);
	assert_eq!(manual.counter(), 19);
}

#[test]
fn test_pipeline_rejects_invalid_config() {
	let config = PNDMSchedulerConfig { num_train_timesteps: 0, ..Default::default() };
	assert!(config.validate().is_err());
	let err = PNDMPipeline::new(config).unwrap_err();
	assert!(matches!(err.downcast_ref::<SchedulerError>(), Some(SchedulerError::InvalidConfig(_))));

	let config = PNDMSchedulerConfig { beta_start: 0.02, beta_end: 0.0001, ..Default::default() };
	assert!(PNDMPipeline::new(config).is_err());
	assert!(PNDMPipeline::new(PNDMSchedulerConfig::default()).is_ok());
}
