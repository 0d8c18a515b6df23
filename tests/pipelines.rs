#![cfg(feature = "scheduler-ddpm")]

mod common;

use std::{cell::RefCell, rc::Rc};

use common::*;
use ndarray::Array4;
use pyke_schedulers::{DDPMPipeline, DDPMScheduler, DDPMSchedulerConfig, SamplingOptions};
use rand::{rngs::StdRng, SeedableRng};

fn pipeline() -> DDPMPipeline {
	DDPMPipeline::new(DDPMScheduler::new(&DDPMSchedulerConfig { num_train_timesteps: 20, ..Default::default() }).unwrap())
}

fn generate(pipeline: &DDPMPipeline, options: &SamplingOptions, seed: u64) -> (Array4<f64>, usize) {
	let mut evaluations = 0;
	let mut model = |x: &Array4<f64>, t: f64| {
		evaluations += 1;
		dummy_model(x, t)
	};
	let image = pipeline.generate(&mut model, &dummy_sample(), options, &mut StdRng::seed_from_u64(seed)).unwrap();
	(image, evaluations)
}

#[test]
fn test_ddpm_pipeline_is_seeded() {
	let pipeline = pipeline();
	let options = SamplingOptions::default();

	let (image, evaluations) = generate(&pipeline, &options, 0);
	assert_eq!(image.shape(), &[SHAPE.0, SHAPE.1, SHAPE.2, SHAPE.3]);
	assert!(image.iter().all(|v| v.is_finite()));
	assert_eq!(evaluations, 20);

	let (same_seed, _) = generate(&pipeline, &options, 0);
	assert_eq!(image, same_seed);
	let (other_seed, _) = generate(&pipeline, &options, 1);
	assert!(abs_diff_sum(&image, &other_seed) > 1e-3);
}

#[test]
fn test_callback_frequency() {
	let calls = Rc::new(RefCell::new(Vec::new()));
	let options = SamplingOptions::default().callback_progress(5, {
		let calls = Rc::clone(&calls);
		move |step, timestep| {
			calls.borrow_mut().push((step, timestep));
			true
		}
	});

	let (_, evaluations) = generate(&pipeline(), &options, 0);
	assert_eq!(evaluations, 20);
	assert_eq!(*calls.borrow(), vec![(0, 19.0), (5, 14.0), (10, 9.0), (15, 4.0)]);
}

#[test]
fn test_callback_stops_sampling() {
	let calls = Rc::new(RefCell::new(0));
	let options = SamplingOptions::default().callback_progress(5, {
		let calls = Rc::clone(&calls);
		move |step, _| {
			*calls.borrow_mut() += 1;
			step < 10
		}
	});

	let (stopped, evaluations) = generate(&pipeline(), &options, 0);
	assert_eq!(*calls.borrow(), 3);
	assert_eq!(evaluations, 11);

	let (full, _) = generate(&pipeline(), &SamplingOptions::default(), 0);
	assert!(abs_diff_sum(&stopped, &full) > 1e-3);
}
