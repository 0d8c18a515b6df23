//! `pyke-schedulers` implements the noise schedulers driving diffusion models: [DDPM], [DDIM], [PNDM] and the
//! [variance exploding SDE][sde], along with the sampling loops around them.
//!
//! Schedulers are built from strongly typed configs, which can be persisted next to a model as
//! `scheduler_config.json`. They are generic over the sample type: plain [`ndarray`] arrays of `f32` or `f64` work out
//! of the box, and [candle] tensors are supported with the `candle` feature.
//!
//! The noise model is never called by a scheduler; the caller evaluates it and feeds its output to `step`:
//! ```ignore
//! use pyke_schedulers::{DDIMScheduler, DDIMSchedulerConfig, DiffusionScheduler};
//!
//! let mut scheduler = DDIMScheduler::new(&DDIMSchedulerConfig::default())?;
//! scheduler.set_timesteps(50)?;
//!
//! let mut sample = scheduler.initial_sample(&noise)?;
//! for &t in scheduler.timesteps() {
//! 	let noise_pred = unet(&sample, t)?;
//! 	sample = scheduler.step(&noise_pred, t, &sample, 0.0, &mut rng)?.into_prev_sample();
//! }
//! ```
//!
//! See [`pipelines`] for ready-made sampling loops.
//!
//! [DDPM]: https://arxiv.org/abs/2006.11239
//! [DDIM]: https://arxiv.org/abs/2010.02502
//! [PNDM]: https://arxiv.org/abs/2202.09778
//! [sde]: https://arxiv.org/abs/2011.13456
//! [candle]: https://github.com/huggingface/candle

#![warn(missing_docs)]
#![warn(rustdoc::all)]
#![warn(clippy::correctness, clippy::suspicious, clippy::complexity, clippy::perf, clippy::style)]
#![allow(clippy::tabs_in_doc_comments)]

pub mod config;
mod error;
pub mod pipelines;
pub mod schedulers;
pub mod tensor;

pub use self::config::ConfigMixin;
pub use self::error::SchedulerError;
pub use self::pipelines::*;
pub use self::schedulers::*;
pub use self::tensor::SchedulerTensor;
