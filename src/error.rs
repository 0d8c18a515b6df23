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

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by schedulers and their configuration.
///
/// Fallible functions in this crate return [`anyhow::Result`]; use [`anyhow::Error::downcast_ref`] to recover the
/// concrete kind:
/// ```ignore
/// if let Some(SchedulerError::InsufficientHistory { .. }) = err.downcast_ref::<SchedulerError>() {
/// 	// run the Runge-Kutta warmup first
/// }
/// ```
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SchedulerError {
	/// A hyperparameter (or combination of hyperparameters) is invalid or unsupported.
	#[error("invalid scheduler config: {0}")]
	InvalidConfig(String),
	/// A timestep or step index lies outside of the schedule.
	#[error("timestep {timestep} out of this scheduler's bounds (len {len})")]
	TimestepOutOfRange {
		/// The requested timestep or index.
		timestep: usize,
		/// The length of the schedule it was checked against.
		len: usize
	},
	/// The scheduler requires an inference schedule, but `set_timesteps`/`set_sigmas` has not been called.
	#[error("no inference schedule has been set; call `set_timesteps` first")]
	TimestepsNotSet,
	/// A linear multistep update was requested without enough past residuals.
	#[error(
		"linear multistep stepping needs {required} residuals including the current one, but only {available} are available; warm up with Runge-Kutta steps first"
	)]
	InsufficientHistory {
		/// Residuals needed for the update, including the current one.
		required: usize,
		/// Residuals that would be available, including the current one.
		available: usize
	},
	/// The stored configuration belongs to a different scheduler.
	#[error("config was saved by `{found}`, cannot load it as `{expected}`")]
	ConfigClassMismatch {
		/// The type the config was loaded as.
		expected: &'static str,
		/// The `_class_name` stored in the config.
		found: String
	},
	/// No configuration file was found.
	#[error("no scheduler config found at {0}")]
	MissingConfig(PathBuf)
}

impl SchedulerError {
	pub(crate) fn invalid_config(msg: impl Into<String>) -> Self {
		Self::InvalidConfig(msg.into())
	}
}
