//! Persisting scheduler hyperparameters.
//!
//! Every scheduler is described by a strongly typed, serde-derived config struct. [`ConfigMixin`] is the shared
//! boundary for turning a scheduler into that config and back, and for storing it as `scheduler_config.json` in a
//! model directory:
//! ```ignore
//! let scheduler = DDIMScheduler::new(&DDIMSchedulerConfig { clip_sample: false, ..Default::default() })?;
//! scheduler.save_config("./my-model/")?;
//!
//! let restored = DDIMScheduler::from_pretrained("./my-model/")?;
//! ```

use std::{
	fs,
	io::{BufWriter, Write},
	path::{Path, PathBuf}
};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

use crate::SchedulerError;

/// Key storing the name of the type a config was saved from.
const CLASS_NAME_KEY: &str = "_class_name";

/// A type that can be built from, and saved as, a serializable config.
pub trait ConfigMixin: Sized {
	/// The hyperparameters this type is constructed from.
	type Config: Serialize + DeserializeOwned + Clone + std::fmt::Debug;

	/// The name stored under `_class_name` when saving; loading a config saved by another type fails.
	const CLASS_NAME: &'static str;

	/// The file name the config is stored as inside a model directory.
	const CONFIG_NAME: &'static str = "scheduler_config.json";

	/// Returns the config this instance was constructed with.
	fn config(&self) -> &Self::Config;

	/// Constructs a new instance from a config.
	///
	/// # Errors
	/// Fails with [`SchedulerError::InvalidConfig`] if the config does not describe a valid instance.
	fn from_config(config: &Self::Config) -> anyhow::Result<Self>;

	/// Writes this instance's config to `<directory>/scheduler_config.json`, creating `directory` if needed.
	///
	/// The file is written to a temporary file in the same directory first and moved into place once complete, so an
	/// existing config is never left half-written.
	fn save_config(&self, directory: impl AsRef<Path>) -> anyhow::Result<PathBuf> {
		let directory = directory.as_ref();
		fs::create_dir_all(directory)?;

		let mut value = serde_json::to_value(self.config())?;
		match &mut value {
			Value::Object(map) => {
				map.insert(CLASS_NAME_KEY.to_string(), Value::String(Self::CLASS_NAME.to_string()));
			}
			_ => anyhow::bail!(SchedulerError::invalid_config(format!("{} config does not serialize to a JSON object", Self::CLASS_NAME)))
		}

		let path = directory.join(Self::CONFIG_NAME);
		let temp = tempfile::NamedTempFile::new_in(directory)?;
		{
			let mut writer = BufWriter::new(temp.as_file());
			serde_json::to_writer_pretty(&mut writer, &value)?;
			writer.write_all(b"\n")?;
			writer.flush()?;
		}
		temp.persist(&path)?;

		tracing::debug!(class = Self::CLASS_NAME, path = %path.display(), "saved scheduler config");
		Ok(path)
	}

	/// Reads the config stored in `<directory>/scheduler_config.json`.
	///
	/// Keys starting with an underscore are metadata and are dropped; keys unknown to [`Self::Config`] are ignored.
	///
	/// # Errors
	/// - [`SchedulerError::MissingConfig`] if the file does not exist.
	/// - [`SchedulerError::ConfigClassMismatch`] if the config was saved by another type.
	/// - [`SchedulerError::InvalidConfig`] if the file is not a JSON object or a field has the wrong type.
	fn load_config(directory: impl AsRef<Path>) -> anyhow::Result<Self::Config> {
		let path = directory.as_ref().join(Self::CONFIG_NAME);
		if !path.is_file() {
			anyhow::bail!(SchedulerError::MissingConfig(path));
		}

		let value: Value = serde_json::from_slice(&fs::read(&path)?).map_err(|e| SchedulerError::invalid_config(format!("{}: {e}", path.display())))?;
		let Value::Object(map) = value else {
			anyhow::bail!(SchedulerError::invalid_config(format!("{} does not contain a JSON object", path.display())));
		};

		if let Some(found) = map.get(CLASS_NAME_KEY) {
			let found = found.as_str().unwrap_or_default();
			if found != Self::CLASS_NAME {
				anyhow::bail!(SchedulerError::ConfigClassMismatch {
					expected: Self::CLASS_NAME,
					found: found.to_string()
				});
			}
		}

		let fields: Map<String, Value> = map.into_iter().filter(|(key, _)| !key.starts_with('_')).collect();
		let config = serde_json::from_value(Value::Object(fields)).map_err(|e| SchedulerError::invalid_config(format!("{}: {e}", path.display())))?;

		tracing::debug!(class = Self::CLASS_NAME, path = %path.display(), "loaded scheduler config");
		Ok(config)
	}

	/// Loads the config stored in `directory` and constructs a new instance from it.
	fn from_pretrained(directory: impl AsRef<Path>) -> anyhow::Result<Self> {
		Self::from_config(&Self::load_config(directory)?)
	}
}
