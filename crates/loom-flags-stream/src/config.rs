// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Stream configuration: defaults, an optional TOML file, then environment.
//!
//! Environment variables follow `LOOM_FLAGS_STREAM_<FIELD>` and override the
//! file. The file carries the same fields under a `[stream]` table:
//!
//! ```toml
//! [stream]
//! mailbox_capacity = 128
//! command_queue_capacity = 256
//! delivery = "drop_newest"
//! server_type = "sse"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{ConfigError, Result};

const DEFAULT_MAILBOX_CAPACITY: usize = 128;
const DEFAULT_COMMAND_QUEUE_CAPACITY: usize = 256;
const DEFAULT_SERVER_TYPE: &str = "stream";

/// What the worker does when a connection's mailbox is full.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
	/// Skip the payload for that connection and count it as dropped.
	#[default]
	DropNewest,
	/// Wait for mailbox capacity. A stalled reader stalls its whole project.
	Block,
}

impl FromStr for DeliveryPolicy {
	type Err = String;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
			"drop_newest" => Ok(DeliveryPolicy::DropNewest),
			"block" => Ok(DeliveryPolicy::Block),
			other => Err(format!(
				"unknown delivery policy '{other}', expected 'drop_newest' or 'block'"
			)),
		}
	}
}

impl fmt::Display for DeliveryPolicy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			DeliveryPolicy::DropNewest => write!(f, "drop_newest"),
			DeliveryPolicy::Block => write!(f, "block"),
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamConfigLayer {
	pub mailbox_capacity: Option<usize>,
	pub command_queue_capacity: Option<usize>,
	pub delivery: Option<DeliveryPolicy>,
	pub server_type: Option<String>,
}

impl StreamConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.mailbox_capacity.is_some() {
			self.mailbox_capacity = other.mailbox_capacity;
		}
		if other.command_queue_capacity.is_some() {
			self.command_queue_capacity = other.command_queue_capacity;
		}
		if other.delivery.is_some() {
			self.delivery = other.delivery;
		}
		if other.server_type.is_some() {
			self.server_type = other.server_type;
		}
	}

	pub fn finalize(self) -> Result<StreamConfig> {
		let mailbox_capacity = non_zero(
			"mailbox_capacity",
			self.mailbox_capacity.unwrap_or(DEFAULT_MAILBOX_CAPACITY),
		)?;
		let command_queue_capacity = non_zero(
			"command_queue_capacity",
			self
				.command_queue_capacity
				.unwrap_or(DEFAULT_COMMAND_QUEUE_CAPACITY),
		)?;

		Ok(StreamConfig {
			mailbox_capacity,
			command_queue_capacity,
			delivery: self.delivery.unwrap_or_default(),
			server_type: self
				.server_type
				.unwrap_or_else(|| DEFAULT_SERVER_TYPE.to_string()),
		})
	}
}

fn non_zero(key: &str, value: usize) -> Result<usize> {
	if value == 0 {
		return Err(ConfigError::InvalidValue {
			key: key.to_string(),
			message: "must be greater than zero".to_string(),
		});
	}
	Ok(value)
}

/// Resolved settings shared by every stream of a server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamConfig {
	/// Bound of each connection's mailbox.
	pub mailbox_capacity: usize,
	/// Bound of a stream's inbound lifecycle queue.
	pub command_queue_capacity: usize,
	pub delivery: DeliveryPolicy,
	/// Label attached to metrics and logs, e.g. `"sse"` or `"grpc"`.
	pub server_type: String,
}

impl Default for StreamConfig {
	fn default() -> Self {
		Self {
			mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
			command_queue_capacity: DEFAULT_COMMAND_QUEUE_CAPACITY,
			delivery: DeliveryPolicy::default(),
			server_type: DEFAULT_SERVER_TYPE.to_string(),
		}
	}
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
	#[serde(default)]
	stream: StreamConfigLayer,
}

/// Loads configuration from `path` (skipped when missing) and the environment.
pub fn load_config_with_file(path: impl Into<PathBuf>) -> Result<StreamConfig> {
	let path: PathBuf = path.into();
	let mut merged = StreamConfigLayer::default();
	merged.merge(load_file(&path)?);
	merged.merge(layer_from_env()?);
	merged.finalize()
}

/// Loads configuration from the environment only.
pub fn load_config_from_env() -> Result<StreamConfig> {
	layer_from_env()?.finalize()
}

fn load_file(path: &Path) -> Result<StreamConfigLayer> {
	if !path.exists() {
		debug!(path = %path.display(), "stream config file not found, skipping");
		return Ok(StreamConfigLayer::default());
	}

	debug!(path = %path.display(), "loading stream config file");
	let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
		path: path.to_path_buf(),
		source: e,
	})?;
	let file: ConfigFile = toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
		path: path.to_path_buf(),
		source: e,
	})?;

	trace!("parsed stream config layer from TOML");
	Ok(file.stream)
}

fn layer_from_env() -> Result<StreamConfigLayer> {
	layer_from_lookup(|name| std::env::var(name).ok())
}

fn layer_from_lookup<F>(lookup: F) -> Result<StreamConfigLayer>
where
	F: Fn(&str) -> Option<String>,
{
	let var = |name: &str| lookup(name).filter(|s| !s.is_empty());
	let usize_var = |name: &str| -> Result<Option<usize>> {
		match var(name) {
			Some(v) => v.trim().parse().map(Some).map_err(|_| ConfigError::InvalidValue {
				key: name.to_string(),
				message: format!("invalid usize value '{v}'"),
			}),
			None => Ok(None),
		}
	};

	let delivery = match var("LOOM_FLAGS_STREAM_DELIVERY") {
		Some(v) => Some(v.parse().map_err(|message| ConfigError::InvalidValue {
			key: "LOOM_FLAGS_STREAM_DELIVERY".to_string(),
			message,
		})?),
		None => None,
	};

	Ok(StreamConfigLayer {
		mailbox_capacity: usize_var("LOOM_FLAGS_STREAM_MAILBOX_CAPACITY")?,
		command_queue_capacity: usize_var("LOOM_FLAGS_STREAM_COMMAND_QUEUE_CAPACITY")?,
		delivery,
		server_type: var("LOOM_FLAGS_STREAM_SERVER_TYPE"),
	})
}
