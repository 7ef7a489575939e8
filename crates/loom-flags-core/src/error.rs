// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

/// Errors that can occur while evaluating flags or handling evaluation contexts.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FlagsError {
	#[error("flag not found: {0}")]
	FlagNotFound(String),

	#[error("evaluation engine is not ready")]
	NotReady,

	#[error("evaluation of '{flag_key}' failed: {message}")]
	Evaluation { flag_key: String, message: String },

	#[error("'{0}' has an invalid type, only 'string', 'number', and 'string[]' types are allowed")]
	InvalidAttribute(String),

	#[error("serialization error: {0}")]
	Serialization(String),

	#[error("internal error: {0}")]
	Internal(String),
}

impl From<serde_json::Error> for FlagsError {
	fn from(err: serde_json::Error) -> Self {
		FlagsError::Serialization(err.to_string())
	}
}

pub type Result<T> = std::result::Result<T, FlagsError>;
