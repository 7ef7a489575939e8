// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a configured flag project (one evaluation engine per project).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ProjectId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for ProjectId {
	fn from(id: &str) -> Self {
		Self::new(id)
	}
}

impl From<String> for ProjectId {
	fn from(id: String) -> Self {
		Self(id)
	}
}

/// What a streaming connection watches: one flag, or every flag of the project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Selector {
	Flag(String),
	AllFlags,
}

impl Selector {
	/// Reserved key that selects every flag.
	pub const ALL_FLAGS_KEY: &'static str = "[ALL]";

	pub fn flag(key: impl Into<String>) -> Self {
		Selector::Flag(key.into())
	}

	/// Interprets a raw key as sent by protocol adapters.
	pub fn parse(key: &str) -> Self {
		if key == Self::ALL_FLAGS_KEY {
			Selector::AllFlags
		} else {
			Selector::Flag(key.to_string())
		}
	}

	pub fn as_str(&self) -> &str {
		match self {
			Selector::Flag(key) => key,
			Selector::AllFlags => Self::ALL_FLAGS_KEY,
		}
	}

	pub fn is_all_flags(&self) -> bool {
		matches!(self, Selector::AllFlags)
	}
}

impl fmt::Display for Selector {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// The scalar value a flag evaluates to.
///
/// Serialized untagged so clients receive the bare JSON value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum VariantValue {
	Boolean(bool),
	Integer(i64),
	Float(f64),
	String(String),
}

impl VariantValue {
	pub fn as_bool(&self) -> Option<bool> {
		match self {
			VariantValue::Boolean(b) => Some(*b),
			_ => None,
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			VariantValue::String(s) => Some(s),
			_ => None,
		}
	}
}

impl From<bool> for VariantValue {
	fn from(value: bool) -> Self {
		VariantValue::Boolean(value)
	}
}

impl From<i64> for VariantValue {
	fn from(value: i64) -> Self {
		VariantValue::Integer(value)
	}
}

impl From<f64> for VariantValue {
	fn from(value: f64) -> Self {
		VariantValue::Float(value)
	}
}

impl From<&str> for VariantValue {
	fn from(value: &str) -> Self {
		VariantValue::String(value.to_string())
	}
}

impl From<String> for VariantValue {
	fn from(value: String) -> Self {
		VariantValue::String(value)
	}
}
