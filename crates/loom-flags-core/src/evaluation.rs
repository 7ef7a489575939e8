// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::collections::BTreeMap;
use std::hash::{BuildHasher, Hash, Hasher};

use serde::{Deserialize, Serialize, Serializer};

use crate::error::FlagsError;
use crate::VariantValue;

/// A single user attribute value.
///
/// Only strings, numbers and string lists are accepted from clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
	String(String),
	Number(f64),
	List(Vec<String>),
}

impl AttributeValue {
	/// Converts a raw JSON value, naming `key` in the error when the type is unsupported.
	pub fn from_json(key: &str, value: serde_json::Value) -> Result<Self, FlagsError> {
		match value {
			serde_json::Value::String(s) => Ok(AttributeValue::String(s)),
			serde_json::Value::Number(n) => n
				.as_f64()
				.map(AttributeValue::Number)
				.ok_or_else(|| FlagsError::InvalidAttribute(key.to_string())),
			serde_json::Value::Array(items) => Ok(AttributeValue::List(
				items
					.into_iter()
					.filter_map(|item| match item {
						serde_json::Value::String(s) => Some(s),
						_ => None,
					})
					.collect(),
			)),
			_ => Err(FlagsError::InvalidAttribute(key.to_string())),
		}
	}

	/// Textual form used by rule matching.
	pub fn as_text(&self) -> Option<String> {
		match self {
			AttributeValue::String(s) => Some(s.clone()),
			AttributeValue::Number(n) => Some(n.to_string()),
			AttributeValue::List(_) => None,
		}
	}

	fn hash_into<H: Hasher>(&self, state: &mut H) {
		match self {
			AttributeValue::String(s) => {
				0u8.hash(state);
				s.hash(state);
			}
			AttributeValue::Number(n) => {
				1u8.hash(state);
				// -0.0 and 0.0 compare equal, so they must hash equal too
				let n = if *n == 0.0 { 0.0f64 } else { *n };
				n.to_bits().hash(state);
			}
			AttributeValue::List(items) => {
				2u8.hash(state);
				items.hash(state);
			}
		}
	}
}

impl From<&str> for AttributeValue {
	fn from(value: &str) -> Self {
		AttributeValue::String(value.to_string())
	}
}

impl From<String> for AttributeValue {
	fn from(value: String) -> Self {
		AttributeValue::String(value)
	}
}

impl From<f64> for AttributeValue {
	fn from(value: f64) -> Self {
		AttributeValue::Number(value)
	}
}

impl From<i64> for AttributeValue {
	fn from(value: i64) -> Self {
		AttributeValue::Number(value as f64)
	}
}

impl From<Vec<String>> for AttributeValue {
	fn from(value: Vec<String>) -> Self {
		AttributeValue::List(value)
	}
}

/// User/request attributes a flag rule may match against.
///
/// Attributes are kept sorted by key so hashing and serialization are
/// independent of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(try_from = "BTreeMap<String, serde_json::Value>")]
pub struct EvaluationContext {
	attributes: BTreeMap<String, AttributeValue>,
}

impl EvaluationContext {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_attribute(
		mut self,
		key: impl Into<String>,
		value: impl Into<AttributeValue>,
	) -> Self {
		self.attributes.insert(key.into(), value.into());
		self
	}

	pub fn get(&self, key: &str) -> Option<&AttributeValue> {
		self.attributes.get(key)
	}

	pub fn attributes(&self) -> &BTreeMap<String, AttributeValue> {
		&self.attributes
	}

	pub fn is_empty(&self) -> bool {
		self.attributes.is_empty()
	}

	/// Returns a copy of `self` with every attribute of `overrides` laid on top.
	pub fn merged_with(&self, overrides: &EvaluationContext) -> EvaluationContext {
		let mut attributes = self.attributes.clone();
		attributes.extend(
			overrides
				.attributes
				.iter()
				.map(|(k, v)| (k.clone(), v.clone())),
		);
		EvaluationContext { attributes }
	}

	/// Reduces the context to a 64-bit value for grouping connections.
	///
	/// The result depends on `seed`: equal contexts hashed with the same seed
	/// collide, while results under different seeds are unrelated.
	pub fn discriminator<S: BuildHasher>(&self, seed: &S) -> u64 {
		let mut hasher = seed.build_hasher();
		for (key, value) in &self.attributes {
			key.hash(&mut hasher);
			value.hash_into(&mut hasher);
		}
		hasher.finish()
	}
}

impl TryFrom<BTreeMap<String, serde_json::Value>> for EvaluationContext {
	type Error = FlagsError;

	fn try_from(raw: BTreeMap<String, serde_json::Value>) -> Result<Self, Self::Error> {
		let attributes = raw
			.into_iter()
			.map(|(key, value)| {
				let value = AttributeValue::from_json(&key, value)?;
				Ok((key, value))
			})
			.collect::<Result<_, FlagsError>>()?;
		Ok(Self { attributes })
	}
}

impl Serialize for EvaluationContext {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		self.attributes.serialize(serializer)
	}
}

/// Outcome of evaluating one flag for one context.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
	pub value: VariantValue,
	pub variation_id: String,
}

impl Evaluation {
	pub fn new(value: impl Into<VariantValue>, variation_id: impl Into<String>) -> Self {
		Self {
			value: value.into(),
			variation_id: variation_id.into(),
		}
	}
}

/// What a client receives for one flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationPayload {
	pub value: Option<VariantValue>,
	pub variation_id: String,
}

impl EvaluationPayload {
	/// Payload for a flag that could not be evaluated yet.
	pub fn unavailable() -> Self {
		Self {
			value: None,
			variation_id: String::new(),
		}
	}

	/// Value-level comparison: a changed variation id alone is not a change.
	pub fn has_same_value(&self, evaluation: &Evaluation) -> bool {
		self.value.as_ref() == Some(&evaluation.value)
	}
}

impl From<Evaluation> for EvaluationPayload {
	fn from(evaluation: Evaluation) -> Self {
		Self {
			value: Some(evaluation.value),
			variation_id: evaluation.variation_id,
		}
	}
}

/// A message pushed to a streaming connection.
///
/// Single-flag connections receive [`StreamPayload::Flag`]; all-flags
/// connections receive a key to payload map holding the full state on connect
/// and only the changed keys afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StreamPayload {
	Flag(EvaluationPayload),
	Flags(BTreeMap<String, EvaluationPayload>),
}

impl StreamPayload {
	pub fn as_flag(&self) -> Option<&EvaluationPayload> {
		match self {
			StreamPayload::Flag(payload) => Some(payload),
			StreamPayload::Flags(_) => None,
		}
	}

	pub fn as_flags(&self) -> Option<&BTreeMap<String, EvaluationPayload>> {
		match self {
			StreamPayload::Flags(payloads) => Some(payloads),
			StreamPayload::Flag(_) => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::hash_map::RandomState;

	#[test]
	fn test_discriminator_ignores_insertion_order() {
		let seed = RandomState::new();
		let a = EvaluationContext::new()
			.with_attribute("email", "user1@test.com")
			.with_attribute("id", "user1")
			.with_attribute("custom1", 42i64);
		let b = EvaluationContext::new()
			.with_attribute("id", "user1")
			.with_attribute("custom1", 42i64)
			.with_attribute("email", "user1@test.com");

		assert_eq!(a.discriminator(&seed), b.discriminator(&seed));
	}

	#[test]
	fn test_discriminator_differs_for_different_values() {
		let seed = RandomState::new();
		let a = EvaluationContext::new().with_attribute("id", "u1");
		let b = EvaluationContext::new().with_attribute("id", "u2");

		assert_ne!(a.discriminator(&seed), b.discriminator(&seed));
	}

	#[test]
	fn test_discriminator_distinguishes_key_from_value() {
		let seed = RandomState::new();
		let a = EvaluationContext::new().with_attribute("ab", "c");
		let b = EvaluationContext::new().with_attribute("a", "bc");

		assert_ne!(a.discriminator(&seed), b.discriminator(&seed));
	}

	#[test]
	fn test_deserialize_accepts_strings_numbers_and_lists() {
		let ctx: EvaluationContext =
			serde_json::from_str(r#"{"a":1,"b":["x","z"],"c":"test"}"#).unwrap();

		assert_eq!(ctx.get("a"), Some(&AttributeValue::Number(1.0)));
		assert_eq!(
			ctx.get("b"),
			Some(&AttributeValue::List(vec!["x".to_string(), "z".to_string()]))
		);
		assert_eq!(ctx.get("c"), Some(&AttributeValue::String("test".to_string())));
	}

	#[test]
	fn test_deserialize_rejects_booleans() {
		let err = serde_json::from_str::<EvaluationContext>(r#"{"a":true}"#).unwrap_err();
		assert!(err.to_string().contains(
			"'a' has an invalid type, only 'string', 'number', and 'string[]' types are allowed"
		));
	}

	#[test]
	fn test_merged_with_prefers_overrides() {
		let defaults = EvaluationContext::new()
			.with_attribute("a", "b")
			.with_attribute("c", "d");
		let request = EvaluationContext::new()
			.with_attribute("a", "i")
			.with_attribute("g", "j");

		let merged = defaults.merged_with(&request);
		assert_eq!(merged.get("a"), Some(&AttributeValue::from("i")));
		assert_eq!(merged.get("c"), Some(&AttributeValue::from("d")));
		assert_eq!(merged.get("g"), Some(&AttributeValue::from("j")));
	}

	#[test]
	fn test_payload_compares_values_only() {
		let payload = EvaluationPayload::from(Evaluation::new(true, "v1"));
		assert!(payload.has_same_value(&Evaluation::new(true, "v2")));
		assert!(!payload.has_same_value(&Evaluation::new(false, "v1")));
		assert!(!EvaluationPayload::unavailable().has_same_value(&Evaluation::new(false, "")));
	}

	#[test]
	fn test_stream_payload_wire_shape() {
		let single = StreamPayload::Flag(EvaluationPayload::from(Evaluation::new(true, "abc")));
		assert_eq!(
			serde_json::to_value(&single).unwrap(),
			serde_json::json!({"value": true, "variationId": "abc"})
		);

		let mut flags = BTreeMap::new();
		flags.insert(
			"flag".to_string(),
			EvaluationPayload::from(Evaluation::new("blue", "v")),
		);
		assert_eq!(
			serde_json::to_value(StreamPayload::Flags(flags)).unwrap(),
			serde_json::json!({"flag": {"value": "blue", "variationId": "v"}})
		);
	}
}
