// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Flag definitions and the rule evaluation that turns them into values.

use std::io::Cursor;

use loom_flags_core::{AttributeValue, Evaluation, EvaluationContext, VariantValue};
use murmur3::murmur3_32;
use serde::{Deserialize, Serialize};

/// A named value a flag can serve.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Variant {
	pub id: String,
	pub value: VariantValue,
}

impl Variant {
	pub fn new(id: impl Into<String>, value: impl Into<VariantValue>) -> Self {
		Self {
			id: id.into(),
			value: value.into(),
		}
	}
}

/// Comparison applied between a context attribute and a condition value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttributeOperator {
	Equals,
	NotEquals,
	Contains,
	StartsWith,
	EndsWith,
	GreaterThan,
	LessThan,
	In,
	NotIn,
}

impl AttributeOperator {
	/// Evaluates this operator with `actual` from the context and `expected` from the rule.
	pub fn evaluate(&self, actual: &AttributeValue, expected: &AttributeValue) -> bool {
		match self {
			AttributeOperator::Equals => actual == expected,
			AttributeOperator::NotEquals => actual != expected,
			AttributeOperator::Contains => match (actual, expected) {
				(AttributeValue::String(a), AttributeValue::String(e)) => a.contains(e.as_str()),
				(AttributeValue::List(items), AttributeValue::String(e)) => items.contains(e),
				_ => false,
			},
			AttributeOperator::StartsWith => match (actual, expected) {
				(AttributeValue::String(a), AttributeValue::String(e)) => a.starts_with(e.as_str()),
				_ => false,
			},
			AttributeOperator::EndsWith => match (actual, expected) {
				(AttributeValue::String(a), AttributeValue::String(e)) => a.ends_with(e.as_str()),
				_ => false,
			},
			AttributeOperator::GreaterThan => compare_numbers(actual, expected, |a, b| a > b),
			AttributeOperator::LessThan => compare_numbers(actual, expected, |a, b| a < b),
			AttributeOperator::In => match (actual.as_text(), expected) {
				(Some(a), AttributeValue::List(items)) => items.contains(&a),
				_ => false,
			},
			AttributeOperator::NotIn => match (actual.as_text(), expected) {
				(Some(a), AttributeValue::List(items)) => !items.contains(&a),
				_ => true,
			},
		}
	}
}

fn compare_numbers<F>(actual: &AttributeValue, expected: &AttributeValue, cmp: F) -> bool
where
	F: Fn(f64, f64) -> bool,
{
	let as_number = |value: &AttributeValue| match value {
		AttributeValue::Number(n) => Some(*n),
		AttributeValue::String(s) => s.trim().parse::<f64>().ok(),
		AttributeValue::List(_) => None,
	};
	match (as_number(actual), as_number(expected)) {
		(Some(a), Some(b)) => cmp(a, b),
		_ => false,
	}
}

/// One attribute test inside a targeting rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
	pub attribute: String,
	pub operator: AttributeOperator,
	pub value: AttributeValue,
}

impl Condition {
	pub fn new(
		attribute: impl Into<String>,
		operator: AttributeOperator,
		value: impl Into<AttributeValue>,
	) -> Self {
		Self {
			attribute: attribute.into(),
			operator,
			value: value.into(),
		}
	}
}

/// Serves `variant` when every condition matches (AND logic).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetingRule {
	pub conditions: Vec<Condition>,
	pub variant: Variant,
}

/// Serves `variant` to a stable share of contexts, bucketed by `attribute`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PercentageRollout {
	#[serde(default = "default_rollout_attribute")]
	pub attribute: String,
	pub percentage: u32,
	pub variant: Variant,
}

fn default_rollout_attribute() -> String {
	"id".to_string()
}

/// A flag as held by the in-process engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlagDefinition {
	pub key: String,
	pub default: Variant,
	#[serde(default)]
	pub rules: Vec<TargetingRule>,
	#[serde(default)]
	pub rollout: Option<PercentageRollout>,
}

impl FlagDefinition {
	pub fn new(key: impl Into<String>, default: Variant) -> Self {
		Self {
			key: key.into(),
			default,
			rules: Vec::new(),
			rollout: None,
		}
	}

	/// Shorthand for a flag that always serves `value`.
	pub fn constant(key: impl Into<String>, value: impl Into<VariantValue>) -> Self {
		let key = key.into();
		let variant = Variant::new(format!("{key}.default"), value);
		Self::new(key, variant)
	}

	pub fn with_rule(mut self, conditions: Vec<Condition>, variant: Variant) -> Self {
		self.rules.push(TargetingRule {
			conditions,
			variant,
		});
		self
	}

	pub fn with_rollout(
		mut self,
		attribute: impl Into<String>,
		percentage: u32,
		variant: Variant,
	) -> Self {
		self.rollout = Some(PercentageRollout {
			attribute: attribute.into(),
			percentage,
			variant,
		});
		self
	}
}

/// Evaluates a flag for a given context.
///
/// The evaluation order is:
/// 1. Targeting rules, first match wins
/// 2. Percentage rollout, when the bucketing attribute is present
/// 3. The default variant
pub fn evaluate_flag(flag: &FlagDefinition, context: Option<&EvaluationContext>) -> Evaluation {
	if let Some(context) = context {
		for rule in &flag.rules {
			if evaluate_conditions(&rule.conditions, context) {
				return served(&rule.variant);
			}
		}

		if let Some(rollout) = &flag.rollout {
			let bucket_key = context
				.get(&rollout.attribute)
				.and_then(AttributeValue::as_text);
			if let Some(key) = bucket_key {
				if evaluate_percentage(&key, &flag.key, rollout.percentage) {
					return served(&rollout.variant);
				}
			}
		}
	}

	served(&flag.default)
}

fn served(variant: &Variant) -> Evaluation {
	Evaluation::new(variant.value.clone(), variant.id.clone())
}

fn evaluate_conditions(conditions: &[Condition], context: &EvaluationContext) -> bool {
	conditions.iter().all(|cond| match context.get(&cond.attribute) {
		Some(actual) => cond.operator.evaluate(actual, &cond.value),
		None => false,
	})
}

/// Evaluates percentage-based targeting using consistent hashing.
fn evaluate_percentage(key: &str, flag_key: &str, percentage: u32) -> bool {
	let input = format!("{}.{}", flag_key, key);
	let hash = murmur3_32(&mut Cursor::new(input.as_bytes()), 0).unwrap_or(0);
	let bucket = hash % 100;
	bucket < percentage
}

#[cfg(test)]
mod tests {
	use super::*;

	fn create_test_flag() -> FlagDefinition {
		FlagDefinition::new("test.feature", Variant::new("off", false)).with_rule(
			vec![Condition::new("plan", AttributeOperator::Equals, "enterprise")],
			Variant::new("on", true),
		)
	}

	#[test]
	fn test_evaluate_without_context_serves_default() {
		let result = evaluate_flag(&create_test_flag(), None);
		assert_eq!(result.value, VariantValue::Boolean(false));
		assert_eq!(result.variation_id, "off");
	}

	#[test]
	fn test_evaluate_matching_rule() {
		let ctx = EvaluationContext::new().with_attribute("plan", "enterprise");
		let result = evaluate_flag(&create_test_flag(), Some(&ctx));
		assert_eq!(result.value, VariantValue::Boolean(true));
		assert_eq!(result.variation_id, "on");
	}

	#[test]
	fn test_evaluate_rule_requires_all_conditions() {
		let flag = FlagDefinition::new("beta", Variant::new("off", false)).with_rule(
			vec![
				Condition::new("plan", AttributeOperator::Equals, "enterprise"),
				Condition::new("age", AttributeOperator::GreaterThan, 18i64),
			],
			Variant::new("on", true),
		);

		let young = EvaluationContext::new()
			.with_attribute("plan", "enterprise")
			.with_attribute("age", 16i64);
		let adult = EvaluationContext::new()
			.with_attribute("plan", "enterprise")
			.with_attribute("age", 30i64);

		assert_eq!(evaluate_flag(&flag, Some(&young)).value, VariantValue::Boolean(false));
		assert_eq!(evaluate_flag(&flag, Some(&adult)).value, VariantValue::Boolean(true));
	}

	#[test]
	fn test_operators() {
		let email = AttributeValue::from("dev@loom.dev");
		assert!(AttributeOperator::EndsWith.evaluate(&email, &AttributeValue::from("@loom.dev")));
		assert!(AttributeOperator::StartsWith.evaluate(&email, &AttributeValue::from("dev")));
		assert!(AttributeOperator::Contains.evaluate(&email, &AttributeValue::from("loom")));

		let countries = AttributeValue::List(vec!["HU".to_string(), "US".to_string()]);
		assert!(AttributeOperator::In.evaluate(&AttributeValue::from("US"), &countries));
		assert!(AttributeOperator::NotIn.evaluate(&AttributeValue::from("DE"), &countries));
		assert!(AttributeOperator::Contains.evaluate(&countries, &AttributeValue::from("HU")));

		assert!(AttributeOperator::LessThan
			.evaluate(&AttributeValue::from("3"), &AttributeValue::from(4i64)));
	}

	#[test]
	fn test_rollout_is_stable_per_key() {
		let flag = FlagDefinition::new("rollout", Variant::new("off", false)).with_rollout(
			"id",
			50,
			Variant::new("on", true),
		);
		let ctx = EvaluationContext::new().with_attribute("id", "user-42");

		let first = evaluate_flag(&flag, Some(&ctx));
		let second = evaluate_flag(&flag, Some(&ctx));
		assert_eq!(first, second);
	}

	#[test]
	fn test_rollout_boundaries() {
		let all = FlagDefinition::new("all", Variant::new("off", false)).with_rollout(
			"id",
			100,
			Variant::new("on", true),
		);
		let none = FlagDefinition::new("none", Variant::new("off", false)).with_rollout(
			"id",
			0,
			Variant::new("on", true),
		);
		let ctx = EvaluationContext::new().with_attribute("id", "anyone");

		assert_eq!(evaluate_flag(&all, Some(&ctx)).value, VariantValue::Boolean(true));
		assert_eq!(evaluate_flag(&none, Some(&ctx)).value, VariantValue::Boolean(false));
	}

	#[test]
	fn test_definition_from_toml() {
		let toml_str = r#"
key = "banner.color"

[default]
id = "blue"
value = "blue"

[[rules]]
variant = { id = "red", value = "red" }
conditions = [{ attribute = "country", operator = "in", value = ["HU", "AT"] }]
"#;
		let flag: FlagDefinition = toml::from_str(toml_str).unwrap();
		let ctx = EvaluationContext::new().with_attribute("country", "HU");

		assert_eq!(
			evaluate_flag(&flag, Some(&ctx)).value,
			VariantValue::String("red".to_string())
		);
	}
}

#[cfg(test)]
mod proptests {
	use super::*;
	use proptest::prelude::*;

	proptest! {
		/// Property: 0% never serves the rollout variant and 100% always does
		#[test]
		fn rollout_extremes_hold_for_any_key(key in "[a-z0-9-]{1,24}") {
			prop_assert!(evaluate_percentage(&key, "flag", 100));
			prop_assert!(!evaluate_percentage(&key, "flag", 0));
		}

		/// Property: bucketing is deterministic
		#[test]
		fn percentage_is_deterministic(key in "[a-z0-9]{1,16}", pct in 0u32..=100) {
			prop_assert_eq!(
				evaluate_percentage(&key, "flag", pct),
				evaluate_percentage(&key, "flag", pct)
			);
		}
	}
}
