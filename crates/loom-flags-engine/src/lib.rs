// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-process flag evaluation for the Loom flags streaming proxy.
//!
//! [`MemoryEvaluator`] implements [`loom_flags_core::FlagEvaluator`] over flag
//! definitions held in memory, and [`MemoryRegistry`] implements
//! [`loom_flags_core::ProjectRegistry`] over a set of projects.

pub mod evaluator;
pub mod registry;
pub mod rules;

pub use evaluator::MemoryEvaluator;
pub use registry::MemoryRegistry;
pub use rules::{
	evaluate_flag, AttributeOperator, Condition, FlagDefinition, PercentageRollout, TargetingRule,
	Variant,
};
