// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the Loom feature flags streaming proxy.
//!
//! This crate holds the vocabulary shared by the streaming engine
//! (`loom-flags-stream`) and the in-process collaborators that feed it
//! (`loom-flags-engine`).
//!
//! # Overview
//!
//! - [`ProjectId`] and [`Selector`] identify what a client is watching
//! - [`EvaluationContext`] carries user attributes and reduces them to a
//!   64-bit discriminator for connection grouping
//! - [`Evaluation`], [`EvaluationPayload`] and [`StreamPayload`] are what flows
//!   from the evaluation engine to connected clients
//! - [`FlagEvaluator`] and [`ProjectRegistry`] are the seams to the rule engine
//!   and to project discovery
//!
//! # Example
//!
//! ```
//! use std::collections::hash_map::RandomState;
//! use loom_flags_core::{EvaluationContext, Selector};
//!
//! let seed = RandomState::new();
//! let a = EvaluationContext::new()
//!     .with_attribute("id", "u1")
//!     .with_attribute("plan", "pro");
//! let b = EvaluationContext::new()
//!     .with_attribute("plan", "pro")
//!     .with_attribute("id", "u1");
//!
//! assert_eq!(a.discriminator(&seed), b.discriminator(&seed));
//! assert_eq!(Selector::parse("[ALL]"), Selector::AllFlags);
//! ```

pub mod engine;
pub mod error;
pub mod evaluation;
pub mod flag;
pub mod registry;

pub use engine::{ConfigChangedReceiver, FlagEvaluator, SubscriberId};
pub use error::{FlagsError, Result};
pub use evaluation::{
	AttributeValue, Evaluation, EvaluationContext, EvaluationPayload, StreamPayload,
};
pub use flag::{ProjectId, Selector, VariantValue};
pub use registry::{Project, ProjectEvent, ProjectRegistry};
