// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The seam between the streaming engine and a project's rule engine.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{Evaluation, EvaluationContext, Result};

/// Receives one `()` per configuration change of a project.
///
/// Engines send with `try_send` into a capacity-1 queue, so a burst of changes
/// that arrives while a notification is still pending collapses into one.
pub type ConfigChangedReceiver = mpsc::Receiver<()>;

/// Identifies one subscription to an engine's configuration-changed signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub Uuid);

impl SubscriberId {
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Default for SubscriberId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for SubscriberId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// A project's flag evaluation engine.
pub trait FlagEvaluator: Send + Sync {
	/// Evaluates a single flag.
	fn evaluate(&self, flag_key: &str, context: Option<&EvaluationContext>) -> Result<Evaluation>;

	/// Evaluates every known flag. Keys that fail carry their own error.
	///
	/// An empty map means the engine has no configuration to evaluate yet.
	fn evaluate_all(
		&self,
		context: Option<&EvaluationContext>,
	) -> HashMap<String, Result<Evaluation>>;

	/// Keys of every flag the engine currently knows.
	fn keys(&self) -> Vec<String>;

	/// Whether the engine holds a usable configuration.
	fn is_ready(&self) -> bool;

	/// Starts delivering configuration-changed signals to `subscriber`.
	fn subscribe(&self, subscriber: SubscriberId) -> ConfigChangedReceiver;

	/// Stops delivering signals to `subscriber`; its receiver then closes.
	fn unsubscribe(&self, subscriber: SubscriberId);
}
