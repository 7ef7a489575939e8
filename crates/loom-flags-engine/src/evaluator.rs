// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-process [`FlagEvaluator`] backed by a mutable set of flag definitions.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use loom_flags_core::{
	ConfigChangedReceiver, Evaluation, EvaluationContext, FlagEvaluator, FlagsError, Result,
	SubscriberId,
};

use crate::rules::{evaluate_flag, FlagDefinition};

/// Holds flag definitions in memory and signals subscribers when they change.
///
/// An evaluator created with [`MemoryEvaluator::new`] is not ready until the
/// first configuration is installed, mirroring an engine that is still
/// fetching its configuration.
pub struct MemoryEvaluator {
	flags: RwLock<Option<HashMap<String, FlagDefinition>>>,
	default_attributes: Option<EvaluationContext>,
	subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<()>>>,
}

impl MemoryEvaluator {
	/// Creates an evaluator without configuration.
	pub fn new() -> Self {
		Self {
			flags: RwLock::new(None),
			default_attributes: None,
			subscribers: Mutex::new(HashMap::new()),
		}
	}

	/// Creates a ready evaluator holding `flags`.
	pub fn with_flags(flags: impl IntoIterator<Item = FlagDefinition>) -> Self {
		let evaluator = Self::new();
		*evaluator.flags.write() = Some(index(flags));
		evaluator
	}

	/// Attributes merged under every request context before evaluation.
	pub fn with_default_attributes(mut self, defaults: EvaluationContext) -> Self {
		self.default_attributes = Some(defaults);
		self
	}

	/// Replaces the whole configuration and signals subscribers.
	pub fn replace_flags(&self, flags: impl IntoIterator<Item = FlagDefinition>) {
		*self.flags.write() = Some(index(flags));
		self.publish_change();
	}

	/// Inserts or overwrites one flag and signals subscribers.
	pub fn set_flag(&self, flag: FlagDefinition) {
		self
			.flags
			.write()
			.get_or_insert_with(HashMap::new)
			.insert(flag.key.clone(), flag);
		self.publish_change();
	}

	/// Removes one flag and signals subscribers when it existed.
	pub fn remove_flag(&self, key: &str) -> bool {
		let removed = self
			.flags
			.write()
			.as_mut()
			.and_then(|flags| flags.remove(key))
			.is_some();
		if removed {
			self.publish_change();
		}
		removed
	}

	/// Signals every subscriber that the configuration changed.
	///
	/// A subscriber that already has a signal pending is skipped; one whose
	/// receiver is gone is dropped.
	pub fn publish_change(&self) {
		let mut subscribers = self.subscribers.lock();
		subscribers.retain(|id, sender| match sender.try_send(()) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(())) => {
				trace!(subscriber = %id, "change signal already pending");
				true
			}
			Err(mpsc::error::TrySendError::Closed(())) => {
				debug!(subscriber = %id, "dropping closed change subscriber");
				false
			}
		});
	}

	pub fn subscriber_count(&self) -> usize {
		self.subscribers.lock().len()
	}

	fn effective_context(&self, context: Option<&EvaluationContext>) -> Option<EvaluationContext> {
		match (&self.default_attributes, context) {
			(Some(defaults), Some(ctx)) => Some(defaults.merged_with(ctx)),
			(Some(defaults), None) => Some(defaults.clone()),
			(None, Some(ctx)) => Some(ctx.clone()),
			(None, None) => None,
		}
	}
}

impl Default for MemoryEvaluator {
	fn default() -> Self {
		Self::new()
	}
}

fn index(flags: impl IntoIterator<Item = FlagDefinition>) -> HashMap<String, FlagDefinition> {
	flags
		.into_iter()
		.map(|flag| (flag.key.clone(), flag))
		.collect()
}

impl FlagEvaluator for MemoryEvaluator {
	fn evaluate(&self, flag_key: &str, context: Option<&EvaluationContext>) -> Result<Evaluation> {
		let flags = self.flags.read();
		let flags = flags.as_ref().ok_or(FlagsError::NotReady)?;
		let flag = flags
			.get(flag_key)
			.ok_or_else(|| FlagsError::FlagNotFound(flag_key.to_string()))?;
		let context = self.effective_context(context);
		Ok(evaluate_flag(flag, context.as_ref()))
	}

	fn evaluate_all(
		&self,
		context: Option<&EvaluationContext>,
	) -> HashMap<String, Result<Evaluation>> {
		let flags = self.flags.read();
		let Some(flags) = flags.as_ref() else {
			return HashMap::new();
		};
		let context = self.effective_context(context);
		flags
			.iter()
			.map(|(key, flag)| (key.clone(), Ok(evaluate_flag(flag, context.as_ref()))))
			.collect()
	}

	fn keys(&self) -> Vec<String> {
		self
			.flags
			.read()
			.as_ref()
			.map(|flags| flags.keys().cloned().collect())
			.unwrap_or_default()
	}

	fn is_ready(&self) -> bool {
		self.flags.read().is_some()
	}

	fn subscribe(&self, subscriber: SubscriberId) -> ConfigChangedReceiver {
		let (sender, receiver) = mpsc::channel(1);
		self.subscribers.lock().insert(subscriber, sender);
		debug!(subscriber = %subscriber, "change subscriber registered");
		receiver
	}

	fn unsubscribe(&self, subscriber: SubscriberId) {
		if self.subscribers.lock().remove(&subscriber).is_some() {
			debug!(subscriber = %subscriber, "change subscriber removed");
		}
	}
}
