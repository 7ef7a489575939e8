// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Groups of connections sharing a selector and an evaluation context.
//!
//! A channel remembers what it last delivered so a configuration change only
//! reaches its members when the served value actually moved.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::trace;

use loom_flags_core::{
	EvaluationContext, EvaluationPayload, FlagEvaluator, Selector, StreamPayload,
};

use crate::config::DeliveryPolicy;
use crate::connection::{ConnectionId, ConnectionSink, Delivered};

#[derive(Debug)]
enum LastPayload {
	SingleFlag {
		key: String,
		payload: EvaluationPayload,
	},
	AllFlags(BTreeMap<String, EvaluationPayload>),
}

/// Counts from pushing one payload to every member.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Delivery {
	pub sent: u64,
	pub dropped: u64,
	/// Members removed because their receiver was gone.
	pub disconnected: u64,
}

impl Delivery {
	pub(crate) fn record(&mut self, delivered: Delivered) {
		match delivered {
			Delivered::Sent => self.sent += 1,
			Delivered::Dropped => self.dropped += 1,
			Delivered::Disconnected => self.disconnected += 1,
		}
	}
}

#[derive(Debug)]
pub(crate) struct Channel {
	last: LastPayload,
	/// Context of the connection that created the channel.
	context: Option<EvaluationContext>,
	members: Vec<ConnectionSink>,
}

impl Channel {
	/// Creates an empty channel holding a fresh evaluation for `selector`.
	pub(crate) fn create(
		selector: &Selector,
		context: Option<EvaluationContext>,
		engine: &dyn FlagEvaluator,
	) -> Self {
		let last = match selector {
			Selector::Flag(key) => {
				let payload = engine
					.evaluate(key, context.as_ref())
					.map(EvaluationPayload::from)
					.unwrap_or_else(|_| EvaluationPayload::unavailable());
				LastPayload::SingleFlag {
					key: key.clone(),
					payload,
				}
			}
			Selector::AllFlags => LastPayload::AllFlags(
				engine
					.evaluate_all(context.as_ref())
					.into_iter()
					.filter_map(|(key, result)| result.ok().map(|eval| (key, eval.into())))
					.collect(),
			),
		};

		Self {
			last,
			context,
			members: Vec::new(),
		}
	}

	pub(crate) fn add_connection(&mut self, sink: ConnectionSink) {
		self.members.push(sink);
	}

	/// Removes a member. Returns `false` when it was not (or no longer) a member.
	pub(crate) fn remove_connection(&mut self, id: ConnectionId) -> bool {
		match self.members.iter().position(|sink| sink.id() == id) {
			Some(index) => {
				self.members.remove(index);
				true
			}
			None => false,
		}
	}

	pub(crate) fn is_empty(&self) -> bool {
		self.members.is_empty()
	}

	pub(crate) fn len(&self) -> usize {
		self.members.len()
	}

	/// The full state a newly joined connection receives first.
	pub(crate) fn current_payload(&self) -> Arc<StreamPayload> {
		Arc::new(match &self.last {
			LastPayload::SingleFlag { payload, .. } => StreamPayload::Flag(payload.clone()),
			LastPayload::AllFlags(payloads) => StreamPayload::Flags(payloads.clone()),
		})
	}

	/// Re-evaluates after a configuration change and pushes what moved.
	///
	/// A failed single-flag evaluation keeps the last payload and sends
	/// nothing. An all-flags scan that yields no flags sends nothing, and a
	/// key that fails to evaluate is left out of the scan.
	pub(crate) async fn notify(
		&mut self,
		engine: &dyn FlagEvaluator,
		policy: DeliveryPolicy,
	) -> Delivery {
		match self.changed_payload(engine) {
			Some(payload) => self.push(payload, policy).await,
			None => Delivery::default(),
		}
	}

	fn changed_payload(&mut self, engine: &dyn FlagEvaluator) -> Option<Arc<StreamPayload>> {
		let context = self.context.as_ref();
		match &mut self.last {
			LastPayload::SingleFlag { key, payload } => {
				let evaluation = match engine.evaluate(key, context) {
					Ok(evaluation) => evaluation,
					Err(e) => {
						trace!(
							flag_key = %key,
							error = %e,
							"evaluation failed, keeping last payload"
						);
						return None;
					}
				};
				if payload.has_same_value(&evaluation) {
					return None;
				}
				*payload = evaluation.into();
				Some(Arc::new(StreamPayload::Flag(payload.clone())))
			}
			LastPayload::AllFlags(last) => {
				let evaluations = engine.evaluate_all(context);
				if evaluations.is_empty() {
					return None;
				}

				let mut changed = BTreeMap::new();
				for (key, result) in evaluations {
					let Ok(evaluation) = result else {
						continue;
					};
					let unchanged = last
						.get(&key)
						.is_some_and(|previous| previous.has_same_value(&evaluation));
					if !unchanged {
						let payload = EvaluationPayload::from(evaluation);
						last.insert(key.clone(), payload.clone());
						changed.insert(key, payload);
					}
				}

				if changed.is_empty() {
					None
				} else {
					Some(Arc::new(StreamPayload::Flags(changed)))
				}
			}
		}
	}

	async fn push(&mut self, payload: Arc<StreamPayload>, policy: DeliveryPolicy) -> Delivery {
		let mut delivery = Delivery::default();
		let mut index = 0;
		while index < self.members.len() {
			let outcome = self.members[index].deliver(payload.clone(), policy).await;
			delivery.record(outcome);
			if outcome == Delivered::Disconnected {
				self.members.remove(index);
			} else {
				index += 1;
			}
		}
		delivery
	}
}


#[cfg(test)]
mod proptests {
	use super::*;
	use crate::connection::connection_pair;
	use loom_flags_engine::{FlagDefinition, MemoryEvaluator};
	use proptest::prelude::*;

	proptest! {
		/// Property: an all-flags notify pushes exactly the keys whose value moved
		#[test]
		fn all_flags_diff_matches_changed_keys(
			before in proptest::collection::btree_map("[a-z]{1,6}", any::<bool>(), 1..8),
			flips in proptest::collection::vec(any::<bool>(), 8),
		) {
			let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
			runtime.block_on(async {
				let engine = MemoryEvaluator::with_flags(
					before.iter().map(|(k, v)| FlagDefinition::constant(k.clone(), *v)),
				);
				let mut channel = Channel::create(&Selector::AllFlags, None, &engine);
				let (mut conn, sink) = connection_pair(Selector::AllFlags, 0, 4);
				channel.add_connection(sink);

				let after: BTreeMap<String, bool> = before
					.iter()
					.zip(flips.iter())
					.map(|((k, v), flip)| (k.clone(), v ^ flip))
					.collect();
				engine.replace_flags(
					after.iter().map(|(k, v)| FlagDefinition::constant(k.clone(), *v)),
				);

				let expected: Vec<&String> = before
					.keys()
					.filter(|k| before[*k] != after[*k])
					.collect();
				let delivery = channel.notify(&engine, DeliveryPolicy::DropNewest).await;

				if expected.is_empty() {
					assert_eq!(delivery.sent, 0);
					assert!(conn.receive().try_recv().is_err());
				} else {
					assert_eq!(delivery.sent, 1);
					let payload = conn.recv().await.unwrap();
					let changed: Vec<&String> = payload.as_flags().unwrap().keys().collect();
					assert_eq!(changed, expected);
				}
			});
		}
	}
}
