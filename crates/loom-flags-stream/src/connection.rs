// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use loom_flags_core::{Selector, StreamPayload};

use crate::config::DeliveryPolicy;

/// Identifies one connection for the lifetime of its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
	pub(crate) fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// A subscriber's end of a stream: a bounded mailbox of payloads.
///
/// The mailbox ends (`recv` yields `None`) once the connection is closed or
/// its stream shuts down. A connection created on a closed stream ends
/// immediately.
#[derive(Debug)]
pub struct Connection {
	id: ConnectionId,
	selector: Selector,
	discriminator: u64,
	receiver: mpsc::Receiver<Arc<StreamPayload>>,
}

impl Connection {
	pub fn id(&self) -> ConnectionId {
		self.id
	}

	pub fn selector(&self) -> &Selector {
		&self.selector
	}

	/// Context fingerprint; 0 when the connection was created without context.
	pub fn discriminator(&self) -> u64 {
		self.discriminator
	}

	/// The mailbox, for adapters that drive it in their own `select!`.
	pub fn receive(&mut self) -> &mut mpsc::Receiver<Arc<StreamPayload>> {
		&mut self.receiver
	}

	pub async fn recv(&mut self) -> Option<Arc<StreamPayload>> {
		self.receiver.recv().await
	}
}

/// Result of placing one payload into a mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivered {
	Sent,
	/// The mailbox was full and the payload was skipped.
	Dropped,
	/// The receiving side is gone.
	Disconnected,
}

/// The worker's end of a connection.
#[derive(Debug)]
pub(crate) struct ConnectionSink {
	id: ConnectionId,
	sender: mpsc::Sender<Arc<StreamPayload>>,
}

impl ConnectionSink {
	pub(crate) fn id(&self) -> ConnectionId {
		self.id
	}

	pub(crate) async fn deliver(
		&self,
		payload: Arc<StreamPayload>,
		policy: DeliveryPolicy,
	) -> Delivered {
		match policy {
			DeliveryPolicy::DropNewest => match self.sender.try_send(payload) {
				Ok(()) => Delivered::Sent,
				Err(mpsc::error::TrySendError::Full(_)) => Delivered::Dropped,
				Err(mpsc::error::TrySendError::Closed(_)) => Delivered::Disconnected,
			},
			DeliveryPolicy::Block => match self.sender.send(payload).await {
				Ok(()) => Delivered::Sent,
				Err(_) => Delivered::Disconnected,
			},
		}
	}
}

/// Creates both ends of a connection.
pub(crate) fn connection_pair(
	selector: Selector,
	discriminator: u64,
	capacity: usize,
) -> (Connection, ConnectionSink) {
	let (sender, receiver) = mpsc::channel(capacity);
	let id = ConnectionId::new();
	(
		Connection {
			id,
			selector,
			discriminator,
			receiver,
		},
		ConnectionSink { id, sender },
	)
}

#[cfg(test)]
mod tests {
	use super::*;
	use loom_flags_core::EvaluationPayload;

	fn payload() -> Arc<StreamPayload> {
		Arc::new(StreamPayload::Flag(EvaluationPayload::unavailable()))
	}

	#[tokio::test]
	async fn test_drop_newest_skips_when_full() {
		let (mut conn, sink) = connection_pair(Selector::flag("flag"), 0, 1);

		assert_eq!(sink.deliver(payload(), DeliveryPolicy::DropNewest).await, Delivered::Sent);
		assert_eq!(
			sink.deliver(payload(), DeliveryPolicy::DropNewest).await,
			Delivered::Dropped
		);

		assert!(conn.recv().await.is_some());
		assert!(conn.receive().try_recv().is_err());
	}

	#[tokio::test]
	async fn test_deliver_to_dropped_connection() {
		let (conn, sink) = connection_pair(Selector::AllFlags, 7, 4);
		assert_eq!(conn.discriminator(), 7);
		drop(conn);

		assert_eq!(
			sink.deliver(payload(), DeliveryPolicy::DropNewest).await,
			Delivered::Disconnected
		);
		assert_eq!(sink.deliver(payload(), DeliveryPolicy::Block).await, Delivered::Disconnected);
	}

	#[tokio::test]
	async fn test_mailbox_ends_when_sink_dropped() {
		let (mut conn, sink) = connection_pair(Selector::flag("flag"), 0, 4);
		assert_eq!(conn.id(), sink.id());
		drop(sink);

		assert!(conn.recv().await.is_none());
	}

	#[test]
	fn test_ids_are_unique() {
		let (a, _) = connection_pair(Selector::flag("flag"), 0, 1);
		let (b, _) = connection_pair(Selector::flag("flag"), 0, 1);
		assert_ne!(a.id(), b.id());
	}
}
