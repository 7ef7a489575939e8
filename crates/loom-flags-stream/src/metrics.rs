// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Connection and delivery accounting.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use loom_flags_core::{ProjectId, Selector};

/// Receives per-project connection and delivery counts from stream workers.
///
/// Every call is labelled with the project, the configured server type and
/// the selector the connection watches.
pub trait StreamMetrics: Send + Sync {
	fn connection_opened(&self, project_id: &ProjectId, server_type: &str, selector: &Selector);

	fn connection_closed(&self, project_id: &ProjectId, server_type: &str, selector: &Selector);

	fn payloads_sent(
		&self,
		count: u64,
		project_id: &ProjectId,
		server_type: &str,
		selector: &Selector,
	);

	fn payloads_dropped(
		&self,
		count: u64,
		project_id: &ProjectId,
		server_type: &str,
		selector: &Selector,
	);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl StreamMetrics for NoopMetrics {
	fn connection_opened(&self, _: &ProjectId, _: &str, _: &Selector) {}

	fn connection_closed(&self, _: &ProjectId, _: &str, _: &Selector) {}

	fn payloads_sent(&self, _: u64, _: &ProjectId, _: &str, _: &Selector) {}

	fn payloads_dropped(&self, _: u64, _: &ProjectId, _: &str, _: &Selector) {}
}

/// Counters written by a stream worker and read by [`StreamStats`] snapshots.
#[derive(Debug, Default)]
pub(crate) struct StreamCounters {
	open_connections: AtomicUsize,
	channels: AtomicUsize,
	payloads_sent: AtomicU64,
	payloads_dropped: AtomicU64,
}

impl StreamCounters {
	pub(crate) fn connection_opened(&self) {
		self.open_connections.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn connection_closed(&self) {
		let _ = self
			.open_connections
			.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
	}

	pub(crate) fn open_connections(&self) -> usize {
		self.open_connections.load(Ordering::Relaxed)
	}

	pub(crate) fn set_channels(&self, count: usize) {
		self.channels.store(count, Ordering::Relaxed);
	}

	pub(crate) fn add_sent(&self, count: u64) {
		self.payloads_sent.fetch_add(count, Ordering::Relaxed);
	}

	pub(crate) fn add_dropped(&self, count: u64) {
		self.payloads_dropped.fetch_add(count, Ordering::Relaxed);
	}

	/// Zeroes the gauges once the worker has released every connection.
	pub(crate) fn reset_gauges(&self) {
		self.open_connections.store(0, Ordering::Relaxed);
		self.channels.store(0, Ordering::Relaxed);
	}

	pub(crate) fn snapshot(
		&self,
		project_id: &ProjectId,
		started_at: DateTime<Utc>,
	) -> StreamStats {
		StreamStats {
			project_id: project_id.clone(),
			open_connections: self.open_connections.load(Ordering::Relaxed),
			channels: self.channels.load(Ordering::Relaxed),
			payloads_sent: self.payloads_sent.load(Ordering::Relaxed),
			payloads_dropped: self.payloads_dropped.load(Ordering::Relaxed),
			started_at,
		}
	}
}

/// Point-in-time view of one stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamStats {
	pub project_id: ProjectId,
	/// Connections currently registered with the worker.
	pub open_connections: usize,
	/// Distinct (selector, context) groups currently alive.
	pub channels: usize,
	/// Payloads placed into mailboxes since the stream started.
	pub payloads_sent: u64,
	/// Payloads skipped because a mailbox was full.
	pub payloads_dropped: u64,
	pub started_at: DateTime<Utc>,
}

/// Aggregate view across every stream of a server.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerStats {
	pub streams: usize,
	pub open_connections: usize,
	pub channels: usize,
	pub payloads_sent: u64,
	pub payloads_dropped: u64,
}

impl ServerStats {
	pub(crate) fn add(&mut self, stream: &StreamStats) {
		self.streams += 1;
		self.open_connections += stream.open_connections;
		self.channels += stream.channels;
		self.payloads_sent += stream.payloads_sent;
		self.payloads_dropped += stream.payloads_dropped;
	}
}
