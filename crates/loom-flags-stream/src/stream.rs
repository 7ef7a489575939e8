// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-project stream: one worker task owning every channel of a project.
//!
//! # Architecture
//!
//! ```text
//!  create_connection ──┐
//!  close_connection ───┼──> command queue ──┐
//!                      │                    ├──> worker ──> channels ──> mailboxes
//!  engine change signal ────────────────────┘
//! ```
//!
//! Lifecycle commands are handled strictly in arrival order, interleaved with
//! configuration-changed signals. Only the worker touches the channel index
//! and only the worker writes into mailboxes, so a connection sees payloads in
//! the order the worker produced them.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use loom_flags_core::{
	ConfigChangedReceiver, EvaluationContext, FlagEvaluator, ProjectId, Selector, SubscriberId,
};

use crate::channel::{Channel, Delivery};
use crate::config::{DeliveryPolicy, StreamConfig};
use crate::connection::{connection_pair, Connection, ConnectionId, ConnectionSink, Delivered};
use crate::metrics::{StreamCounters, StreamMetrics, StreamStats};

enum Command {
	Established {
		sink: ConnectionSink,
		selector: Selector,
		discriminator: u64,
		context: Option<EvaluationContext>,
	},
	Closed {
		id: ConnectionId,
		selector: Selector,
		discriminator: u64,
	},
}

/// Fan-out of one project's flag evaluations to its connections.
pub struct FlagStream {
	project_id: ProjectId,
	engine: Arc<dyn FlagEvaluator>,
	seed: RandomState,
	mailbox_capacity: usize,
	commands: mpsc::Sender<Command>,
	subscriber: SubscriberId,
	shutdown: CancellationToken,
	closed: AtomicBool,
	counters: Arc<StreamCounters>,
	started_at: DateTime<Utc>,
}

impl FlagStream {
	/// Subscribes to `engine` and starts the worker on the current runtime.
	pub fn spawn(
		project_id: ProjectId,
		engine: Arc<dyn FlagEvaluator>,
		config: &StreamConfig,
		metrics: Arc<dyn StreamMetrics>,
	) -> Arc<Self> {
		let (commands_tx, commands_rx) = mpsc::channel(config.command_queue_capacity);
		let subscriber = SubscriberId::new();
		let changes = engine.subscribe(subscriber);
		let shutdown = CancellationToken::new();
		let counters = Arc::new(StreamCounters::default());

		let worker = StreamWorker {
			project_id: project_id.clone(),
			engine: engine.clone(),
			policy: config.delivery,
			server_type: config.server_type.clone(),
			metrics,
			counters: counters.clone(),
			channels: HashMap::new(),
		};
		let span = info_span!("flag_stream", project_id = %project_id);
		tokio::spawn(
			worker
				.run(commands_rx, changes, shutdown.clone())
				.instrument(span),
		);

		info!(
			project_id = %project_id,
			server_type = %config.server_type,
			delivery = %config.delivery,
			"flag stream started"
		);

		Arc::new(Self {
			project_id,
			engine,
			seed: RandomState::new(),
			mailbox_capacity: config.mailbox_capacity,
			commands: commands_tx,
			subscriber,
			shutdown,
			closed: AtomicBool::new(false),
			counters,
			started_at: Utc::now(),
		})
	}

	pub fn project_id(&self) -> &ProjectId {
		&self.project_id
	}

	pub(crate) fn engine(&self) -> &Arc<dyn FlagEvaluator> {
		&self.engine
	}

	/// Opens a connection watching `selector` for `context`.
	///
	/// Never fails. On a closed stream the returned connection is not
	/// registered and its mailbox ends without data.
	pub async fn create_connection(
		&self,
		selector: Selector,
		context: Option<EvaluationContext>,
	) -> Connection {
		let discriminator = context
			.as_ref()
			.map(|ctx| ctx.discriminator(&self.seed))
			.unwrap_or(0);
		let (connection, sink) =
			connection_pair(selector.clone(), discriminator, self.mailbox_capacity);

		if self.is_closed() {
			debug!(
				project_id = %self.project_id,
				selector = %selector,
				"stream closed, connection not registered"
			);
			return connection;
		}

		let command = Command::Established {
			sink,
			selector,
			discriminator,
			context,
		};
		if self.commands.send(command).await.is_err() {
			debug!(project_id = %self.project_id, "stream worker gone, connection not registered");
		}
		connection
	}

	/// Unregisters `connection`. A no-op on a closed stream or for a
	/// connection that is no longer registered.
	pub async fn close_connection(&self, connection: &Connection) {
		if self.is_closed() {
			return;
		}
		let command = Command::Closed {
			id: connection.id(),
			selector: connection.selector().clone(),
			discriminator: connection.discriminator(),
		};
		let _ = self.commands.send(command).await;
	}

	/// Stops the worker and unsubscribes from the engine. Idempotent.
	pub fn close(&self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		self.shutdown.cancel();
		self.engine.unsubscribe(self.subscriber);
		info!(project_id = %self.project_id, "flag stream closed");
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	/// Resolves once the stream has been closed.
	pub async fn closed(&self) {
		self.shutdown.cancelled().await
	}

	/// Whether the stream is open and its engine can evaluate.
	pub fn is_in_valid_state(&self) -> bool {
		!self.is_closed() && self.engine.is_ready()
	}

	/// Whether the engine currently knows `flag_key`.
	pub fn can_eval(&self, flag_key: &str) -> bool {
		self.engine.keys().iter().any(|key| key == flag_key)
	}

	pub fn stats(&self) -> StreamStats {
		self.counters.snapshot(&self.project_id, self.started_at)
	}
}

impl Drop for FlagStream {
	fn drop(&mut self) {
		self.close();
	}
}

struct StreamWorker {
	project_id: ProjectId,
	engine: Arc<dyn FlagEvaluator>,
	policy: DeliveryPolicy,
	server_type: String,
	metrics: Arc<dyn StreamMetrics>,
	counters: Arc<StreamCounters>,
	channels: HashMap<Selector, HashMap<u64, Channel>>,
}

impl StreamWorker {
	async fn run(
		mut self,
		mut commands: mpsc::Receiver<Command>,
		mut changes: ConfigChangedReceiver,
		shutdown: CancellationToken,
	) {
		loop {
			tokio::select! {
				biased;

				_ = shutdown.cancelled() => break,

				command = commands.recv() => {
					let Some(command) = command else { break };
					tokio::select! {
						biased;
						_ = shutdown.cancelled() => break,
						_ = self.handle(command) => {}
					}
				}

				Some(()) = changes.recv() => {
					tokio::select! {
						biased;
						_ = shutdown.cancelled() => break,
						_ = self.notify_channels() => {}
					}
				}
			}
		}

		let released: usize = self
			.channels
			.values()
			.flat_map(HashMap::values)
			.map(Channel::len)
			.sum();
		self.channels.clear();
		self.counters.reset_gauges();
		debug!(project_id = %self.project_id, released, "stream worker stopped");
	}

	async fn handle(&mut self, command: Command) {
		match command {
			Command::Established {
				sink,
				selector,
				discriminator,
				context,
			} => self.establish(sink, selector, discriminator, context).await,
			Command::Closed {
				id,
				selector,
				discriminator,
			} => self.close(id, &selector, discriminator),
		}
	}

	async fn establish(
		&mut self,
		sink: ConnectionSink,
		selector: Selector,
		discriminator: u64,
		context: Option<EvaluationContext>,
	) {
		let engine = self.engine.as_ref();
		let channel = self
			.channels
			.entry(selector.clone())
			.or_default()
			.entry(discriminator)
			.or_insert_with(|| Channel::create(&selector, context, engine));

		let delivered = sink.deliver(channel.current_payload(), self.policy).await;
		match delivered {
			Delivered::Sent => {
				self.counters.add_sent(1);
				self
					.metrics
					.payloads_sent(1, &self.project_id, &self.server_type, &selector);
			}
			Delivered::Dropped => {
				self.counters.add_dropped(1);
				self
					.metrics
					.payloads_dropped(1, &self.project_id, &self.server_type, &selector);
			}
			Delivered::Disconnected => {
				debug!(
					project_id = %self.project_id,
					selector = %selector,
					"connection went away before registration"
				);
				self.collect_empty(&selector, discriminator);
				return;
			}
		}
		channel.add_connection(sink);

		self.counters.connection_opened();
		self
			.metrics
			.connection_opened(&self.project_id, &self.server_type, &selector);
		self.update_channel_count();
		debug!(
			project_id = %self.project_id,
			selector = %selector,
			connections = self.counters.open_connections(),
			"connection established"
		);
	}

	fn close(&mut self, id: ConnectionId, selector: &Selector, discriminator: u64) {
		let removed = self
			.channels
			.get_mut(selector)
			.and_then(|bucket| bucket.get_mut(&discriminator))
			.is_some_and(|channel| channel.remove_connection(id));
		if !removed {
			return;
		}
		self.collect_empty(selector, discriminator);
		self.retire(selector);
		debug!(
			project_id = %self.project_id,
			selector = %selector,
			connections = self.counters.open_connections(),
			"connection closed"
		);
	}

	async fn notify_channels(&mut self) {
		let engine = self.engine.as_ref();
		let mut total = Delivery::default();
		let mut pruned: Vec<(Selector, u64, u64)> = Vec::new();

		for (selector, bucket) in self.channels.iter_mut() {
			for (discriminator, channel) in bucket.iter_mut() {
				let delivery = channel.notify(engine, self.policy).await;
				if delivery.sent > 0 {
					self.metrics.payloads_sent(
						delivery.sent,
						&self.project_id,
						&self.server_type,
						selector,
					);
				}
				if delivery.dropped > 0 {
					self.metrics.payloads_dropped(
						delivery.dropped,
						&self.project_id,
						&self.server_type,
						selector,
					);
				}
				if delivery.disconnected > 0 {
					pruned.push((selector.clone(), *discriminator, delivery.disconnected));
				}
				total.sent += delivery.sent;
				total.dropped += delivery.dropped;
				total.disconnected += delivery.disconnected;
			}
		}

		self.counters.add_sent(total.sent);
		self.counters.add_dropped(total.dropped);

		for (selector, discriminator, count) in pruned {
			self.collect_empty(&selector, discriminator);
			for _ in 0..count {
				self.retire(&selector);
			}
		}

		if total.dropped > 0 {
			warn!(
				project_id = %self.project_id,
				dropped = total.dropped,
				"mailboxes full, payloads dropped"
			);
		}
		if total.disconnected > 0 {
			debug!(
				project_id = %self.project_id,
				pruned = total.disconnected,
				"pruned connections whose receivers were dropped"
			);
		}
		if total.sent > 0 {
			debug!(project_id = %self.project_id, sent = total.sent, "payload sent to connections");
		}
	}

	/// Accounts for one connection leaving the worker.
	fn retire(&self, selector: &Selector) {
		self.counters.connection_closed();
		self
			.metrics
			.connection_closed(&self.project_id, &self.server_type, selector);
	}

	/// Drops the channel at (`selector`, `discriminator`) when it has no members left.
	fn collect_empty(&mut self, selector: &Selector, discriminator: u64) {
		if let Some(bucket) = self.channels.get_mut(selector) {
			if bucket.get(&discriminator).is_some_and(Channel::is_empty) {
				bucket.remove(&discriminator);
			}
			if bucket.is_empty() {
				self.channels.remove(selector);
			}
		}
		self.update_channel_count();
	}

	fn update_channel_count(&self) {
		let count = self.channels.values().map(HashMap::len).sum();
		self.counters.set_channels(count);
	}
}
