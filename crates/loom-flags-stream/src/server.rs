// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Registry of per-project streams.
//!
//! The server builds one [`FlagStream`] for every project the registry knows
//! and, when the registry publishes membership events, keeps the set of
//! streams in step: added projects get a stream, removed projects have theirs
//! closed, and a project whose engine was swapped gets a fresh stream under
//! the same identifier and access keys.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use loom_flags_core::{FlagEvaluator, Project, ProjectEvent, ProjectId, ProjectRegistry};

use crate::config::StreamConfig;
use crate::metrics::{ServerStats, StreamMetrics};
use crate::stream::FlagStream;

#[derive(Default)]
struct StreamIndex {
	by_id: HashMap<ProjectId, Arc<FlagStream>>,
	by_key: HashMap<String, ProjectId>,
}

impl StreamIndex {
	fn index_keys(&mut self, project: &Project) {
		self.by_key.retain(|_, id| id != &project.id);
		for key in &project.keys {
			self.by_key.insert(key.clone(), project.id.clone());
		}
	}

	fn remove(&mut self, id: &ProjectId) -> Option<Arc<FlagStream>> {
		self.by_key.retain(|_, indexed| indexed != id);
		self.by_id.remove(id)
	}
}

struct ServerState {
	registry: Arc<dyn ProjectRegistry>,
	config: StreamConfig,
	metrics: Arc<dyn StreamMetrics>,
	index: RwLock<StreamIndex>,
	closed: AtomicBool,
}

/// Maps project identifiers and access keys to their streams.
pub struct StreamServer {
	state: Arc<ServerState>,
	shutdown: CancellationToken,
	watcher: Mutex<Option<JoinHandle<()>>>,
}

impl StreamServer {
	/// Builds a stream for every known project and starts following the
	/// registry's membership events when it publishes any.
	///
	/// Must be called from within a Tokio runtime.
	pub fn new(
		registry: Arc<dyn ProjectRegistry>,
		config: StreamConfig,
		metrics: Arc<dyn StreamMetrics>,
	) -> Self {
		// Subscribe before the initial scan so no event falls in between.
		let events = registry.watch();

		let mut index = StreamIndex::default();
		for project in registry.projects() {
			let stream = FlagStream::spawn(
				project.id.clone(),
				project.engine.clone(),
				&config,
				metrics.clone(),
			);
			index.index_keys(&project);
			index.by_id.insert(project.id.clone(), stream);
		}
		info!(
			projects = index.by_id.len(),
			server_type = %config.server_type,
			dynamic = events.is_some(),
			"stream server started"
		);

		let state = Arc::new(ServerState {
			registry,
			config,
			metrics,
			index: RwLock::new(index),
			closed: AtomicBool::new(false),
		});
		let shutdown = CancellationToken::new();
		let watcher = events.map(|events| {
			tokio::spawn(watch_registry(state.clone(), events, shutdown.clone()))
		});

		Self {
			state,
			shutdown,
			watcher: Mutex::new(watcher),
		}
	}

	pub async fn get_by_project_id(&self, id: &ProjectId) -> Option<Arc<FlagStream>> {
		self.state.index.read().await.by_id.get(id).cloned()
	}

	/// Looks a stream up by one of its project's access keys.
	///
	/// Every hit is checked against the registry's current keys for the
	/// project. Keys the index has not seen yet are resolved through the
	/// registry, so a rotated key works before any membership event mentions
	/// it and a revoked key stops resolving.
	pub async fn get_by_project_key(&self, key: &str) -> Option<Arc<FlagStream>> {
		let cached = {
			let index = self.state.index.read().await;
			index
				.by_key
				.get(key)
				.and_then(|id| Some((id.clone(), index.by_id.get(id)?.clone())))
		};
		if let Some((id, stream)) = cached {
			let current = self.state.registry.get(&id);
			if current.as_ref().is_some_and(|project| project.has_key(key)) {
				return Some(stream);
			}

			let mut index = self.state.index.write().await;
			match &current {
				Some(project) => index.index_keys(project),
				None => {
					index.by_key.remove(key);
				}
			}
			debug!(project_id = %id, "access key revoked, evicted from index");
		}

		let project = self.state.registry.get_by_key(key)?;
		let mut index = self.state.index.write().await;
		let stream = index.by_id.get(&project.id).cloned()?;
		index.index_keys(&project);
		debug!(project_id = %project.id, "access key resolved through registry");
		Some(stream)
	}

	/// Identifiers of every project with a live stream, sorted.
	pub async fn project_ids(&self) -> Vec<ProjectId> {
		let mut ids: Vec<ProjectId> = self.state.index.read().await.by_id.keys().cloned().collect();
		ids.sort();
		ids
	}

	pub async fn stats(&self) -> ServerStats {
		let index = self.state.index.read().await;
		let mut stats = ServerStats::default();
		for stream in index.by_id.values() {
			stats.add(&stream.stats());
		}
		stats
	}

	pub fn is_closed(&self) -> bool {
		self.state.closed.load(Ordering::Acquire)
	}

	/// Stops following the registry and closes every stream. Idempotent.
	pub async fn close(&self) {
		if self.state.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		self.shutdown.cancel();
		if let Some(watcher) = self.watcher.lock().await.take() {
			if let Err(e) = watcher.await {
				warn!(error = %e, "registry watcher ended abnormally");
			}
		}

		let streams = {
			let mut index = self.state.index.write().await;
			index.by_key.clear();
			std::mem::take(&mut index.by_id)
		};
		for stream in streams.values() {
			stream.close();
		}
		info!(streams = streams.len(), "stream server closed");
	}
}

impl Drop for StreamServer {
	fn drop(&mut self) {
		self.shutdown.cancel();
	}
}

async fn watch_registry(
	state: Arc<ServerState>,
	mut events: broadcast::Receiver<ProjectEvent>,
	shutdown: CancellationToken,
) {
	loop {
		tokio::select! {
			biased;

			_ = shutdown.cancelled() => break,

			event = events.recv() => match event {
				Ok(event) => state.apply(event).await,
				Err(RecvError::Lagged(missed)) => {
					warn!(missed, "registry events lagged, reconciling all projects");
					state.reconcile().await;
				}
				Err(RecvError::Closed) => {
					debug!("registry event channel closed");
					break;
				}
			},
		}
	}
}

impl ServerState {
	async fn apply(&self, event: ProjectEvent) {
		debug!(event = ?event, "applying registry event");
		match event {
			ProjectEvent::Added(id) => match self.registry.get(&id) {
				Some(project) => self.add(project).await,
				None => debug!(project_id = %id, "added project already gone from registry"),
			},
			ProjectEvent::Removed(id) => self.remove(&id).await,
			ProjectEvent::Replaced(id) => match self.registry.get(&id) {
				Some(project) => self.replace(project).await,
				None => self.remove(&id).await,
			},
		}
	}

	async fn add(&self, project: Project) {
		let mut index = self.index.write().await;
		if !index.by_id.contains_key(&project.id) {
			let stream = self.spawn(&project);
			index.by_id.insert(project.id.clone(), stream);
			info!(project_id = %project.id, "stream added");
		}
		index.index_keys(&project);
	}

	async fn remove(&self, id: &ProjectId) {
		let removed = self.index.write().await.remove(id);
		if let Some(stream) = removed {
			stream.close();
			info!(project_id = %id, "stream removed");
		}
	}

	async fn replace(&self, project: Project) {
		let previous = {
			let mut index = self.index.write().await;
			let stream = self.spawn(&project);
			index.index_keys(&project);
			index.by_id.insert(project.id.clone(), stream)
		};
		if let Some(previous) = previous {
			previous.close();
		}
		info!(project_id = %project.id, "stream replaced");
	}

	/// Brings the index in line with the registry's current project set.
	async fn reconcile(&self) {
		let projects = self.registry.projects();
		let mut retired = Vec::new();
		{
			let mut index = self.index.write().await;

			let live: Vec<ProjectId> = index.by_id.keys().cloned().collect();
			for id in live {
				if !projects.iter().any(|p| p.id == id) {
					retired.extend(index.remove(&id));
				}
			}

			for project in &projects {
				let current = index.by_id.get(&project.id);
				let stale =
					current.is_some_and(|stream| !same_engine(stream.engine(), &project.engine));
				if current.is_none() || stale {
					let stream = self.spawn(project);
					retired.extend(index.by_id.insert(project.id.clone(), stream));
				}
				index.index_keys(project);
			}
		}

		for stream in &retired {
			stream.close();
		}
		info!(
			projects = projects.len(),
			retired = retired.len(),
			"reconciled streams with registry"
		);
	}

	fn spawn(&self, project: &Project) -> Arc<FlagStream> {
		FlagStream::spawn(
			project.id.clone(),
			project.engine.clone(),
			&self.config,
			self.metrics.clone(),
		)
	}
}

/// Whether two handles point at the same engine instance.
fn same_engine(a: &Arc<dyn FlagEvaluator>, b: &Arc<dyn FlagEvaluator>) -> bool {
	std::ptr::eq(
		Arc::as_ptr(a) as *const (),
		Arc::as_ptr(b) as *const (),
	)
}
