// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-memory [`ProjectRegistry`] with optional runtime membership changes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info};

use loom_flags_core::{FlagEvaluator, Project, ProjectEvent, ProjectId, ProjectRegistry};

/// Capacity of the membership event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Holds projects keyed by identifier.
///
/// A registry built with [`MemoryRegistry::fixed`] never publishes membership
/// events; one built with [`MemoryRegistry::dynamic`] publishes an event for
/// every add, remove and replace.
pub struct MemoryRegistry {
	projects: RwLock<HashMap<ProjectId, Project>>,
	events: Option<broadcast::Sender<ProjectEvent>>,
}

impl MemoryRegistry {
	pub fn fixed(projects: impl IntoIterator<Item = Project>) -> Self {
		Self {
			projects: RwLock::new(index(projects)),
			events: None,
		}
	}

	pub fn dynamic(projects: impl IntoIterator<Item = Project>) -> Self {
		let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
		Self {
			projects: RwLock::new(index(projects)),
			events: Some(tx),
		}
	}

	pub fn is_dynamic(&self) -> bool {
		self.events.is_some()
	}

	/// Registers a project. Returns `false` when the identifier is already taken.
	pub fn add_project(&self, project: Project) -> bool {
		let id = project.id.clone();
		{
			let mut projects = self.projects.write();
			if projects.contains_key(&id) {
				return false;
			}
			projects.insert(id.clone(), project);
		}
		info!(project_id = %id, "project registered");
		self.publish(ProjectEvent::Added(id));
		true
	}

	/// Unregisters a project and returns it when it existed.
	pub fn remove_project(&self, id: &ProjectId) -> Option<Project> {
		let removed = self.projects.write().remove(id);
		if removed.is_some() {
			info!(project_id = %id, "project unregistered");
			self.publish(ProjectEvent::Removed(id.clone()));
		}
		removed
	}

	/// Swaps the engine of an existing project, keeping its access keys.
	pub fn replace_engine(&self, id: &ProjectId, engine: Arc<dyn FlagEvaluator>) -> bool {
		let replaced = match self.projects.write().get_mut(id) {
			Some(project) => {
				project.engine = engine;
				true
			}
			None => false,
		};
		if replaced {
			info!(project_id = %id, "project engine replaced");
			self.publish(ProjectEvent::Replaced(id.clone()));
		}
		replaced
	}

	/// Replaces the access keys of an existing project.
	pub fn set_keys(&self, id: &ProjectId, keys: Vec<String>) -> bool {
		match self.projects.write().get_mut(id) {
			Some(project) => {
				project.keys = keys;
				true
			}
			None => false,
		}
	}

	pub fn len(&self) -> usize {
		self.projects.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.projects.read().is_empty()
	}

	fn publish(&self, event: ProjectEvent) {
		if let Some(tx) = &self.events {
			// No receivers is fine; nobody is watching yet.
			let receivers = tx.send(event.clone()).unwrap_or(0);
			debug!(event = ?event, receivers, "published project event");
		}
	}
}

fn index(projects: impl IntoIterator<Item = Project>) -> HashMap<ProjectId, Project> {
	projects.into_iter().map(|p| (p.id.clone(), p)).collect()
}

impl ProjectRegistry for MemoryRegistry {
	fn projects(&self) -> Vec<Project> {
		self.projects.read().values().cloned().collect()
	}

	fn get(&self, id: &ProjectId) -> Option<Project> {
		self.projects.read().get(id).cloned()
	}

	fn get_by_key(&self, key: &str) -> Option<Project> {
		self
			.projects
			.read()
			.values()
			.find(|p| p.has_key(key))
			.cloned()
	}

	fn watch(&self) -> Option<broadcast::Receiver<ProjectEvent>> {
		self.events.as_ref().map(broadcast::Sender::subscribe)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{FlagDefinition, MemoryEvaluator};

	fn engine() -> Arc<dyn FlagEvaluator> {
		Arc::new(MemoryEvaluator::with_flags([FlagDefinition::constant(
			"flag", true,
		)]))
	}

	#[test]
	fn test_fixed_registry_has_no_events() {
		let registry = MemoryRegistry::fixed([Project::new("p1", engine())]);

		assert!(!registry.is_dynamic());
		assert!(registry.watch().is_none());
		assert!(registry.get(&ProjectId::from("p1")).is_some());
	}

	#[test]
	fn test_lookup_by_key() {
		let registry = MemoryRegistry::fixed([
			Project::new("p1", engine()).with_key("primary-1"),
			Project::new("p2", engine())
				.with_key("primary-2")
				.with_key("secondary-2"),
		]);

		assert_eq!(
			registry.get_by_key("secondary-2").map(|p| p.id),
			Some(ProjectId::from("p2"))
		);
		assert!(registry.get_by_key("unknown").is_none());
	}

	#[tokio::test]
	async fn test_dynamic_registry_publishes_events() {
		let registry = MemoryRegistry::dynamic([]);
		let mut events = registry.watch().unwrap();
		let id = ProjectId::from("p1");

		assert!(registry.add_project(Project::new("p1", engine())));
		assert!(!registry.add_project(Project::new("p1", engine())));
		assert!(registry.replace_engine(&id, engine()));
		assert!(registry.remove_project(&id).is_some());
		assert!(registry.remove_project(&id).is_none());

		assert_eq!(events.recv().await.unwrap(), ProjectEvent::Added(id.clone()));
		assert_eq!(events.recv().await.unwrap(), ProjectEvent::Replaced(id.clone()));
		assert_eq!(events.recv().await.unwrap(), ProjectEvent::Removed(id));
		assert!(events.try_recv().is_err());
	}

	#[test]
	fn test_set_keys_rotates_access_keys() {
		let registry = MemoryRegistry::fixed([Project::new("p1", engine()).with_key("old")]);
		let id = ProjectId::from("p1");

		assert!(registry.set_keys(&id, vec!["new".to_string()]));

		assert!(registry.get_by_key("old").is_none());
		assert!(registry.get_by_key("new").is_some());
		assert!(!registry.set_keys(&ProjectId::from("missing"), Vec::new()));
	}
}
