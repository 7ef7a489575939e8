// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::{FlagEvaluator, ProjectId};

/// A configured project: its identifier, access keys and evaluation engine.
#[derive(Clone)]
pub struct Project {
	pub id: ProjectId,
	/// Access keys clients may use instead of the identifier (primary, secondary...).
	pub keys: Vec<String>,
	pub engine: Arc<dyn FlagEvaluator>,
}

impl Project {
	pub fn new(id: impl Into<ProjectId>, engine: Arc<dyn FlagEvaluator>) -> Self {
		Self {
			id: id.into(),
			keys: Vec::new(),
			engine,
		}
	}

	pub fn with_key(mut self, key: impl Into<String>) -> Self {
		self.keys.push(key.into());
		self
	}

	pub fn has_key(&self, key: &str) -> bool {
		self.keys.iter().any(|k| k == key)
	}
}

impl fmt::Debug for Project {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Project")
			.field("id", &self.id)
			.field("keys", &self.keys.len())
			.finish_non_exhaustive()
	}
}

/// Membership change published by a dynamic registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectEvent {
	Added(ProjectId),
	Removed(ProjectId),
	/// The project's engine instance was swapped (e.g. its options changed).
	Replaced(ProjectId),
}

impl ProjectEvent {
	pub fn project_id(&self) -> &ProjectId {
		match self {
			ProjectEvent::Added(id) | ProjectEvent::Removed(id) | ProjectEvent::Replaced(id) => id,
		}
	}
}

/// Maps project identifiers and access keys to evaluation engines.
pub trait ProjectRegistry: Send + Sync {
	/// Every currently known project.
	fn projects(&self) -> Vec<Project>;

	fn get(&self, id: &ProjectId) -> Option<Project>;

	fn get_by_key(&self, key: &str) -> Option<Project> {
		self.projects().into_iter().find(|p| p.has_key(key))
	}

	/// Membership events, when the registry's project set can change at runtime.
	fn watch(&self) -> Option<broadcast::Receiver<ProjectEvent>> {
		None
	}
}
