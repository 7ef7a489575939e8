// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Streaming fan-out of feature flag evaluations.
//!
//! Transport adapters (SSE, WebSocket, gRPC) ask a [`StreamServer`] for a
//! project's [`FlagStream`], open a [`Connection`] on it for a flag key or for
//! all flags, and forward whatever arrives in the connection's mailbox.
//!
//! Connections watching the same selector with the same evaluation context
//! share one evaluation per configuration change, and only receive a payload
//! when the served value actually changed.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use loom_flags_core::{EvaluationContext, ProjectId, Selector};
//! use loom_flags_stream::{NoopMetrics, StreamConfig, StreamServer};
//!
//! let server = StreamServer::new(registry, StreamConfig::default(), Arc::new(NoopMetrics));
//! let stream = server.get_by_project_id(&ProjectId::from("p")).await?;
//!
//! let context = EvaluationContext::new().with_attribute("id", "u1");
//! let mut conn = stream.create_connection(Selector::AllFlags, Some(context)).await;
//! while let Some(payload) = conn.recv().await {
//!     send_to_client(serde_json::to_string(&*payload)?).await?;
//! }
//! stream.close_connection(&conn).await;
//! ```

mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod server;
pub mod stream;

pub use config::{
	load_config_from_env, load_config_with_file, DeliveryPolicy, StreamConfig, StreamConfigLayer,
};
pub use connection::{Connection, ConnectionId};
pub use error::{ConfigError, Result};
pub use metrics::{NoopMetrics, ServerStats, StreamMetrics, StreamStats};
pub use server::StreamServer;
pub use stream::FlagStream;
