// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! End-to-end behavior through server, stream and connection.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use loom_flags_core::{EvaluationContext, Project, ProjectId, Selector, StreamPayload, VariantValue};
use loom_flags_engine::{
	AttributeOperator, Condition, FlagDefinition, MemoryEvaluator, MemoryRegistry, Variant,
};
use loom_flags_stream::{
	Connection, DeliveryPolicy, FlagStream, NoopMetrics, StreamConfig, StreamMetrics, StreamServer,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(100);

fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

async fn next(conn: &mut Connection) -> Arc<StreamPayload> {
	timeout(WAIT, conn.recv())
		.await
		.expect("timed out waiting for payload")
		.expect("mailbox ended")
}

async fn assert_quiet(conn: &mut Connection) {
	assert!(
		timeout(QUIET, conn.recv()).await.is_err(),
		"unexpected payload"
	);
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
	timeout(WAIT, async {
		while !condition() {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("condition not reached");
}

fn single_project(engine: Arc<MemoryEvaluator>) -> StreamServer {
	let registry = MemoryRegistry::fixed([Project::new("p", engine).with_key("sdk-key")]);
	StreamServer::new(
		Arc::new(registry),
		StreamConfig::default(),
		Arc::new(NoopMetrics),
	)
}

#[tokio::test]
async fn single_flag_and_all_flags_each_see_one_change() {
	init_tracing();
	let engine = Arc::new(MemoryEvaluator::with_flags([FlagDefinition::constant(
		"flag", false,
	)]));
	let server = single_project(engine.clone());
	let stream = server.get_by_project_id(&ProjectId::from("p")).await.unwrap();

	let mut a = stream.create_connection(Selector::flag("flag"), None).await;
	let user = EvaluationContext::new().with_attribute("id", "u1");
	let mut b = stream.create_connection(Selector::AllFlags, Some(user)).await;

	let initial_a = next(&mut a).await;
	assert_eq!(
		initial_a.as_flag().unwrap().value,
		Some(VariantValue::Boolean(false))
	);
	let initial_b = next(&mut b).await;
	assert_eq!(
		initial_b.as_flags().unwrap()["flag"].value,
		Some(VariantValue::Boolean(false))
	);

	engine.set_flag(FlagDefinition::constant("flag", true));

	let changed_a = next(&mut a).await;
	assert_eq!(
		changed_a.as_flag().unwrap().value,
		Some(VariantValue::Boolean(true))
	);
	let changed_b = next(&mut b).await;
	let flags = changed_b.as_flags().unwrap();
	assert_eq!(flags.len(), 1);
	assert_eq!(flags["flag"].value, Some(VariantValue::Boolean(true)));

	assert_quiet(&mut a).await;
	assert_quiet(&mut b).await;

	server.close().await;
}

#[tokio::test]
async fn unchanged_values_are_not_pushed() {
	init_tracing();
	let engine = Arc::new(MemoryEvaluator::with_flags([
		FlagDefinition::constant("flag", false),
		FlagDefinition::constant("other", "x"),
	]));
	let server = single_project(engine.clone());
	let stream = server.get_by_project_key("sdk-key").await.unwrap();

	let mut conn = stream.create_connection(Selector::flag("flag"), None).await;
	next(&mut conn).await;

	engine.set_flag(FlagDefinition::constant("other", "y"));
	assert_quiet(&mut conn).await;

	server.close().await;
}

#[tokio::test]
async fn contexts_evaluate_independently() {
	init_tracing();
	let flag = FlagDefinition::new("beta", Variant::new("off", false)).with_rule(
		vec![Condition::new("plan", AttributeOperator::Equals, "pro")],
		Variant::new("on", true),
	);
	let engine = Arc::new(MemoryEvaluator::with_flags([flag]));
	let server = single_project(engine.clone());
	let stream = server.get_by_project_id(&ProjectId::from("p")).await.unwrap();

	let pro = EvaluationContext::new().with_attribute("plan", "pro");
	let free = EvaluationContext::new().with_attribute("plan", "free");
	let mut pro_conn = stream.create_connection(Selector::flag("beta"), Some(pro)).await;
	let mut free_conn = stream.create_connection(Selector::flag("beta"), Some(free)).await;

	assert_eq!(
		next(&mut pro_conn).await.as_flag().unwrap().value,
		Some(VariantValue::Boolean(true))
	);
	assert_eq!(
		next(&mut free_conn).await.as_flag().unwrap().value,
		Some(VariantValue::Boolean(false))
	);

	// Rule now targets free users: both values flip.
	engine.set_flag(
		FlagDefinition::new("beta", Variant::new("off", false)).with_rule(
			vec![Condition::new("plan", AttributeOperator::Equals, "free")],
			Variant::new("on", true),
		),
	);
	assert_eq!(
		next(&mut pro_conn).await.as_flag().unwrap().value,
		Some(VariantValue::Boolean(false))
	);
	assert_eq!(
		next(&mut free_conn).await.as_flag().unwrap().value,
		Some(VariantValue::Boolean(true))
	);

	server.close().await;
}

#[tokio::test]
async fn closing_one_connection_leaves_others_untouched() {
	init_tracing();
	let engine = Arc::new(MemoryEvaluator::with_flags([FlagDefinition::constant(
		"flag", 1i64,
	)]));
	let server = single_project(engine.clone());
	let stream = server.get_by_project_id(&ProjectId::from("p")).await.unwrap();

	let mut a = stream.create_connection(Selector::flag("flag"), None).await;
	let mut b = stream.create_connection(Selector::flag("flag"), None).await;
	next(&mut a).await;
	next(&mut b).await;

	stream.close_connection(&a).await;
	engine.set_flag(FlagDefinition::constant("flag", 2i64));

	assert_eq!(
		next(&mut b).await.as_flag().unwrap().value,
		Some(VariantValue::Integer(2))
	);
	assert_eq!(timeout(WAIT, a.recv()).await.unwrap(), None);

	server.close().await;
}

#[tokio::test]
async fn payloads_serialize_as_client_json() {
	let engine = Arc::new(MemoryEvaluator::with_flags([FlagDefinition::new(
		"banner",
		Variant::new("v-blue", "blue"),
	)]));
	let server = single_project(engine);
	let stream = server.get_by_project_id(&ProjectId::from("p")).await.unwrap();

	let mut single = stream.create_connection(Selector::flag("banner"), None).await;
	let mut all = stream.create_connection(Selector::AllFlags, None).await;

	let single_json = serde_json::to_value(&*next(&mut single).await).unwrap();
	assert_eq!(
		single_json,
		serde_json::json!({"value": "blue", "variationId": "v-blue"})
	);

	let all_json = serde_json::to_value(&*next(&mut all).await).unwrap();
	assert_eq!(
		all_json,
		serde_json::json!({"banner": {"value": "blue", "variationId": "v-blue"}})
	);

	server.close().await;
}

#[tokio::test]
async fn full_mailbox_drops_instead_of_stalling() {
	init_tracing();
	let engine = Arc::new(MemoryEvaluator::with_flags([FlagDefinition::constant(
		"flag", 0i64,
	)]));
	let config = StreamConfig {
		mailbox_capacity: 1,
		delivery: DeliveryPolicy::DropNewest,
		..StreamConfig::default()
	};
	let stream = FlagStream::spawn(
		ProjectId::from("p"),
		engine.clone(),
		&config,
		Arc::new(NoopMetrics),
	);

	// `slow` never reads after its initial payload; `fast` keeps up.
	let mut slow = stream.create_connection(Selector::flag("flag"), None).await;
	let mut fast = stream.create_connection(Selector::flag("flag"), None).await;
	next(&mut fast).await;
	wait_until(|| stream.stats().payloads_sent == 2).await;

	for n in 1..=3i64 {
		engine.set_flag(FlagDefinition::constant("flag", n));
		assert_eq!(
			next(&mut fast).await.as_flag().unwrap().value,
			Some(VariantValue::Integer(n))
		);
	}

	wait_until(|| stream.stats().payloads_dropped == 3).await;
	assert_eq!(
		next(&mut slow).await.as_flag().unwrap().value,
		Some(VariantValue::Integer(0))
	);
	stream.close();
}

#[derive(Default)]
struct RecordingMetrics {
	events: Mutex<Vec<String>>,
}

impl RecordingMetrics {
	fn events(&self) -> Vec<String> {
		self.events.lock().unwrap().clone()
	}
}

impl StreamMetrics for RecordingMetrics {
	fn connection_opened(&self, project_id: &ProjectId, server_type: &str, selector: &Selector) {
		self
			.events
			.lock()
			.unwrap()
			.push(format!("opened {project_id} {server_type} {selector}"));
	}

	fn connection_closed(&self, project_id: &ProjectId, server_type: &str, selector: &Selector) {
		self
			.events
			.lock()
			.unwrap()
			.push(format!("closed {project_id} {server_type} {selector}"));
	}

	fn payloads_sent(&self, count: u64, project_id: &ProjectId, _: &str, selector: &Selector) {
		self
			.events
			.lock()
			.unwrap()
			.push(format!("sent {count} {project_id} {selector}"));
	}

	fn payloads_dropped(&self, count: u64, project_id: &ProjectId, _: &str, selector: &Selector) {
		self
			.events
			.lock()
			.unwrap()
			.push(format!("dropped {count} {project_id} {selector}"));
	}
}

#[tokio::test]
async fn metrics_follow_connection_lifecycle() {
	let engine = Arc::new(MemoryEvaluator::with_flags([FlagDefinition::constant(
		"flag", false,
	)]));
	let metrics = Arc::new(RecordingMetrics::default());
	let config = StreamConfig {
		server_type: "sse".to_string(),
		..StreamConfig::default()
	};
	let stream = FlagStream::spawn(ProjectId::from("p"), engine.clone(), &config, metrics.clone());

	let mut conn = stream.create_connection(Selector::AllFlags, None).await;
	next(&mut conn).await;
	engine.set_flag(FlagDefinition::constant("flag", true));
	next(&mut conn).await;
	stream.close_connection(&conn).await;

	wait_until(|| metrics.events().len() == 4).await;
	assert_eq!(
		metrics.events(),
		vec![
			"sent 1 p [ALL]".to_string(),
			"opened p sse [ALL]".to_string(),
			"sent 1 p [ALL]".to_string(),
			"closed p sse [ALL]".to_string(),
		]
	);
	stream.close();
}

#[tokio::test]
async fn stream_closure_is_observable_by_adapters() {
	let engine = Arc::new(MemoryEvaluator::with_flags([FlagDefinition::constant(
		"flag", true,
	)]));
	let server = single_project(engine);
	let stream = server.get_by_project_id(&ProjectId::from("p")).await.unwrap();
	let mut conn = stream.create_connection(Selector::flag("flag"), None).await;
	next(&mut conn).await;

	let watcher = {
		let stream = stream.clone();
		tokio::spawn(async move { stream.closed().await })
	};

	server.close().await;

	timeout(WAIT, watcher).await.unwrap().unwrap();
	assert_eq!(timeout(WAIT, conn.recv()).await.unwrap(), None);
	assert!(!stream.is_in_valid_state());
}
