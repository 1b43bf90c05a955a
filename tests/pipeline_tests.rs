//! End-to-end control flow against an in-memory bus.

use async_trait::async_trait;
use plugin_pipeline::bus::{BusMessage, Destination, InMemoryBus, MessageBus, MessageHandler, Properties};
use plugin_pipeline::config::{Config, EngineConfig};
use plugin_pipeline::control::{Action, ControlMessage};
use plugin_pipeline::engine::Pipeline;
use plugin_pipeline::error::ErrorKind;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout, Duration};

struct Forward(mpsc::UnboundedSender<BusMessage>);

#[async_trait]
impl MessageHandler for Forward {
    async fn on_message(&self, message: BusMessage) {
        let _ = self.0.send(message);
    }
}

fn control(action: &str, name: &str, type_name: &str, work: &str) -> String {
    format!(
        "<plugin>\n  <name>{name}</name>\n  <action>{action}</action>\n  <type>{type_name}</type>\n  \
         <version>1</version>\n  <work>{work}</work>\n  <destinations>\n    <input>in</input>\n    \
         <output>out</output>\n    <replyto>errors</replyto>\n  </destinations>\n</plugin>\n"
    )
}

fn echo(action: &str, name: &str) -> String {
    control(action, name, "pipeline.plugin.Echo", "")
}

async fn pipeline_at(dir: &TempDir, bus: Arc<InMemoryBus>) -> Pipeline {
    let pipeline = Pipeline::with_builtins(&Config::with_engine(EngineConfig::rooted_at(dir.path())), bus);
    pipeline.prepare_dirs().await.unwrap();
    pipeline
}

async fn listen(bus: &InMemoryBus, address: &str) -> (plugin_pipeline::bus::Subscription, mpsc::UnboundedReceiver<BusMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = bus
        .subscribe(&Destination::new(address), Arc::new(Forward(tx)))
        .await
        .unwrap();
    (subscription, rx)
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_new_conflict_stop_lifecycle() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_at(&dir, Arc::new(InMemoryBus::new())).await;

    let outcome = pipeline.handle_control(&echo("new", "echo1")).await.unwrap();
    assert_eq!(outcome.action, Action::New);
    assert!(outcome.persisted);
    assert_eq!(pipeline.plugin_names(), "echo1");
    assert!(pipeline.store().exists("echo1").await);

    let err = pipeline.handle_control(&echo("new", "echo1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NameConflict);

    pipeline.handle_control(&echo("stop", "echo1")).await.unwrap();
    assert_eq!(pipeline.plugin_count(), 0);
    assert!(!pipeline.store().exists("echo1").await);
    assert_eq!(pipeline.message_count(), 3);
}

#[tokio::test]
async fn test_persisted_descriptor_is_rewritten_to_new() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_at(&dir, Arc::new(InMemoryBus::new())).await;

    pipeline.handle_control(&echo("new", "echo1")).await.unwrap();
    pipeline.handle_control(&echo("UPDATE", "echo1")).await.unwrap();

    let persisted = std::fs::read_to_string(pipeline.store().path_for("echo1")).unwrap();
    assert_eq!(persisted, echo("new", "echo1"));
    let reparsed = ControlMessage::parse(&persisted, true).unwrap();
    assert_eq!(reparsed.action, Action::New);
}

#[tokio::test]
async fn test_replay_recreates_plugins() {
    let dir = TempDir::new().unwrap();
    {
        let pipeline = pipeline_at(&dir, Arc::new(InMemoryBus::new())).await;
        pipeline.handle_control(&echo("new", "a")).await.unwrap();
        pipeline.handle_control(&echo("new", "b")).await.unwrap();
        pipeline.handle_control(&echo("new", "c")).await.unwrap();
        pipeline.handle_control(&echo("stop", "b")).await.unwrap();
        pipeline.shutdown().await;
    }
    std::fs::write(dir.path().join("startup").join("notes.txt"), "ignored").unwrap();

    let restarted = pipeline_at(&dir, Arc::new(InMemoryBus::new())).await;
    assert_eq!(restarted.replay_persisted().await.unwrap(), 2);
    assert_eq!(restarted.plugin_names(), "a,c");
}

#[tokio::test]
async fn test_replay_skips_bad_descriptors() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_at(&dir, Arc::new(InMemoryBus::new())).await;
    let startup = dir.path().join("startup");
    std::fs::write(startup.join("good.xml"), echo("new", "good")).unwrap();
    std::fs::write(startup.join("broken.xml"), "<plugin><name>broken</name>").unwrap();

    assert_eq!(pipeline.replay_persisted().await.unwrap(), 1);
    assert_eq!(pipeline.plugin_names(), "good");
    assert_eq!(pipeline.message_count(), 2);
}

#[tokio::test]
async fn test_update_and_stop_of_unknown_name() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_at(&dir, Arc::new(InMemoryBus::new())).await;

    for action in ["update", "stop"] {
        let err = pipeline.handle_control(&echo(action, "ghost")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NameNotFound);
    }
    assert_eq!(pipeline.plugin_count(), 0);
}

#[tokio::test]
async fn test_version_mismatch_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_at(&dir, Arc::new(InMemoryBus::new())).await;

    let xml = echo("new", "echo1").replace("<version>1</version>", "<version>2</version>");
    let err = pipeline.handle_control(&xml).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VersionMismatch);
    assert!(!pipeline.contains("echo1"));
    assert!(!pipeline.store().exists("echo1").await);
}

#[tokio::test]
async fn test_malformed_messages_are_rejected() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_at(&dir, Arc::new(InMemoryBus::new())).await;

    let cases = [
        "not xml at all".to_string(),
        "<plugin><name>x</name>".to_string(),
        "<control><name>x</name><action>new</action></control>".to_string(),
        echo("restart", "x"),
        echo("new", "../escape"),
        echo("new", "x").replace("<input>in</input>", ""),
        echo("new", "x").replace("</destinations>", "</destinations><extra/>"),
    ];
    for xml in &cases {
        let err = pipeline.handle_control(xml).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedControlMessage, "{xml}");
    }
    assert_eq!(pipeline.plugin_count(), 0);
    assert_eq!(pipeline.message_count(), cases.len() as u64);
}

#[tokio::test]
async fn test_kill_keeps_descriptor() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_at(&dir, Arc::new(InMemoryBus::new())).await;
    pipeline.handle_control(&echo("new", "echo1")).await.unwrap();

    assert_eq!(pipeline.kill_plugin("echo1").await, 0);
    assert_eq!(pipeline.kill_plugin("echo1").await, 1);
    assert!(!pipeline.contains("echo1"));
    assert!(pipeline.store().exists("echo1").await);
}

#[tokio::test]
async fn test_update_replaces_running_instance() {
    let dir = TempDir::new().unwrap();
    let bus = Arc::new(InMemoryBus::new());
    let pipeline = pipeline_at(&dir, bus.clone()).await;
    let (_out, mut out) = listen(&bus, "out").await;

    pipeline.handle_control(&echo("new", "p1")).await.unwrap();
    let template = "<invoice><to>{{/order/customer}}</to></invoice>";
    pipeline
        .handle_control(&control("update", "p1", "pipeline.plugin.XmlTransform", template))
        .await
        .unwrap();
    assert_eq!(bus.subscriber_count(&Destination::new("in")), 1);
    assert!(pipeline.plugin_info("p1").contains("type=pipeline.plugin.XmlTransform"));

    bus.publish(
        &Destination::new("in"),
        "<order><customer>Ann</customer></order>".into(),
        Properties::new(),
    )
    .await
    .unwrap();
    let rendered = timeout(Duration::from_secs(2), out.recv()).await.unwrap().unwrap();
    assert_eq!(rendered.payload, "<invoice><to>Ann</to></invoice>");
}

#[tokio::test]
async fn test_transform_failure_notifies_reply_to() {
    let dir = TempDir::new().unwrap();
    let bus = Arc::new(InMemoryBus::new());
    let pipeline = pipeline_at(&dir, bus.clone()).await;
    let (_errors, mut errors) = listen(&bus, "errors").await;

    let template = "<invoice><to>{{/order/customer}}</to></invoice>";
    pipeline
        .handle_control(&control("new", "t1", "pipeline.plugin.XmlTransform", template))
        .await
        .unwrap();
    bus.publish(&Destination::new("in"), "<order/>".into(), Properties::new())
        .await
        .unwrap();

    let notice = timeout(Duration::from_secs(2), errors.recv()).await.unwrap().unwrap();
    assert!(notice.payload.starts_with("plugin=t1,"));
    assert_eq!(pipeline.plugin_operation_count("t1"), 0);
}

#[tokio::test]
async fn test_run_applies_control_stream() {
    let dir = TempDir::new().unwrap();
    let bus = Arc::new(InMemoryBus::new());
    let pipeline = Arc::new(pipeline_at(&dir, bus.clone()).await);
    let control_destination = Destination::new("pipeline.control");

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let engine = pipeline.clone();
    let handle = tokio::spawn(async move { engine.run(shutdown_rx).await });

    eventually(|| bus.subscriber_count(&control_destination) == 1).await;
    let (_out, mut out) = listen(&bus, "out").await;
    bus.publish(&control_destination, echo("new", "echo1"), Properties::new())
        .await
        .unwrap();
    eventually(|| pipeline.contains("echo1")).await;

    bus.publish(&Destination::new("in"), "<ping/>".into(), Properties::new())
        .await
        .unwrap();
    let echoed = timeout(Duration::from_secs(2), out.recv()).await.unwrap().unwrap();
    assert_eq!(echoed.payload, "<ping/>");
    eventually(|| pipeline.plugin_operation_count("echo1") == 1).await;

    let snapshot = pipeline.snapshot();
    assert_eq!(snapshot.version, "1");
    assert_eq!(snapshot.message_count, 1);
    assert_eq!(snapshot.plugins.len(), 1);
    assert_eq!(snapshot.plugins[0].status, "OK");
    assert!(pipeline.render_metrics().contains("pipeline_control_messages_total 1"));
    let json: serde_json::Value = serde_json::from_str(&pipeline.snapshot_json().unwrap()).unwrap();
    assert_eq!(json["messageCount"], 1);
    assert_eq!(json["plugins"][0]["name"], "echo1");
    assert_eq!(json["plugins"][0]["typeName"], "pipeline.plugin.Echo");

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(pipeline.plugin_count(), 0);
    assert_eq!(bus.subscriber_count(&control_destination), 0);
    assert!(pipeline.store().exists("echo1").await);
}

#[tokio::test]
async fn test_replay_runs_before_queued_control_messages() {
    let dir = TempDir::new().unwrap();
    let bus = Arc::new(InMemoryBus::starting());
    let pipeline = Arc::new(pipeline_at(&dir, bus.clone()).await);
    std::fs::write(pipeline.store().path_for("x"), echo("new", "x")).unwrap();
    let control_destination = Destination::new("pipeline.control");

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let engine = pipeline.clone();
    let handle = tokio::spawn(async move { engine.run(shutdown_rx).await });

    // Queued while the bus is still starting, so it must wait for the replay.
    eventually(|| bus.subscriber_count(&control_destination) == 1).await;
    bus.publish(&control_destination, echo("stop", "x"), Properties::new())
        .await
        .unwrap();
    assert_eq!(pipeline.message_count(), 0);
    bus.mark_running();

    let persisted = pipeline.store().path_for("x");
    eventually(|| pipeline.message_count() == 2 && !pipeline.contains("x") && !persisted.exists()).await;
    sleep(Duration::from_millis(50)).await;
    assert!(!pipeline.contains("x"));
    assert_eq!(pipeline.message_count(), 2);

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
}
