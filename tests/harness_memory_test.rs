//! Delivery properties against the in-process broker
//!
//! Runs on a paused clock so timing bounds are checked exactly:
//! - Topic creation followed by publish never misses the topic
//! - Eventual visibility whether the verifier starts before or after publish
//! - Verification timeout bounds
//! - Idempotent stop and session cleanup
//! - End-to-end and ordering scenarios

use std::time::Duration;
use tokio::time::Instant;
use velo_kafka_harness::harness::{
    BackendHandle, BackendProvisioner, BackendState, HarnessConfig, HarnessError,
    InMemoryBroker, InMemoryOptions, MessagePublisher, MessageVerifier, RunPlan,
    TestOrchestrator, TopicAdministrator, TopicDescriptor,
};

struct Harness {
    config: HarnessConfig,
    broker: InMemoryBroker,
    provisioner: BackendProvisioner,
    handle: BackendHandle,
}

impl Harness {
    async fn start(options: InMemoryOptions) -> Self {
        let config = HarnessConfig::in_memory();
        let broker = InMemoryBroker::with_options(options);
        let provisioner =
            BackendProvisioner::new(config.clone()).with_memory_broker(broker.clone());
        let handle = provisioner.start().await.expect("Failed to start backend");
        Self {
            config,
            broker,
            provisioner,
            handle,
        }
    }

    async fn create(&self, name: &str, partitions: i32) {
        let topic = TopicDescriptor::new(name, partitions, 1).unwrap();
        TopicAdministrator::new(&self.config)
            .create_topic(&self.handle, &topic)
            .await
            .expect("Failed to create topic");
    }

    fn publisher(&self) -> MessagePublisher {
        MessagePublisher::new(&self.config)
    }

    fn verifier(&self) -> MessageVerifier {
        MessageVerifier::new(&self.config)
    }

    async fn stop(mut self) {
        self.provisioner.stop(&mut self.handle).await.unwrap();
        assert_eq!(self.broker.open_sessions(), 0, "consumer session leaked");
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_publish_right_after_create_finds_topic() {
    let harness = Harness::start(InMemoryOptions {
        propagation_delay: Duration::from_millis(400),
        ..InMemoryOptions::default()
    })
    .await;

    for (i, name) in ["orders", "orders.v2", "eu_orders-1"].iter().enumerate() {
        harness.create(name, i as i32 + 1).await;
        let metadata = harness
            .publisher()
            .publish(&harness.handle, name, None, b"payload")
            .await
            .expect("publish after create must not fail");
        assert_eq!(metadata.topic, *name);
    }

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_orders_end_to_end() {
    let harness = Harness::start(InMemoryOptions::default()).await;
    harness.create("orders", 1).await;

    harness
        .publisher()
        .publish(&harness.handle, "orders", None, b"order-42")
        .await
        .unwrap();

    let outcome = harness
        .verifier()
        .verify(
            &harness.handle,
            "orders",
            &strings(&["order-42"]),
            Duration::from_secs(10),
        )
        .await
        .expect("verification should succeed");

    assert_eq!(outcome.records.len(), 1);
    assert_eq!(outcome.values, strings(&["order-42"]));

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_publish_reports_no_messages() {
    let harness = Harness::start(InMemoryOptions::default()).await;
    harness.create("orders", 1).await;

    let started = Instant::now();
    let err = harness
        .verifier()
        .verify(
            &harness.handle,
            "orders",
            &strings(&["order-42"]),
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();

    match err {
        HarnessError::NoMessagesReceived { ref topic, .. } => assert_eq!(topic, "orders"),
        other => panic!("expected NoMessagesReceived, got {:?}", other),
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed <= Duration::from_secs(2) + harness.config.poll_interval());

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_ordering_within_partition() {
    let harness = Harness::start(InMemoryOptions::default()).await;
    harness.create("orders", 1).await;

    let publisher = harness.publisher();
    publisher
        .publish(&harness.handle, "orders", None, b"a")
        .await
        .unwrap();
    publisher
        .publish(&harness.handle, "orders", None, b"b")
        .await
        .unwrap();

    let outcome = harness
        .verifier()
        .verify(
            &harness.handle,
            "orders",
            &strings(&["a", "b"]),
            Duration::from_secs(10),
        )
        .await
        .unwrap();

    let offsets: Vec<i64> = outcome.records.iter().map(|r| r.offset).collect();
    assert_eq!(outcome.values, strings(&["a", "b"]));
    assert_eq!(offsets, vec![0, 1]);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_verifier_started_before_publish() {
    let harness = Harness::start(InMemoryOptions {
        visibility_delay: Duration::from_millis(150),
        ..InMemoryOptions::default()
    })
    .await;
    harness.create("orders", 1).await;

    let verifier = harness.verifier();
    let publisher = harness.publisher();
    let expected = strings(&["late-order"]);

    let (verified, published) = tokio::join!(
        verifier.verify(&harness.handle, "orders", &expected, Duration::from_secs(5)),
        async {
            tokio::time::sleep(Duration::from_millis(700)).await;
            publisher
                .publish(&harness.handle, "orders", None, b"late-order")
                .await
        }
    );

    published.unwrap();
    let outcome = verified.expect("record published after subscribe must be observed");
    assert_eq!(outcome.values, expected);
    assert!(outcome.polls > 1, "verification must poll repeatedly");

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_visibility_latency_within_deadline() {
    let harness = Harness::start(InMemoryOptions {
        visibility_delay: Duration::from_millis(1_500),
        ..InMemoryOptions::default()
    })
    .await;
    harness.create("orders", 1).await;

    harness
        .publisher()
        .publish(&harness.handle, "orders", None, b"slow")
        .await
        .unwrap();

    let outcome = harness
        .verifier()
        .verify(
            &harness.handle,
            "orders",
            &strings(&["slow"]),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert!(outcome.elapsed >= Duration::from_millis(1_500));

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_each_verification_uses_fresh_session() {
    let harness = Harness::start(InMemoryOptions::default()).await;
    harness.create("orders", 1).await;
    harness
        .publisher()
        .publish(&harness.handle, "orders", None, b"once")
        .await
        .unwrap();

    let verifier = harness.verifier();
    let first = verifier
        .verify(&harness.handle, "orders", &strings(&["once"]), Duration::from_secs(1))
        .await
        .unwrap();
    let second = verifier
        .verify(&harness.handle, "orders", &strings(&["once"]), Duration::from_secs(1))
        .await
        .unwrap();

    assert_ne!(first.group_id, second.group_id);
    assert_eq!(harness.broker.sessions_opened(), 2);

    harness.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let mut harness = Harness::start(InMemoryOptions::default()).await;

    harness.provisioner.stop(&mut harness.handle).await.unwrap();
    harness
        .provisioner
        .stop(&mut harness.handle)
        .await
        .expect("second stop must not fail");

    assert_eq!(harness.handle.state(), BackendState::StoppedFinal);
    assert!(!harness.broker.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_run_isolates_scenario_failures() {
    let plan = RunPlan::from_yaml(
        r#"
name: orders
topics:
  - name: orders
  - name: orders
scenarios:
  - name: nothing published
    topic: orders
    expect: [order-42]
    within_ms: 2000
  - name: single order
    topic: orders
    publish:
      - payload: order-42
    expect: [order-42]
  - name: wrong value
    topic: orders
    expect: [order-43]
    within_ms: 500
"#,
    )
    .unwrap();

    let broker = InMemoryBroker::new();
    let report = TestOrchestrator::new(HarnessConfig::in_memory())
        .with_memory_broker(broker.clone())
        .run(&plan)
        .await
        .unwrap();

    assert_eq!(report.topics.len(), 1, "duplicate topic declared once");
    assert_eq!(report.summary.total, 3);
    assert_eq!(report.summary.passed, 1);

    let kinds: Vec<String> = report
        .scenarios
        .iter()
        .map(|s| s.error_kind.map(|k| k.to_string()).unwrap_or_default())
        .collect();
    assert_eq!(kinds, vec!["NoMessagesReceived", "", "PartialMismatch"]);

    assert!(!broker.is_running(), "backend stopped after the run");
    assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_provisioning_failure_fails_run() {
    let config = HarnessConfig {
        startup_timeout_ms: 1_000,
        ..HarnessConfig::in_memory()
    };
    let broker = InMemoryBroker::with_options(InMemoryOptions {
        startup_delay: Duration::from_secs(120),
        ..InMemoryOptions::default()
    });

    let err = TestOrchestrator::new(config)
        .with_memory_broker(broker)
        .run(&RunPlan::smoke())
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::StartupTimeout { .. }));
}
