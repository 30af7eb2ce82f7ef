//! Publish/consume behaviour against the in-memory broker
//!
//! Tests cover:
//! - Publish-time stamping and field preservation
//! - Acknowledgement, negative acknowledgement and redelivery
//! - Failed acks that leave the consume loop running
//! - Prefetch flow control
//! - Undecodable messages under both decode-failure policies
//! - Setup failures and their cleanup
//! - Close semantics
//!
//! No broker is needed; see `rabbitmq_integration_tests.rs` for the live suite.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use log_bus::*;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);

async fn client_for(broker: &InMemoryBroker, topic: &str) -> LogClient {
    LogClient::connect_with(broker, &BrokerConfig::new("memory://local"), topic)
        .await
        .expect("in-memory setup should succeed")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn audit(search_key: &str) -> AuditLog {
    AuditLog::new("orders", "update", search_key)
        .with_snapshots(r#"{"qty":1}"#, r#"{"qty":2}"#)
        .with_action_by("alice")
}

// =============================================================================
// PUBLISH / CONSUME ROUND TRIP
// =============================================================================

#[tokio::test]
async fn test_round_trip_preserves_fields_and_stamps_publish_time() {
    let broker = InMemoryBroker::new();
    let client = client_for(&broker, AUDIT_TOPIC_NAME).await;

    let mut original = audit("42");
    original.action_time = Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap();

    let publish_started = Utc::now();
    client.publish_audit_log(original.clone()).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .consume_audit_logs(ConsumeOptions::default(), move |log: AuditLog, ack: Acknowledgement| {
            let tx = tx.clone();
            async move {
                let handled_at = Utc::now();
                ack.ack().await;
                tx.send((log, handled_at)).unwrap();
            }
        })
        .await
        .unwrap();

    let (received, handled_at) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(received.action_time >= publish_started);
    assert!(received.action_time <= handled_at);

    let mut expected = original;
    expected.action_time = received.action_time;
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_five_audit_records_arrive_exactly_once() {
    let broker = InMemoryBroker::new();
    let client = client_for(&broker, AUDIT_TOPIC_NAME).await;

    for key in ["1", "2", "3", "4", "5"] {
        client.publish_audit_log(audit(key)).await.unwrap();
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .consume_audit_logs(
            ConsumeOptions::default().with_prefetch_count(50),
            move |log: AuditLog, ack: Acknowledgement| {
                let tx = tx.clone();
                async move {
                    ack.settle(true).await;
                    tx.send(log).unwrap();
                }
            },
        )
        .await
        .unwrap();

    let mut keys = Vec::new();
    for _ in 0..5 {
        let log = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(log.module, "orders");
        assert_eq!(log.before, r#"{"qty":1}"#);
        keys.push(log.search_key);
    }
    assert!(timeout(QUIET, rx.recv()).await.is_err(), "no sixth delivery expected");

    keys.sort();
    assert_eq!(keys, vec!["1", "2", "3", "4", "5"]);
    assert_eq!(broker.ready_count(AUDIT_TOPIC_NAME), 0);
    assert_eq!(broker.unacked_count(AUDIT_TOPIC_NAME), 0);
}

#[tokio::test]
async fn test_activity_optional_fields_absent_on_the_wire() {
    let broker = InMemoryBroker::new();
    let client = client_for(&broker, ACTIVITY_TOPIC_NAME).await;

    client
        .publish_activity_log(ActivityLog::new("u-7", "bob", "exported report", "reports"))
        .await
        .unwrap();

    let bodies = broker.ready_bodies(ACTIVITY_TOPIC_NAME);
    assert_eq!(bodies.len(), 1);
    let payload: Value = serde_json::from_slice(&bodies[0]).unwrap();
    for key in ["ip_address", "device_info", "location", "remarks"] {
        assert!(payload.get(key).is_none(), "{key} must be omitted");
    }
    assert_eq!(payload["username"], "bob");
    assert!(payload["activity_time"].is_string());

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .consume_activity_logs(ConsumeOptions::default(), move |log: ActivityLog, ack: Acknowledgement| {
            let tx = tx.clone();
            async move {
                ack.ack().await;
                tx.send(log).unwrap();
            }
        })
        .await
        .unwrap();

    let decoded = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(decoded.ip_address, "");
    assert_eq!(decoded.device_info, "");
    assert_eq!(decoded.location, "");
    assert_eq!(decoded.remarks, "");
}

#[tokio::test]
async fn test_activity_time_is_replaced_at_publish() {
    let broker = InMemoryBroker::new();
    let client = client_for(&broker, ACTIVITY_TOPIC_NAME).await;

    let mut original = ActivityLog::new("u-9", "carol", "viewed invoice", "billing")
        .with_ip_address("10.1.2.3");
    original.activity_time = Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap();

    let publish_started = Utc::now();
    client.publish_activity_log(original.clone()).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .consume_activity_logs(ConsumeOptions::default(), move |log: ActivityLog, ack: Acknowledgement| {
            let tx = tx.clone();
            async move {
                let handled_at = Utc::now();
                ack.ack().await;
                tx.send((log, handled_at)).unwrap();
            }
        })
        .await
        .unwrap();

    let (received, handled_at) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_ne!(received.activity_time, original.activity_time);
    assert!(received.activity_time >= publish_started);
    assert!(received.activity_time <= handled_at);

    let mut expected = original;
    expected.activity_time = received.activity_time;
    assert_eq!(received, expected);
}

// =============================================================================
// ACKNOWLEDGEMENT
// =============================================================================

#[tokio::test]
async fn test_nack_redelivers_same_content() {
    let broker = InMemoryBroker::new();
    let client = client_for(&broker, AUDIT_TOPIC_NAME).await;
    client.publish_audit_log(audit("retry-me")).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .consume_audit_logs(ConsumeOptions::default(), move |log: AuditLog, ack: Acknowledgement| {
            let tx = tx.clone();
            async move {
                let redelivered = ack.redelivered();
                // Reject the first attempt, accept the redelivery.
                ack.settle(redelivered).await;
                tx.send((log, redelivered)).unwrap();
            }
        })
        .await
        .unwrap();

    let (first, first_redelivered) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    let (second, second_redelivered) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();

    assert!(!first_redelivered);
    assert!(second_redelivered);
    assert_eq!(first, second);
    assert!(timeout(QUIET, rx.recv()).await.is_err());
    assert_eq!(broker.unacked_count(AUDIT_TOPIC_NAME), 0);
}

#[tokio::test]
async fn test_acked_message_is_not_redelivered_to_later_consumer() {
    let broker = InMemoryBroker::new();
    let first = client_for(&broker, AUDIT_TOPIC_NAME).await;
    first.publish_audit_log(audit("once")).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = first
        .consume_audit_logs(ConsumeOptions::default(), move |log: AuditLog, ack: Acknowledgement| {
            let tx = tx.clone();
            async move {
                ack.ack().await;
                tx.send(log).unwrap();
            }
        })
        .await
        .unwrap();
    timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    first.close().await;
    handle.closed().await;

    let second = client_for(&broker, AUDIT_TOPIC_NAME).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    second
        .consume_audit_logs(ConsumeOptions::default(), move |log: AuditLog, ack: Acknowledgement| {
            let tx = tx.clone();
            async move {
                ack.ack().await;
                tx.send(log).unwrap();
            }
        })
        .await
        .unwrap();

    assert!(timeout(QUIET, rx.recv()).await.is_err());
    assert_eq!(broker.ready_count(AUDIT_TOPIC_NAME), 0);
}

#[tokio::test]
async fn test_unused_token_leaves_message_unacknowledged() {
    let broker = InMemoryBroker::new();
    let client = client_for(&broker, AUDIT_TOPIC_NAME).await;
    client.publish_audit_log(audit("forgotten")).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .consume_audit_logs(ConsumeOptions::default(), move |log: AuditLog, ack: Acknowledgement| {
            let tx = tx.clone();
            async move {
                drop(ack);
                tx.send(log).unwrap();
            }
        })
        .await
        .unwrap();

    timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(broker.unacked_count(AUDIT_TOPIC_NAME), 1);

    client.close().await;
    assert_eq!(broker.unacked_count(AUDIT_TOPIC_NAME), 0);
    assert_eq!(broker.ready_count(AUDIT_TOPIC_NAME), 1);
}

#[tokio::test]
async fn test_failed_ack_is_logged_and_loop_continues() {
    let broker = InMemoryBroker::new();
    let client = client_for(&broker, AUDIT_TOPIC_NAME).await;
    client.publish_audit_log(audit("1")).await.unwrap();
    client.publish_audit_log(audit("2")).await.unwrap();
    broker.fail_next(Fault::Settle);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = client
        .consume_audit_logs(ConsumeOptions::default(), move |log: AuditLog, ack: Acknowledgement| {
            let tx = tx.clone();
            async move {
                ack.ack().await;
                tx.send(log.search_key).unwrap();
            }
        })
        .await
        .unwrap();

    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), "1");
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), "2");

    // The first ack failed, so only that delivery is still outstanding.
    assert_eq!(broker.unacked_count(AUDIT_TOPIC_NAME), 1);
    assert!(!handle.is_finished());
}

// =============================================================================
// FLOW CONTROL
// =============================================================================

#[tokio::test]
async fn test_prefetch_limits_outstanding_deliveries() {
    let broker = InMemoryBroker::new();
    let client = client_for(&broker, AUDIT_TOPIC_NAME).await;
    for i in 0..20 {
        client.publish_audit_log(audit(&i.to_string())).await.unwrap();
    }

    // Tokens leave the handler so the test decides when each message is acked.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = client
        .consume_audit_logs(
            ConsumeOptions::default()
                .with_consumer_name("slow-archiver")
                .with_prefetch_count(3),
            move |log: AuditLog, ack: Acknowledgement| {
                let tx = tx.clone();
                async move {
                    tx.send((log, ack)).unwrap();
                }
            },
        )
        .await
        .unwrap();
    assert_eq!(handle.consumer_tag(), "slow-archiver");

    let mut pending = Vec::new();
    for _ in 0..3 {
        pending.push(timeout(WAIT, rx.recv()).await.unwrap().unwrap());
    }
    assert!(timeout(QUIET, rx.recv()).await.is_err(), "fourth delivery must wait for an ack");
    assert_eq!(broker.unacked_count(AUDIT_TOPIC_NAME), 3);

    let mut received = pending.len();
    while let Some((_, ack)) = pending.pop() {
        ack.ack().await;
        if received < 20 {
            pending.push(timeout(WAIT, rx.recv()).await.unwrap().unwrap());
            received += 1;
        }
        assert!(broker.unacked_count(AUDIT_TOPIC_NAME) <= 3);
    }

    assert_eq!(received, 20);
    assert_eq!(broker.unacked_count(AUDIT_TOPIC_NAME), 0);
    assert_eq!(broker.peak_unacked("slow-archiver"), 3);
}

// =============================================================================
// UNDECODABLE MESSAGES
// =============================================================================

#[tokio::test]
async fn test_malformed_body_is_skipped_and_survives_reconnect() {
    let broker = InMemoryBroker::new();
    let client = client_for(&broker, AUDIT_TOPIC_NAME).await;
    assert!(broker.inject(AUDIT_TOPIC_NAME, "{not json"));
    client.publish_audit_log(audit("valid")).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = client
        .consume_audit_logs(ConsumeOptions::default(), move |log: AuditLog, ack: Acknowledgement| {
            let tx = tx.clone();
            async move {
                ack.ack().await;
                tx.send(log).unwrap();
            }
        })
        .await
        .unwrap();

    let log = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(log.search_key, "valid");
    assert!(!handle.is_finished(), "loop must survive a bad message");
    assert_eq!(broker.unacked_count(AUDIT_TOPIC_NAME), 1);

    client.close().await;
    handle.closed().await;
    assert_eq!(broker.ready_bodies(AUDIT_TOPIC_NAME), vec![b"{not json".to_vec()]);

    let fresh = client_for(&broker, AUDIT_TOPIC_NAME).await;
    fresh
        .consume_audit_logs(
            ConsumeOptions::default().with_decode_failure_policy(DecodeFailurePolicy::Reject),
            |_log: AuditLog, ack: Acknowledgement| async move {
                ack.ack().await;
            },
        )
        .await
        .unwrap();

    wait_until(|| {
        broker.ready_count(AUDIT_TOPIC_NAME) == 0 && broker.unacked_count(AUDIT_TOPIC_NAME) == 0
    })
    .await;
}

#[tokio::test]
async fn test_null_fields_reach_handler_as_empty() {
    let broker = InMemoryBroker::new();
    let client = client_for(&broker, ACTIVITY_TOPIC_NAME).await;
    assert!(broker.inject(
        ACTIVITY_TOPIC_NAME,
        r#"{"user_id":"u-3","username":"dave","activity":"logout","module":null,"remarks":null}"#,
    ));

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .consume_activity_logs(ConsumeOptions::default(), move |log: ActivityLog, ack: Acknowledgement| {
            let tx = tx.clone();
            async move {
                ack.ack().await;
                tx.send(log).unwrap();
            }
        })
        .await
        .unwrap();

    let log = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(log.username, "dave");
    assert_eq!(log.module, "");
    assert_eq!(log.remarks, "");
    wait_until(|| broker.unacked_count(ACTIVITY_TOPIC_NAME) == 0).await;
}

// =============================================================================
// SETUP FAILURES
// =============================================================================

#[tokio::test]
async fn test_connection_failure_is_connection_error() {
    let broker = InMemoryBroker::new();
    broker.fail_next(Fault::Connect);

    let err = LogClient::connect_with(&broker, &BrokerConfig::new("memory://"), AUDIT_TOPIC_NAME)
        .await
        .unwrap_err();
    assert!(matches!(err, LogBusError::ConnectionError(_)));
    assert!(std::error::Error::source(&err).is_some());
}

#[tokio::test]
async fn test_channel_failure_closes_the_new_connection() {
    let broker = InMemoryBroker::new();
    broker.fail_next(Fault::OpenChannel);

    let err = LogClient::connect_with(&broker, &BrokerConfig::new("memory://"), AUDIT_TOPIC_NAME)
        .await
        .unwrap_err();
    assert!(matches!(err, LogBusError::ChannelError(_)));
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn test_conflicting_queue_declaration_fails_and_cleans_up() {
    let broker = InMemoryBroker::new();
    broker
        .declare(
            AUDIT_TOPIC_NAME,
            QueueOptions {
                durable: false,
                exclusive: false,
                auto_delete: true,
            },
        )
        .unwrap();

    let err = LogClient::connect_with(&broker, &BrokerConfig::new("memory://"), AUDIT_TOPIC_NAME)
        .await
        .unwrap_err();
    match err {
        LogBusError::QueueDeclarationError { queue, .. } => assert_eq!(queue, AUDIT_TOPIC_NAME),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test]
async fn test_repeated_initialize_is_idempotent_and_independent() {
    let broker = InMemoryBroker::new();
    let first = client_for(&broker, AUDIT_TOPIC_NAME).await;
    let second = client_for(&broker, AUDIT_TOPIC_NAME).await;

    first.close().await;
    assert!(first.is_closed());
    assert!(!second.is_closed());

    second.publish_audit_log(audit("still-open")).await.unwrap();
    assert_eq!(broker.ready_count(AUDIT_TOPIC_NAME), 1);
    assert_eq!(broker.open_connections(), 1);
}

#[tokio::test]
async fn test_qos_failure_is_reported() {
    let broker = InMemoryBroker::new();
    let client = client_for(&broker, AUDIT_TOPIC_NAME).await;
    broker.fail_next(Fault::Prefetch);

    let err = client
        .consume_audit_logs(
            ConsumeOptions::default().with_prefetch_count(7),
            |_log: AuditLog, ack: Acknowledgement| async move { ack.ack().await },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LogBusError::QoSConfigurationError {
            prefetch_count: 7,
            ..
        }
    ));
}

#[tokio::test]
async fn test_subscription_failure_is_reported() {
    let broker = InMemoryBroker::new();
    let client = client_for(&broker, ACTIVITY_TOPIC_NAME).await;
    broker.fail_next(Fault::Subscribe);

    let err = client
        .consume_activity_logs(
            ConsumeOptions::default(),
            |_log: ActivityLog, ack: Acknowledgement| async move { ack.ack().await },
        )
        .await
        .unwrap_err();
    match err {
        LogBusError::SubscriptionError { kind, consumer, .. } => {
            assert_eq!(kind, "activity");
            assert_eq!(consumer, "default_activity_consumer");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_publish_transport_failure_is_publish_error() {
    let broker = InMemoryBroker::new();
    let client = client_for(&broker, AUDIT_TOPIC_NAME).await;
    broker.fail_next(Fault::Publish);

    let err = client.publish_audit_log(audit("lost")).await.unwrap_err();
    assert!(matches!(err, LogBusError::PublishError { kind: "audit", .. }));
    assert_eq!(broker.ready_count(AUDIT_TOPIC_NAME), 0);
}

#[tokio::test]
async fn test_declare_failure_closes_channel_and_connection() {
    let broker = InMemoryBroker::new();
    broker.fail_next(Fault::DeclareQueue);

    let err = LogClient::connect_with(&broker, &BrokerConfig::new("memory://"), ACTIVITY_TOPIC_NAME)
        .await
        .unwrap_err();
    assert!(matches!(err, LogBusError::QueueDeclarationError { .. }));
    assert!(!broker.queue_exists(ACTIVITY_TOPIC_NAME));
    assert_eq!(broker.open_channels(), 0);
    assert_eq!(broker.open_connections(), 0);
}

// =============================================================================
// HANDLE STATE AND CLOSE
// =============================================================================

#[tokio::test]
async fn test_wrong_topic_is_not_initialized() {
    let broker = InMemoryBroker::new();
    let client = client_for(&broker, AUDIT_TOPIC_NAME).await;

    let err = client
        .publish_activity_log(ActivityLog::new("u-1", "alice", "login", "auth"))
        .await
        .unwrap_err();
    match err {
        LogBusError::NotInitializedError { topic } => assert_eq!(topic, ACTIVITY_TOPIC_NAME),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_closed_client_is_not_initialized() {
    let broker = InMemoryBroker::new();
    let client = client_for(&broker, AUDIT_TOPIC_NAME).await;
    let clone = client.clone();

    client.close().await;
    client.close().await;

    let err = clone.publish_audit_log(audit("late")).await.unwrap_err();
    assert!(matches!(err, LogBusError::NotInitializedError { .. }));

    let err = clone
        .consume_audit_logs(
            ConsumeOptions::default(),
            |_log: AuditLog, ack: Acknowledgement| async move { ack.ack().await },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LogBusError::NotInitializedError { .. }));
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn test_close_ends_consume_loop() {
    let broker = InMemoryBroker::new();
    let client = client_for(&broker, AUDIT_TOPIC_NAME).await;

    let handle = client
        .consume_audit_logs(
            ConsumeOptions::default(),
            |_log: AuditLog, ack: Acknowledgement| async move { ack.ack().await },
        )
        .await
        .unwrap();
    assert_eq!(handle.consumer_tag(), "default_audit_consumer");
    assert_eq!(handle.queue(), AUDIT_TOPIC_NAME);
    assert_eq!(broker.consumer_count(AUDIT_TOPIC_NAME), 1);

    client.close().await;
    timeout(WAIT, handle.closed()).await.unwrap();
    assert_eq!(broker.consumer_count(AUDIT_TOPIC_NAME), 0);
}

#[tokio::test]
async fn test_close_errors_are_suppressed() {
    let broker = InMemoryBroker::new();
    let client = client_for(&broker, AUDIT_TOPIC_NAME).await;
    broker.fail_next(Fault::CloseChannel);

    client.close().await;

    assert!(client.is_closed());
    // The connection close still runs and takes the channel with it.
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test]
async fn test_connection_close_error_is_suppressed() {
    let broker = InMemoryBroker::new();
    let client = client_for(&broker, AUDIT_TOPIC_NAME).await;
    broker.fail_next(Fault::CloseConnection);

    client.close().await;
    client.close().await;

    assert!(client.is_closed());
    assert_eq!(broker.open_channels(), 0);
    // The broker refused the close; the handle does not retry it.
    assert_eq!(broker.open_connections(), 1);
}
