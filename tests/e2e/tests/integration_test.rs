//! Integration test for E2E framework

use saga_e2e_tests::{
    framework::{TestConfig, TestFramework, TestScenario, ValidationLevel},
    scenarios::{CancellationCascadeTest, OrderLifecycleTest, PaymentFailureMode, PaymentFailureTest},
    workflows::{action_types::ORDER_CREATED, CheckoutWatcher, Order},
    MockPaymentGateway,
};
use std::time::Duration;

fn quiet_config() -> TestConfig {
    TestConfig {
        timeout_secs: 30,
        validation_level: ValidationLevel::Comprehensive,
        ..TestConfig::default()
    }
}

fn assert_passed(result: &saga_e2e_tests::TestResult) {
    let failures: Vec<_> = result
        .validation_results
        .iter()
        .filter(|v| !v.is_acceptable())
        .map(|v| format!("{}: {}", v.validator, v.message))
        .collect();
    assert!(
        result.success,
        "{} failed: {:?} {:?}",
        result.scenario_name, result.error_message, failures
    );
}

#[tokio::test]
async fn test_framework_creation() {
    let framework = TestFramework::new(quiet_config()).expect("Failed to create test framework");

    assert_eq!(framework.config().timeout_secs, 30);
    assert_eq!(framework.scheduler().live_tasks(), 0);
    assert!(framework.history().is_empty());
    assert_eq!(framework.store().state_value()["orders"], serde_json::json!({}));
}

#[tokio::test]
async fn test_scenario_creation() {
    let scenario = OrderLifecycleTest::default();

    assert_eq!(scenario.name(), "order_lifecycle");
    assert!(!scenario.description().is_empty());
    assert!(scenario.timeout().as_secs() > 0);

    assert_eq!(
        PaymentFailureTest::new(PaymentFailureMode::TimedOut).name(),
        "payment_timeout"
    );
}

#[tokio::test]
async fn test_order_lifecycle_scenario() {
    let framework = TestFramework::new(quiet_config()).unwrap();
    let result = framework
        .run_scenario(OrderLifecycleTest::default().with_orders(3))
        .await
        .unwrap();

    assert_passed(&result);
    // Three orders: created, processed, completed, shipped
    assert_eq!(result.metrics.actions_logged, 12);
    assert_eq!(result.metrics.actions_dispatched, 3);
    assert_eq!(result.metrics.actions_put, 9);
    assert_eq!(result.metrics.unhandled_failures, 0);
}

#[tokio::test]
async fn test_declined_payment_scenario() {
    let framework = TestFramework::new(quiet_config()).unwrap();
    let result = framework
        .run_scenario(PaymentFailureTest::new(PaymentFailureMode::Declined))
        .await
        .unwrap();

    assert_passed(&result);
}

#[tokio::test]
async fn test_payment_timeout_scenario() {
    let framework = TestFramework::new(quiet_config()).unwrap();
    let result = framework
        .run_scenario(PaymentFailureTest::new(PaymentFailureMode::TimedOut))
        .await
        .unwrap();

    assert_passed(&result);
}

#[tokio::test]
async fn test_cancellation_cascade_scenario() {
    let framework = TestFramework::new(quiet_config()).unwrap();
    let result = framework
        .run_scenario(CancellationCascadeTest::default())
        .await
        .unwrap();

    assert_passed(&result);
    assert_eq!(result.metrics.tasks_cancelled, 16);
    assert_eq!(framework.scheduler().pending_takes(), 0);
}

#[tokio::test]
async fn test_each_scenario_gets_a_fresh_session() {
    let framework = TestFramework::new(quiet_config()).unwrap();
    framework
        .run_scenario(OrderLifecycleTest::default().with_orders(1))
        .await
        .unwrap();
    let first_store = framework.history().len();

    framework
        .run_scenario(PaymentFailureTest::new(PaymentFailureMode::Declined))
        .await
        .unwrap();

    assert_eq!(first_store, 4);
    assert!(framework
        .history()
        .iter()
        .all(|action| action.field("order_id").and_then(|v| v.as_str()) == Some("failing-0")));
}

#[tokio::test]
async fn test_wait_for_action_sees_earlier_dispatches() {
    let framework = TestFramework::new(quiet_config()).unwrap();
    let order = Order::new("early", 100, &[]);
    framework.dispatch(order.created_action()).unwrap();

    let seen = framework.wait_for_action(ORDER_CREATED).await.unwrap();
    assert_eq!(seen.field("order_id").and_then(|v| v.as_str()), Some("early"));
}

#[tokio::test]
async fn test_wait_for_action_times_out() {
    let config = TestConfig {
        action_timeout_ms: 20,
        ..quiet_config()
    };
    let framework = TestFramework::new(config).unwrap();

    let err = framework.wait_for_action("NeverDispatched").await.unwrap_err();
    assert!(err.to_string().contains("Timed out"));
}

#[tokio::test]
async fn test_stop_unknown_saga_is_an_error() {
    let framework = TestFramework::new(quiet_config()).unwrap();
    assert!(framework.stop_saga("missing").await.is_err());

    let handle = framework
        .start_saga(
            "checkout",
            CheckoutWatcher::new(MockPaymentGateway::new(), Duration::from_secs(1)),
        )
        .await
        .unwrap();
    framework.stop_saga("checkout").await.unwrap();
    assert!(handle.is_terminal());
}

#[tokio::test]
async fn test_artifacts_are_written() {
    let dir = tempfile::tempdir().unwrap();
    let config = TestConfig {
        artifacts_dir: Some(dir.path().to_path_buf()),
        ..quiet_config()
    };
    let framework = TestFramework::new(config).unwrap();
    framework
        .run_scenario(PaymentFailureTest::new(PaymentFailureMode::Declined))
        .await
        .unwrap();

    let artifacts: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(artifacts.len(), 1);

    let artifact: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&artifacts[0]).unwrap()).unwrap();
    assert_eq!(artifact["scenario"], "payment_declined");
    assert_eq!(artifact["actions"][0]["type"], ORDER_CREATED);
    assert_eq!(artifact["state"]["orders"]["failing-0"]["status"], "failed");
}
