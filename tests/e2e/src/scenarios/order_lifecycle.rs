//! Order Lifecycle E2E Test
//!
//! Tests the complete order flow:
//! OrderCreated → OrderSaga → PaymentSaga → gateway → OrderCompleted → ShipmentSaga → OrderShipped

use crate::fixtures::{MockPaymentGateway, MockWarehouse, OrderFixture};
use crate::framework::{
    TestFramework, TestResult, TestScenario, ValidationLevel, ValidationResult,
};
use crate::validation::{ActionFlowValidator, OrderOutcome};
use crate::workflows::{action_types::ORDER_SHIPPED, order_pattern, CheckoutWatcher, FulfilmentWatcher};
use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub struct OrderLifecycleTest {
    pub orders: usize,
    pub amount_cents: u64,
    pub gateway_latency: Duration,
    pub payment_timeout: Duration,
}

impl Default for OrderLifecycleTest {
    fn default() -> Self {
        Self {
            orders: 5,
            amount_cents: 2_500,
            gateway_latency: Duration::from_millis(5),
            payment_timeout: Duration::from_secs(1),
        }
    }
}

impl OrderLifecycleTest {
    pub fn with_orders(mut self, orders: usize) -> Self {
        self.orders = orders;
        self
    }
}

#[async_trait::async_trait]
impl TestScenario for OrderLifecycleTest {
    async fn setup(&self, framework: &TestFramework) -> Result<()> {
        info!("Setting up order lifecycle test");

        let gateway = MockPaymentGateway::new().with_latency(self.gateway_latency);
        framework
            .start_saga("checkout", CheckoutWatcher::new(gateway, self.payment_timeout))
            .await?;
        framework
            .start_saga("fulfilment", FulfilmentWatcher::new(MockWarehouse::default()))
            .await?;

        Ok(())
    }

    async fn execute(&self, framework: &TestFramework) -> Result<TestResult> {
        let start = Instant::now();
        let orders = OrderFixture::new("lifecycle")
            .with_amount(self.amount_cents)
            .build(self.orders);

        for order in &orders {
            framework.dispatch(order.created_action())?;
        }
        info!("Dispatched {} orders", orders.len());

        for order in &orders {
            let shipped = framework
                .wait_for_action(order_pattern(ORDER_SHIPPED, &order.order_id))
                .await
                .with_context(|| format!("Order {} never shipped", order.order_id))?;
            debug!(action = %shipped, "Order shipped");
        }

        let history = framework.history();
        let validator = ActionFlowValidator::new();
        let mut validations: Vec<ValidationResult> = orders
            .iter()
            .map(|order| validator.expect_outcome(&history, &order.order_id, &OrderOutcome::Shipped))
            .collect();

        let state = framework.store().state_value();
        let shipped_in_state = orders
            .iter()
            .filter(|order| state["orders"][order.order_id.as_str()]["status"] == "shipped")
            .count();
        validations.push(ValidationResult::check(
            "store_state",
            shipped_in_state == orders.len(),
            format!("{}/{} orders shipped in store state", shipped_in_state, orders.len()),
        ));

        // Only the two watchers remain once every order is shipped
        let settled = framework
            .wait_until("per-order sagas to finish", || framework.scheduler().live_tasks() == 2)
            .await;
        validations.push(ValidationResult::check(
            "watchers_only",
            settled.is_ok(),
            format!(
                "{} live tasks after all orders shipped",
                framework.scheduler().live_tasks()
            ),
        ));

        if framework.config().validation_level != ValidationLevel::Basic {
            validations.extend(validator.validate_history(&history));
        }
        if framework.config().validation_level == ValidationLevel::Comprehensive {
            validations.extend(framework.validate_scheduler_health());
        }

        Ok(TestResult::from_validations(
            self.name(),
            framework.metrics(start.elapsed()),
            validations,
        ))
    }

    async fn cleanup(&self, _framework: &TestFramework) -> Result<()> {
        info!("Cleaning up order lifecycle test");
        Ok(())
    }

    fn name(&self) -> &str {
        "order_lifecycle"
    }

    fn description(&self) -> &str {
        "Orders are charged, completed and shipped through forked child sagas"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }
}
