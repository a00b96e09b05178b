//! Cancellation Cascade E2E Test
//!
//! Cancelling the checkout watcher while charges are in flight must cancel
//! every order saga, payment saga and race branch below it, release their
//! takes and abort the gateway calls.

use crate::fixtures::{MockPaymentGateway, OrderFixture};
use crate::framework::{TestFramework, TestResult, TestScenario, ValidationResult};
use crate::workflows::{
    action_types::{ORDER_COMPLETED, ORDER_FAILED},
    CheckoutWatcher,
};
use anyhow::{anyhow, Result};
use saga_runtime::CancelKind;
use std::time::{Duration, Instant};
use tracing::info;

/// Order saga, payment saga and three race branches
const TASKS_PER_ORDER: usize = 5;

pub struct CancellationCascadeTest {
    pub orders: usize,
    gateway: MockPaymentGateway,
}

impl Default for CancellationCascadeTest {
    fn default() -> Self {
        Self {
            orders: 3,
            gateway: MockPaymentGateway::new().with_latency(Duration::from_secs(10)),
        }
    }
}

#[async_trait::async_trait]
impl TestScenario for CancellationCascadeTest {
    async fn setup(&self, framework: &TestFramework) -> Result<()> {
        info!("Setting up cancellation cascade test");

        framework
            .start_saga(
                "checkout",
                CheckoutWatcher::new(self.gateway.clone(), Duration::from_secs(30)),
            )
            .await?;
        Ok(())
    }

    async fn execute(&self, framework: &TestFramework) -> Result<TestResult> {
        let start = Instant::now();
        let expected_live = 1 + self.orders * TASKS_PER_ORDER;

        for order in OrderFixture::new("cancelled").build(self.orders) {
            framework.dispatch(order.created_action())?;
        }
        framework
            .wait_until("every charge in flight", || {
                framework.scheduler().live_tasks() == expected_live
                    && self.gateway.charges_started() == self.orders as u64
            })
            .await?;

        let watcher = framework
            .saga("checkout")
            .await
            .ok_or_else(|| anyhow!("checkout saga not running"))?;
        framework.stop_saga("checkout").await?;
        framework
            .wait_until("cascade to finish", || framework.scheduler().live_tasks() == 0)
            .await?;

        let scheduler = framework.scheduler();
        let stats = scheduler.stats();
        let history = framework.history();
        let terminal = history
            .iter()
            .filter(|action| matches!(action.action_type(), ORDER_COMPLETED | ORDER_FAILED))
            .count();

        let validations = vec![
            ValidationResult::check(
                "watcher_cancelled",
                watcher.cancel_kind() == Some(CancelKind::User),
                format!("checkout cancel kind {:?}", watcher.cancel_kind()),
            ),
            ValidationResult::check(
                "cascade",
                stats.tasks_cancelled == expected_live as u64,
                format!("{} of {} tasks cancelled", stats.tasks_cancelled, expected_live),
            ),
            ValidationResult::check(
                "takes_released",
                scheduler.pending_takes() == 0,
                format!("{} takes still registered", scheduler.pending_takes()),
            ),
            ValidationResult::check(
                "no_outcomes",
                terminal == 0,
                format!("{} orders reached a terminal state", terminal),
            ),
            ValidationResult::check(
                "calls_aborted",
                self.gateway.charges_abandoned() == self.orders as u64,
                format!(
                    "{} of {} charges abandoned",
                    self.gateway.charges_abandoned(),
                    self.orders
                ),
            ),
        ];

        Ok(TestResult::from_validations(
            self.name(),
            framework.metrics(start.elapsed()),
            validations,
        ))
    }

    async fn cleanup(&self, _framework: &TestFramework) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "cancellation_cascade"
    }

    fn description(&self) -> &str {
        "Cancelling a watcher cancels every descendant and aborts in-flight calls"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(10)
    }
}
