//! Test fixtures and mock collaborators

pub mod mock_warehouse;

pub use mock_gateway::MockPaymentGateway;
pub use mock_warehouse::MockWarehouse;

use crate::workflows::Order;

/// Builder for orders used by the scenarios
pub struct OrderFixture {
    pub prefix: String,
    pub amount_cents: u64,
    pub items: Vec<String>,
}

impl OrderFixture {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            amount_cents: 2_500,
            items: vec!["widget".to_string()],
        }
    }

    pub fn with_amount(mut self, amount_cents: u64) -> Self {
        self.amount_cents = amount_cents;
        self
    }

    pub fn with_items(mut self, items: &[&str]) -> Self {
        self.items = items.iter().map(|item| item.to_string()).collect();
        self
    }

    /// `count` orders with ids `{prefix}-0`, `{prefix}-1`, ...
    pub fn build(&self, count: usize) -> Vec<Order> {
        let items: Vec<&str> = self.items.iter().map(String::as_str).collect();
        (0..count)
            .map(|index| Order::new(format!("{}-{}", self.prefix, index), self.amount_cents, &items))
            .collect()
    }
}
