//! Mock warehouse used by shipment sagas

use anyhow::{bail, Result};
use saga_runtime::Effect;
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct MockWarehouse {
    pub reserve_latency: Duration,
    pub courier_latency: Duration,
    pub out_of_stock: bool,
}

impl Default for MockWarehouse {
    fn default() -> Self {
        Self {
            reserve_latency: Duration::from_millis(10),
            courier_latency: Duration::from_millis(2),
            out_of_stock: false,
        }
    }
}

impl MockWarehouse {
    /// Call effect reserving stock for an order
    pub fn reserve(&self, order_id: &str) -> Effect {
        let latency = self.reserve_latency;
        let out_of_stock = self.out_of_stock;
        Effect::call(
            "warehouse.reserve",
            move |args: Vec<Value>| async move {
                tokio::time::sleep(latency).await;
                reservation(args, out_of_stock)
            },
            vec![json!(order_id)],
        )
    }

    /// Call effect booking a courier; resolves with a tracking number
    pub fn book_courier(&self, order_id: &str) -> Effect {
        let latency = self.courier_latency;
        Effect::call(
            "courier.book",
            move |args: Vec<Value>| async move {
                tokio::time::sleep(latency).await;
                Ok::<_, anyhow::Error>(json!({
                    "order_id": args.first().cloned().unwrap_or(Value::Null),
                    "tracking": format!("TRK-{}", Uuid::new_v4().simple()),
                }))
            },
            vec![json!(order_id)],
        )
    }
}

fn reservation(args: Vec<Value>, out_of_stock: bool) -> Result<Value> {
    if out_of_stock {
        bail!("no stock available");
    }
    Ok(json!({ "order_id": args.first().cloned().unwrap_or(Value::Null), "reserved": true }))
}
