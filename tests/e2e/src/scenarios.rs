//! End-to-end test scenarios

pub mod cancellation;
pub mod order_lifecycle;

pub use cancellation::CancellationCascadeTest;
pub use order_lifecycle::OrderLifecycleTest;
pub use payment_failures::{PaymentFailureMode, PaymentFailureTest};
