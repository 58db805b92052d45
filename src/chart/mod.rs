pub mod bars;
pub mod gateway;
pub mod pipeline;
pub mod router;
pub mod subscriptions;
pub mod types;
