//! API layer - HTTP endpoint handlers organized by concern.

mod health;
mod messages;
mod metrics;
mod presence;
mod routes;

pub use health::{health, stats};
pub use messages::{list_messages, mark_read, notify_channel};
pub use metrics::prometheus_metrics;
pub use presence::online_users;
pub use routes::api_routes;
