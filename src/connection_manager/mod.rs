//! Session ownership and local fan-out.
//!
//! - `Session`: one live (user, channel) connection with a bounded queue
//! - `SessionRegistry`: pure bookkeeping of live sessions
//! - `ConnectionManager`: connect / disconnect / send / broadcast / publish

mod manager;
mod registry;
mod session;
mod stats;

pub use manager::{ConnectionManager, PublishOutcome};
pub use registry::{Registration, Removal, SessionRegistry};
pub use session::{ConnectError, Outbound, SendFailure, Session};
pub use stats::{BroadcastReport, ConnectionStats};
