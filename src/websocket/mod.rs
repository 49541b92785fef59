mod endpoint;
mod handler;
mod message;

pub use endpoint::{
    ActiveSession, DeliveryEndpoint, DeliveryError, EndpointConfig, SessionState,
};
pub use handler::ws_handler;
pub use message::{DeliveryEvent, EventKind, InboundFrame};
