//! Event Bus and the session transport that carries it to clients.

pub mod bus;
pub mod messages;
pub mod ws;

pub use bus::{EventBus, Group, Subscription};
pub use messages::{ClientMessage, ServerEvent};
