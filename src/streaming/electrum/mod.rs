pub mod adapter;
pub mod api;
pub mod mock;

pub use adapter::ElectrumTransport;
pub use api::{ReplyHandler, Transport};
pub use mock::MockTransport;
