pub mod bus;
pub mod event;
pub mod registry;
pub mod store;

pub use bus::EventBus;
pub use event::{Event, EventType};
pub use registry::{Connection, ConnectionRegistry};
pub use store::EventStore;
