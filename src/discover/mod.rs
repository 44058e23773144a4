//! Registry cache, publisher and subscriber.

mod listener;
mod publisher;
mod registry;
mod subscriber;

pub use listener::UpdateListener;
pub use publisher::Publisher;
pub use registry::{get_registry, Registry, StaticStoreAccessor, StoreAccessor};
pub use subscriber::Subscriber;
