pub mod error;
pub mod memory;
pub mod metrics;
pub mod nats;
pub mod traits;

pub use error::BrokerError;
pub use memory::MemoryBroker;
pub use metrics::MetricsBroker;
pub use nats::NatsBroker;
pub use traits::{Broker, Message, Subscription};
