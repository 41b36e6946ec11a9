pub mod codec;
pub mod contract;
pub mod error;
pub mod metrics;
pub mod types;

pub use contract::{Destination, Source};
pub use error::{ErrorKind, PluginError};
pub use metrics::{CounterRegistry, MetricFamily};
pub use types::{Object, ObjectInfo, OnError, Reference, Workflow};
