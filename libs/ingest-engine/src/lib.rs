pub mod dequeuer;
pub mod enqueuer;
pub mod error;
pub mod fanout;
pub mod metrics_destination;

pub use dequeuer::Dequeuer;
pub use enqueuer::Enqueuer;
pub use error::EngineError;
pub use fanout::FanOut;
pub use metrics_destination::MetricsDestination;
