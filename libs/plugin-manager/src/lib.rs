pub mod destination_plugin;
pub mod error;
pub mod manager;
pub mod source_plugin;

pub use destination_plugin::DestinationPlugin;
pub use error::ManagerError;
pub use manager::{resolve_plugin_path, PluginLabels, PluginManager};
pub use source_plugin::SourcePlugin;
