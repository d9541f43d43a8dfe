pub mod config;
pub mod error;
pub mod model;
pub mod mqtt;
pub mod state;
pub mod sync;

pub use config::Config;
pub use error::{AppError, ConfigError};
pub use model::ThermalModel;
pub use state::LoopState;
pub use sync::{ConfigHandle, LoopStatus, StatePublisher, SyncLoop};
