pub mod config;
pub mod error;
pub mod event;
pub mod state;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, WaypointError};
pub use event::EventBus;
pub use state::*;
pub use types::*;
