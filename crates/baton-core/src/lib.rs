pub mod api;
pub mod collaborators;
pub mod completion;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod host;
pub mod model;
pub mod provider;
pub mod storage;
pub mod task;

pub use api::*;
pub use collaborators::*;
pub use completion::*;
pub use config::*;
pub use error::*;
pub use event_bus::*;
pub use host::*;
pub use model::*;
pub use provider::*;
pub use storage::*;
pub use task::*;
