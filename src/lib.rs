pub mod adapter;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod mirror;
pub mod models;
pub mod onvif;
pub mod path;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod store;

pub use adapter::Adapter;
pub use config::AdapterConfig;
pub use error::{AdapterError, Result};
