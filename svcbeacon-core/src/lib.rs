pub mod bootstrap;
pub mod config;
pub mod error;
pub mod logging;
pub mod naming;

pub use config::{
    Config, DiscoveryBackendConfig, DiscoverySettings, ServiceSettings, Settings,
};
pub use error::{Error, Result};
