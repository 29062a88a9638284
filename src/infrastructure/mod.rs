//! Infrastructure concerns: configuration and logging.

pub mod logging;
pub mod pbs_config;

pub use logging::LogConfig;
pub use pbs_config::PbsConfig;
