pub mod calibration;
pub mod command_processor;
pub mod config;
pub mod constants;
pub mod control_client;
pub mod discovery;
pub mod error;
pub mod events;
pub mod net;
pub mod reconfigure;
pub mod registry;
pub mod service;
pub mod settings;
pub mod simulator;

pub use error::{Error, Result};
pub use service::{ServiceOptions, ServiceState, TrackingService};
