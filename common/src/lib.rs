pub mod codec;
pub mod config;
pub mod scheduler;
pub mod topics;
pub mod types;

pub use codec::DecodeError;
pub use config::{
    AlarmSettings, ConvergenceConfig, MonitorConfig, NetworkConfig, RuntimeConfig, SchedulerConfig,
};
pub use scheduler::{millis, next_check_date};
pub use topics::*;
pub use types::{
    AlarmConfig, AlertFlags, ComfortBounds, Coordinate, DeviceState, Directive, Forecast,
    ForecastPoint, INVALID_ADDRESS,
};
