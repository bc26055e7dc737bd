pub mod actuators;
pub mod config;
pub mod engine;
pub mod monitor;
pub mod presence;
pub mod topics;
pub mod types;

pub use actuators::{Aircon, CeilingFan, Heater};
pub use config::{ActiveThresholds, ClimateConfig, SettingName, ThresholdKey, ThresholdSettings};
pub use engine::{ClimateEngine, ClimateStatus};
pub use monitor::{apparent_temperature, parse_humidity, parse_temperature, TemperatureMonitor};
pub use presence::{EngineCtx, PresenceView, SceneView, VacancyWatches};
pub use topics::*;
pub use types::{
    Action, AirconFanMode, Command, HvacMode, Notification, NotifyTarget, Room, Scene, TimerKind,
    WatchId,
};
