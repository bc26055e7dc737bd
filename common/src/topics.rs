use crate::types::{Command, Room};

pub const TOPIC_SCENE: &str = "home/scene";
pub const TOPIC_PRE_SLEEP: &str = "home/scene/pre_sleep";
pub const TOPIC_DOOR: &str = "home/sensor/kitchen_door";
pub const TOPIC_OUTSIDE_TEMP: &str = "home/weather/apparent_temperature";
pub const TOPIC_ANYONE_HOME: &str = "home/presence/anyone_home";
pub const TOPIC_PETS_HOME_ALONE: &str = "home/presence/pets_home_alone";

pub const TOPIC_CMD_CONTROL: &str = "climate/cmnd/control";
pub const TOPIC_CMD_AIRCON: &str = "climate/cmnd/aircon";
pub const TOPIC_CMD_RESET: &str = "climate/cmnd/reset";
pub const TOPIC_CMD_SETTING_PREFIX: &str = "climate/cmnd/setting/";
pub const TOPIC_CMD_SETTING_WILDCARD: &str = "climate/cmnd/setting/#";

pub const TOPIC_CONTROLLER_STATE: &str = "climate/controller/state";
pub const TOPIC_NOTIFY: &str = "climate/notify";

pub fn sensor_temperature_topic(room: Room) -> String {
    format!("home/sensor/{}/temperature", room.as_str())
}

pub fn sensor_humidity_topic(room: Room) -> String {
    format!("home/sensor/{}/humidity", room.as_str())
}

pub fn forecast_topic(hours_ahead: u8) -> String {
    format!("home/weather/forecast/{hours_ahead}h")
}

pub fn motion_topic(room: Room) -> String {
    format!("home/presence/{}/occupied", room.as_str())
}

/// Map a device command onto its MQTT topic and payload.
pub fn command_route(command: &Command) -> (String, String) {
    match command {
        Command::AirconMode { zone, mode } => (
            format!("home/aircon/{}/mode", zone.as_str()),
            mode.as_str().to_string(),
        ),
        Command::AirconSetpoint { zone, temperature } => (
            format!("home/aircon/{}/setpoint", zone.as_str()),
            format!("{temperature:.1}"),
        ),
        Command::AirconFan { zone, mode } => (
            format!("home/aircon/{}/fan_mode", zone.as_str()),
            mode.as_str().to_string(),
        ),
        Command::AirconOff { zone } => {
            (format!("home/aircon/{}/mode", zone.as_str()), "off".to_string())
        }
        Command::FanDirection { room, cooling } => (
            format!("home/fan/{}/direction", room.as_str()),
            if *cooling { "forward" } else { "reverse" }.to_string(),
        ),
        Command::FanPercentage { room, percent } => (
            format!("home/fan/{}/percentage", room.as_str()),
            percent.to_string(),
        ),
        Command::FanOn { room, percent } => (
            format!("home/fan/{}/power", room.as_str()),
            format!("on {percent}"),
        ),
        Command::FanOff { room } => {
            (format!("home/fan/{}/power", room.as_str()), "off".to_string())
        }
        Command::HeaterOn { room } => {
            (format!("home/heater/{}/power", room.as_str()), "on".to_string())
        }
        Command::HeaterOff { room } => {
            (format!("home/heater/{}/power", room.as_str()), "off".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HvacMode;

    #[test]
    fn command_routes_are_room_scoped() {
        let (topic, payload) = command_route(&Command::AirconMode {
            zone: Room::Bedroom,
            mode: HvacMode::Cool,
        });
        assert_eq!(topic, "home/aircon/bedroom/mode");
        assert_eq!(payload, "cool");

        let (topic, payload) = command_route(&Command::FanOff {
            room: Room::Nursery,
        });
        assert_eq!(topic, "home/fan/nursery/power");
        assert_eq!(payload, "off");
    }

    #[test]
    fn setpoints_are_formatted_to_one_decimal() {
        let (_, payload) = command_route(&Command::AirconSetpoint {
            zone: Room::LivingRoom,
            temperature: 23.75,
        });
        assert_eq!(payload, "23.8");
    }
}
