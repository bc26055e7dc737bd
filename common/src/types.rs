use serde::{Deserialize, Serialize};

/// Named mode of the home, owned by the external scene scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scene {
    Day,
    Night,
    Morning,
    Sleep,
    #[serde(rename = "TV")]
    Tv,
    Bright,
    #[serde(rename = "Away (Day)")]
    AwayDay,
    #[serde(rename = "Away (Night)")]
    AwayNight,
}

impl Scene {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Day => "Day",
            Self::Night => "Night",
            Self::Morning => "Morning",
            Self::Sleep => "Sleep",
            Self::Tv => "TV",
            Self::Bright => "Bright",
            Self::AwayDay => "Away (Day)",
            Self::AwayNight => "Away (Night)",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Day" => Some(Self::Day),
            "Night" => Some(Self::Night),
            "Morning" => Some(Self::Morning),
            "Sleep" => Some(Self::Sleep),
            "TV" => Some(Self::Tv),
            "Bright" => Some(Self::Bright),
            "Away (Day)" => Some(Self::AwayDay),
            "Away (Night)" => Some(Self::AwayNight),
            _ => None,
        }
    }

    pub fn is_away(self) -> bool {
        matches!(self, Self::AwayDay | Self::AwayNight)
    }
}

/// Rooms with climate devices or sensors attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Room {
    Bedroom,
    LivingRoom,
    DiningRoom,
    Office,
    Nursery,
    DogBedArea,
}

impl Room {
    /// Ducted aircon zones.
    pub const AIRCON_ZONES: [Room; 3] = [Room::Bedroom, Room::LivingRoom, Room::DiningRoom];
    /// Rooms with a ceiling fan.
    pub const FAN_ROOMS: [Room; 3] = [Room::Bedroom, Room::Office, Room::Nursery];
    /// Rooms with a standalone heater.
    pub const HEATER_ROOMS: [Room; 3] = [Room::Nursery, Room::Office, Room::DogBedArea];
    /// Rooms with an indoor temperature/humidity sensor.
    pub const SENSOR_ROOMS: [Room; 5] = [
        Room::Bedroom,
        Room::LivingRoom,
        Room::Office,
        Room::Nursery,
        Room::DogBedArea,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bedroom => "bedroom",
            Self::LivingRoom => "living_room",
            Self::DiningRoom => "dining_room",
            Self::Office => "office",
            Self::Nursery => "nursery",
            Self::DogBedArea => "dog_bed_area",
        }
    }

    /// Human readable name used in notifications.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Bedroom => "bedroom",
            Self::LivingRoom => "living room",
            Self::DiningRoom => "dining room",
            Self::Office => "office",
            Self::Nursery => "nursery",
            Self::DogBedArea => "dog bed area",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "bedroom" => Some(Self::Bedroom),
            "living_room" => Some(Self::LivingRoom),
            "dining_room" => Some(Self::DiningRoom),
            "office" => Some(Self::Office),
            "nursery" => Some(Self::Nursery),
            "dog_bed_area" => Some(Self::DogBedArea),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HvacMode {
    Off,
    Heat,
    Cool,
}

impl HvacMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Heat => "heat",
            Self::Cool => "cool",
        }
    }
}

/// Fan setting on an aircon head unit (distinct from the ceiling fans).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AirconFanMode {
    Low,
    High,
    Auto,
}

impl AirconFanMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::High => "high",
            Self::Auto => "auto",
        }
    }
}

/// Who a notification should be delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyTarget {
    AnyoneHome,
    AnyoneHomeElseAll,
    All,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub message: String,
    pub target: NotifyTarget,
}

impl Notification {
    pub fn new(message: impl Into<String>, target: NotifyTarget) -> Self {
        Self {
            message: message.into(),
            target,
        }
    }
}

/// Opaque id for a registered vacancy watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchId(pub u64);

/// A scheduled-task concern. The host keeps at most one live timer per kind
/// and must cancel the previous one before rescheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    DoorOpen,
    FanAdjust(Room),
    Vacancy(WatchId),
}

/// A device command. Commands are only emitted when the cached observed
/// device state differs from the desired state.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    AirconMode { zone: Room, mode: HvacMode },
    AirconSetpoint { zone: Room, temperature: f64 },
    AirconFan { zone: Room, mode: AirconFanMode },
    AirconOff { zone: Room },
    FanDirection { room: Room, cooling: bool },
    FanPercentage { room: Room, percent: u8 },
    FanOn { room: Room, percent: u8 },
    FanOff { room: Room },
    HeaterOn { room: Room },
    HeaterOff { room: Room },
}

/// Side effect requested by a state transition. The engine itself performs
/// no I/O; the host executes these in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Device(Command),
    Notify(Notification),
    StartTimer { kind: TimerKind, delay_ms: u64 },
    CancelTimer { kind: TimerKind },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scene_round_trips_through_parse() {
        for scene in [
            Scene::Day,
            Scene::Night,
            Scene::Morning,
            Scene::Sleep,
            Scene::Tv,
            Scene::Bright,
            Scene::AwayDay,
            Scene::AwayNight,
        ] {
            assert_eq!(Scene::parse(scene.as_str()), Some(scene));
        }
        assert_eq!(Scene::parse("Garage"), None);
    }

    #[test]
    fn away_variants_detected() {
        assert!(Scene::AwayDay.is_away());
        assert!(Scene::AwayNight.is_away());
        assert!(!Scene::Night.is_away());
    }

    #[test]
    fn room_round_trips_through_parse() {
        for room in Room::SENSOR_ROOMS {
            assert_eq!(Room::parse(room.as_str()), Some(room));
        }
        assert_eq!(Room::parse("garage"), None);
    }
}
