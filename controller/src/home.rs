use std::collections::HashMap;

use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

use climate_common::{PresenceView, Room, Scene, SceneView};

/// Host-side home configuration: where the house is and when bed time
/// starts. The scene itself arrives over MQTT from the scene scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeConfig {
    pub timezone: String,
    /// "HH:MM"; bed time runs from here until midnight.
    pub bed_time: String,
}

impl Default for HomeConfig {
    fn default() -> Self {
        Self {
            timezone: "Australia/Melbourne".to_string(),
            bed_time: "21:30".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RoomPresence {
    occupied: bool,
    changed_ms: u64,
}

/// Tracks per-room motion, whole-house presence and the kitchen door from
/// their MQTT topics.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    rooms: HashMap<Room, RoomPresence>,
    pub anyone_home: bool,
    pub pets_home_alone: bool,
    pub door_open: bool,
}

impl PresenceTracker {
    /// Record a motion change; returns whether the room state flipped.
    pub fn set_motion(&mut self, room: Room, occupied: bool, now_ms: u64) -> bool {
        match self.rooms.get_mut(&room) {
            Some(state) if state.occupied == occupied => false,
            Some(state) => {
                state.occupied = occupied;
                state.changed_ms = now_ms;
                true
            }
            None => {
                self.rooms.insert(
                    room,
                    RoomPresence {
                        occupied,
                        changed_ms: now_ms,
                    },
                );
                true
            }
        }
    }

    fn is_vacant_for(&self, room: Room, for_secs: u64, now_ms: u64) -> bool {
        match self.rooms.get(&room) {
            Some(state) => {
                !state.occupied
                    && now_ms.saturating_sub(state.changed_ms) >= for_secs * 1_000
            }
            // A room we have never seen motion in counts as vacant.
            None => true,
        }
    }
}

/// Mutable host-side home state; snapshots of it are handed to the engine
/// per event via [`HomeState::views`].
#[derive(Debug)]
pub struct HomeState {
    pub scene: Scene,
    pub pre_sleep: bool,
    timezone: Tz,
    bed_time: NaiveTime,
    pub presence: PresenceTracker,
}

impl HomeState {
    pub fn new(config: &HomeConfig) -> Self {
        let timezone = config.timezone.parse::<Tz>().unwrap_or_else(|_| {
            warn!(timezone = %config.timezone, "invalid timezone, falling back to UTC");
            chrono_tz::UTC
        });
        let bed_time = NaiveTime::parse_from_str(&config.bed_time, "%H:%M")
            .unwrap_or_else(|_| {
                warn!(bed_time = %config.bed_time, "invalid bed time, using 21:30");
                NaiveTime::from_hms_opt(21, 30, 0).unwrap_or(NaiveTime::MIN)
            });
        Self {
            scene: Scene::Day,
            pre_sleep: false,
            timezone,
            bed_time,
            presence: PresenceTracker::default(),
        }
    }

    /// Past bed time and before midnight.
    pub fn is_bed_time(&self) -> bool {
        let now = chrono::Utc::now().with_timezone(&self.timezone).time();
        after_bed_time(now, self.bed_time)
    }

    /// Build the per-evaluation snapshot views the engine consumes.
    pub fn views(&self, now_ms: u64) -> (SceneSnapshot, PresenceSnapshot<'_>) {
        (
            SceneSnapshot {
                scene: self.scene,
                bed_time: self.is_bed_time(),
                pre_sleep: self.pre_sleep,
            },
            PresenceSnapshot {
                tracker: &self.presence,
                now_ms,
            },
        )
    }
}

fn after_bed_time(now: NaiveTime, bed_time: NaiveTime) -> bool {
    now > bed_time
}

pub struct SceneSnapshot {
    scene: Scene,
    bed_time: bool,
    pre_sleep: bool,
}

impl SceneView for SceneSnapshot {
    fn scene(&self) -> Scene {
        self.scene
    }

    fn is_bed_time(&self) -> bool {
        self.bed_time
    }

    fn is_pre_sleep(&self) -> bool {
        self.pre_sleep
    }
}

pub struct PresenceSnapshot<'a> {
    tracker: &'a PresenceTracker,
    now_ms: u64,
}

impl PresenceView for PresenceSnapshot<'_> {
    fn anyone_home(&self) -> bool {
        self.tracker.anyone_home
    }

    fn is_door_open(&self) -> bool {
        self.tracker.door_open
    }

    fn pets_home_alone(&self) -> bool {
        self.tracker.pets_home_alone
    }

    fn is_room_vacant(&self, room: Room, for_secs: u64) -> bool {
        self.tracker.is_vacant_for(room, for_secs, self.now_ms)
    }
}
