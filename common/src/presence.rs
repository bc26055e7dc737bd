use std::collections::BTreeMap;

use tracing::debug;

use crate::types::{Action, Room, Scene, TimerKind, WatchId};

/// Scene scheduler queries. Implementations snapshot the scheduler's state
/// at call time; the engine never caches answers across evaluations.
pub trait SceneView {
    fn scene(&self) -> Scene;
    /// Past bed time (and before midnight).
    fn is_bed_time(&self) -> bool;
    /// A transitional scene on the way to Sleep is active.
    fn is_pre_sleep(&self) -> bool;
}

/// Presence tracker queries.
pub trait PresenceView {
    fn anyone_home(&self) -> bool;
    fn is_door_open(&self) -> bool;
    /// Pets are home without their humans.
    fn pets_home_alone(&self) -> bool;
    /// The room has been empty for at least the given duration.
    fn is_room_vacant(&self, room: Room, for_secs: u64) -> bool;
}

/// Collaborator snapshot handed into every engine entry point.
pub struct EngineCtx<'a> {
    pub scenes: &'a dyn SceneView,
    pub presence: &'a dyn PresenceView,
}

impl EngineCtx<'_> {
    /// Whether the sleep variants of the threshold settings apply.
    pub fn sleep_settings(&self) -> bool {
        self.scenes.scene() == Scene::Sleep || self.scenes.is_bed_time()
    }

    /// Whether sensing should be restricted to the bedroom.
    pub fn bedroom_only_sensing(&self) -> bool {
        self.sleep_settings()
            || (self.presence.pets_home_alone() && self.presence.is_door_open())
    }
}

#[derive(Debug, Clone, Copy)]
struct Watch {
    room: Room,
    delay_ms: u64,
    timer_pending: bool,
}

/// A delivered vacancy-watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchEvent {
    pub id: WatchId,
    pub room: Room,
    pub occupied: bool,
}

/// Registry of room-vacancy watches. Registration hands back an opaque id;
/// cancellation removes by id and drops any pending delay timer, so a
/// watch can always be re-registered without double callbacks.
#[derive(Debug, Default)]
pub struct VacancyWatches {
    next_id: u64,
    watches: BTreeMap<WatchId, Watch>,
}

impl VacancyWatches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, room: Room, delay_ms: u64) -> WatchId {
        let id = WatchId(self.next_id);
        self.next_id += 1;
        self.watches.insert(
            id,
            Watch {
                room,
                delay_ms,
                timer_pending: false,
            },
        );
        debug!(?id, room = room.as_str(), delay_ms, "registered vacancy watch");
        id
    }

    pub fn cancel(&mut self, id: WatchId, out: &mut Vec<Action>) {
        if let Some(watch) = self.watches.remove(&id) {
            if watch.timer_pending {
                out.push(Action::CancelTimer {
                    kind: TimerKind::Vacancy(id),
                });
            }
            debug!(?id, room = watch.room.as_str(), "cancelled vacancy watch");
        }
    }

    /// Route a raw room presence change to its watches. Occupied changes
    /// deliver immediately; vacancy is delayed by each watch's vacating
    /// delay via a timer (any previous pending timer is cancelled first).
    pub fn on_presence_change(
        &mut self,
        room: Room,
        occupied: bool,
        out: &mut Vec<Action>,
    ) -> Vec<WatchEvent> {
        let mut delivered = Vec::new();
        for (id, watch) in &mut self.watches {
            if watch.room != room {
                continue;
            }
            if watch.timer_pending {
                out.push(Action::CancelTimer {
                    kind: TimerKind::Vacancy(*id),
                });
                watch.timer_pending = false;
            }
            if occupied || watch.delay_ms == 0 {
                delivered.push(WatchEvent {
                    id: *id,
                    room,
                    occupied,
                });
            } else {
                out.push(Action::StartTimer {
                    kind: TimerKind::Vacancy(*id),
                    delay_ms: watch.delay_ms,
                });
                watch.timer_pending = true;
            }
        }
        delivered
    }

    /// A vacating-delay timer fired: the room is now considered vacant.
    pub fn on_timer(&mut self, id: WatchId) -> Option<WatchEvent> {
        let watch = self.watches.get_mut(&id)?;
        watch.timer_pending = false;
        Some(WatchEvent {
            id,
            room: watch.room,
            occupied: false,
        })
    }

    /// Cancel everything, for shutdown.
    pub fn cancel_all(&mut self, out: &mut Vec<Action>) {
        let ids: Vec<WatchId> = self.watches.keys().copied().collect();
        for id in ids {
            self.cancel(id, out);
        }
    }
}
