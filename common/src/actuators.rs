use tracing::debug;

use crate::types::{
    Action, AirconFanMode, Command, HvacMode, Notification, NotifyTarget, Room, TimerKind,
};

/// One ducted aircon zone. Commands are issued only when the cached
/// observed device state differs from the desired state, which also
/// re-asserts commands after an external desync.
#[derive(Debug, Clone)]
pub struct Aircon {
    zone: Room,
    observed_mode: HvacMode,
    observed_setpoint: Option<f64>,
    observed_fan: Option<AirconFanMode>,
}

impl Aircon {
    pub fn new(zone: Room) -> Self {
        Self {
            zone,
            observed_mode: HvacMode::Off,
            observed_setpoint: None,
            observed_fan: None,
        }
    }

    pub fn zone(&self) -> Room {
        self.zone
    }

    pub fn observed_mode(&self) -> HvacMode {
        self.observed_mode
    }

    pub fn turn_on(
        &mut self,
        mode: HvacMode,
        setpoint: f64,
        fan: Option<AirconFanMode>,
        out: &mut Vec<Action>,
    ) {
        if self.observed_mode != mode {
            out.push(Action::Device(Command::AirconMode {
                zone: self.zone,
                mode,
            }));
            self.observed_mode = mode;
        }
        if self.observed_setpoint != Some(setpoint) {
            out.push(Action::Device(Command::AirconSetpoint {
                zone: self.zone,
                temperature: setpoint,
            }));
            self.observed_setpoint = Some(setpoint);
        }
        if let Some(fan) = fan {
            self.set_fan_mode(fan, out);
        }
    }

    pub fn turn_off(&mut self, out: &mut Vec<Action>) {
        if self.observed_mode != HvacMode::Off {
            out.push(Action::Device(Command::AirconOff { zone: self.zone }));
            self.observed_mode = HvacMode::Off;
        }
    }

    pub fn set_fan_mode(&mut self, fan: AirconFanMode, out: &mut Vec<Action>) {
        if self.observed_fan != Some(fan) {
            out.push(Action::Device(Command::AirconFan {
                zone: self.zone,
                mode: fan,
            }));
            self.observed_fan = Some(fan);
        }
    }

    /// Reconcile the cache with a state report from the device itself.
    pub fn sync_observed(
        &mut self,
        mode: HvacMode,
        setpoint: Option<f64>,
        fan: Option<AirconFanMode>,
    ) {
        self.observed_mode = mode;
        self.observed_setpoint = setpoint;
        self.observed_fan = fan;
    }
}

/// A ceiling fan. Desired state is decoupled from applied state by a
/// minimum re-adjustment interval: within the interval a single pending
/// timer re-fires the adjustment once, applying the latest desired state.
#[derive(Debug, Clone)]
pub struct CeilingFan {
    room: Room,
    speed: u8,
    cooling_direction: bool,
    ignoring_vacancy: bool,
    occupied: bool,
    last_adjustment_ms: Option<u64>,
    timer_pending: bool,
    observed_on: bool,
    observed_percent: u8,
    observed_forward: bool,
}

impl CeilingFan {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            speed: 0,
            cooling_direction: true,
            ignoring_vacancy: false,
            occupied: false,
            last_adjustment_ms: None,
            timer_pending: false,
            observed_on: false,
            observed_percent: 0,
            observed_forward: true,
        }
    }

    pub fn room(&self) -> Room {
        self.room
    }

    pub fn desired_speed(&self) -> u8 {
        self.speed
    }

    pub fn is_ignoring_vacancy(&self) -> bool {
        self.ignoring_vacancy
    }

    /// Desired speed and direction for whenever the fan should be on.
    pub fn settings_when_on(&mut self, speed: u8, cooling_direction: bool) {
        self.speed = speed;
        self.cooling_direction = cooling_direction;
    }

    pub fn set_ignore_vacancy(&mut self, ignore: bool) {
        self.ignoring_vacancy = ignore;
    }

    pub fn set_occupied(&mut self, occupied: bool) {
        self.occupied = occupied;
    }

    /// Apply the desired state, rate limited. An unoccupied fan at zero
    /// desired speed is turned off regardless of the timer so it never
    /// spins in an empty room waiting out the interval.
    pub fn adjust(&mut self, interval_ms: u64, now_ms: u64, out: &mut Vec<Action>) {
        if self.speed == 0 && !self.ignoring_vacancy && !self.occupied {
            if self.timer_pending {
                out.push(Action::CancelTimer {
                    kind: TimerKind::FanAdjust(self.room),
                });
                self.timer_pending = false;
            }
            if self.observed_on {
                out.push(Action::Device(Command::FanOff { room: self.room }));
                self.observed_on = false;
                self.last_adjustment_ms = Some(now_ms);
            }
            return;
        }
        if self.timer_pending {
            // The pending timer will pick up the latest desired state.
            return;
        }
        if let Some(last) = self.last_adjustment_ms {
            let elapsed = now_ms.saturating_sub(last);
            if elapsed < interval_ms {
                out.push(Action::StartTimer {
                    kind: TimerKind::FanAdjust(self.room),
                    delay_ms: interval_ms - elapsed,
                });
                self.timer_pending = true;
                return;
            }
        }
        self.apply(now_ms, out);
    }

    /// The debounce timer fired; apply whatever is desired now. The timer
    /// was scheduled to land at the interval's expiry, so no further
    /// interval check is needed.
    pub fn on_timer(&mut self, now_ms: u64, out: &mut Vec<Action>) {
        self.timer_pending = false;
        self.apply(now_ms, out);
    }

    /// Immediate stop, bypassing the debounce (used on Away transitions and
    /// shutdown).
    pub fn turn_off(&mut self, out: &mut Vec<Action>) {
        self.speed = 0;
        if self.timer_pending {
            out.push(Action::CancelTimer {
                kind: TimerKind::FanAdjust(self.room),
            });
            self.timer_pending = false;
        }
        if self.observed_on {
            out.push(Action::Device(Command::FanOff { room: self.room }));
            self.observed_on = false;
        }
    }

    /// The timer fired but no adjustment should be applied (control was
    /// disabled in the meantime); just drop the pending marker.
    pub fn clear_pending_timer(&mut self) {
        self.timer_pending = false;
    }

    /// Cancel any pending debounce timer without touching the device.
    pub fn cancel_timer(&mut self, out: &mut Vec<Action>) {
        if self.timer_pending {
            out.push(Action::CancelTimer {
                kind: TimerKind::FanAdjust(self.room),
            });
            self.timer_pending = false;
        }
    }

    fn apply(&mut self, now_ms: u64, out: &mut Vec<Action>) {
        let mut issued = false;
        if self.speed > 0 && (self.ignoring_vacancy || self.occupied) {
            if self.observed_forward != self.cooling_direction {
                out.push(Action::Device(Command::FanDirection {
                    room: self.room,
                    cooling: self.cooling_direction,
                }));
                self.observed_forward = self.cooling_direction;
                issued = true;
            }
            if self.observed_on {
                if self.observed_percent != self.speed {
                    out.push(Action::Device(Command::FanPercentage {
                        room: self.room,
                        percent: self.speed,
                    }));
                    self.observed_percent = self.speed;
                    issued = true;
                }
            } else {
                out.push(Action::Device(Command::FanOn {
                    room: self.room,
                    percent: self.speed,
                }));
                self.observed_on = true;
                self.observed_percent = self.speed;
                issued = true;
            }
        } else if self.observed_on {
            out.push(Action::Device(Command::FanOff { room: self.room }));
            self.observed_on = false;
            issued = true;
        }
        if issued {
            self.last_adjustment_ms = Some(now_ms);
            debug!(
                room = self.room.as_str(),
                speed = self.speed,
                "applied ceiling fan state"
            );
        }
    }

    pub fn sync_observed(&mut self, on: bool, percent: u8, forward: bool) {
        self.observed_on = on;
        self.observed_percent = percent;
        self.observed_forward = forward;
    }
}

/// A room heater: plain on/off, no debounce. The dog bed area heater
/// alerts on activation because of what tends to pile up around it.
#[derive(Debug, Clone)]
pub struct Heater {
    room: Room,
    alert_on_activation: bool,
    observed_on: bool,
}

impl Heater {
    pub fn new(room: Room, alert_on_activation: bool) -> Self {
        Self {
            room,
            alert_on_activation,
            observed_on: false,
        }
    }

    pub fn room(&self) -> Room {
        self.room
    }

    pub fn is_on(&self) -> bool {
        self.observed_on
    }

    pub fn turn_on(&mut self, out: &mut Vec<Action>) {
        if self.observed_on {
            return;
        }
        out.push(Action::Device(Command::HeaterOn { room: self.room }));
        self.observed_on = true;
        if self.alert_on_activation {
            out.push(Action::Notify(Notification::new(
                format!(
                    "The {} heater is now on - check surroundings are clear",
                    self.room.display_name()
                ),
                NotifyTarget::AnyoneHomeElseAll,
            )));
        }
    }

    pub fn turn_off(&mut self, out: &mut Vec<Action>) {
        if self.observed_on {
            out.push(Action::Device(Command::HeaterOff { room: self.room }));
            self.observed_on = false;
        }
    }

    pub fn sync_observed(&mut self, on: bool) {
        self.observed_on = on;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const INTERVAL: u64 = 120_000;

    fn occupied_fan() -> CeilingFan {
        let mut fan = CeilingFan::new(Room::Bedroom);
        fan.set_occupied(true);
        fan
    }

    #[test]
    fn aircon_commands_are_idempotent() {
        let mut aircon = Aircon::new(Room::Bedroom);
        let mut out = Vec::new();
        aircon.turn_on(HvacMode::Cool, 24.0, Some(AirconFanMode::Auto), &mut out);
        assert_eq!(out.len(), 3);

        out.clear();
        aircon.turn_on(HvacMode::Cool, 24.0, Some(AirconFanMode::Auto), &mut out);
        assert!(out.is_empty());

        out.clear();
        aircon.turn_on(HvacMode::Cool, 23.0, Some(AirconFanMode::Auto), &mut out);
        assert_eq!(
            out,
            vec![Action::Device(Command::AirconSetpoint {
                zone: Room::Bedroom,
                temperature: 23.0
            })]
        );
    }

    #[test]
    fn aircon_reasserts_after_observed_desync() {
        let mut aircon = Aircon::new(Room::LivingRoom);
        let mut out = Vec::new();
        aircon.turn_on(HvacMode::Heat, 21.0, None, &mut out);
        out.clear();
        // Someone turned the unit off at the wall panel.
        aircon.sync_observed(HvacMode::Off, None, None);
        aircon.turn_on(HvacMode::Heat, 21.0, None, &mut out);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn aircon_turn_off_noops_when_already_off() {
        let mut aircon = Aircon::new(Room::DiningRoom);
        let mut out = Vec::new();
        aircon.turn_off(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn first_fan_adjustment_applies_immediately() {
        let mut fan = occupied_fan();
        let mut out = Vec::new();
        fan.settings_when_on(50, true);
        fan.adjust(INTERVAL, 1_000, &mut out);
        assert_eq!(
            out,
            vec![Action::Device(Command::FanOn {
                room: Room::Bedroom,
                percent: 50
            })]
        );
    }

    #[test]
    fn changes_within_interval_coalesce_into_one_command() {
        let mut fan = occupied_fan();
        let mut out = Vec::new();
        fan.settings_when_on(25, true);
        fan.adjust(INTERVAL, 0, &mut out);
        out.clear();

        // Two changes inside the interval: one timer, no device commands.
        fan.settings_when_on(50, true);
        fan.adjust(INTERVAL, 10_000, &mut out);
        assert_eq!(
            out,
            vec![Action::StartTimer {
                kind: TimerKind::FanAdjust(Room::Bedroom),
                delay_ms: INTERVAL - 10_000
            }]
        );
        out.clear();
        fan.settings_when_on(75, true);
        fan.adjust(INTERVAL, 20_000, &mut out);
        assert!(out.is_empty());

        // The timer fires with the latest desired speed.
        fan.on_timer(INTERVAL, &mut out);
        assert_eq!(
            out,
            vec![Action::Device(Command::FanPercentage {
                room: Room::Bedroom,
                percent: 75
            })]
        );
    }

    #[test]
    fn vacant_zero_speed_fan_stops_despite_pending_timer() {
        let mut fan = occupied_fan();
        let mut out = Vec::new();
        fan.settings_when_on(50, true);
        fan.adjust(INTERVAL, 0, &mut out);
        out.clear();
        fan.settings_when_on(75, true);
        fan.adjust(INTERVAL, 5_000, &mut out);
        out.clear();

        fan.set_occupied(false);
        fan.settings_when_on(0, true);
        fan.adjust(INTERVAL, 6_000, &mut out);
        assert_eq!(
            out,
            vec![
                Action::CancelTimer {
                    kind: TimerKind::FanAdjust(Room::Bedroom)
                },
                Action::Device(Command::FanOff { room: Room::Bedroom }),
            ]
        );
    }

    #[test]
    fn direction_change_is_issued_before_speed() {
        let mut fan = occupied_fan();
        let mut out = Vec::new();
        fan.settings_when_on(25, false);
        fan.adjust(INTERVAL, 0, &mut out);
        assert_eq!(
            out,
            vec![
                Action::Device(Command::FanDirection {
                    room: Room::Bedroom,
                    cooling: false
                }),
                Action::Device(Command::FanOn {
                    room: Room::Bedroom,
                    percent: 25
                }),
            ]
        );
    }

    #[test]
    fn ignoring_vacancy_keeps_fan_running_when_vacant() {
        let mut fan = CeilingFan::new(Room::Bedroom);
        fan.set_ignore_vacancy(true);
        let mut out = Vec::new();
        fan.settings_when_on(25, true);
        fan.adjust(INTERVAL, 0, &mut out);
        assert_eq!(
            out,
            vec![Action::Device(Command::FanOn {
                room: Room::Bedroom,
                percent: 25
            })]
        );
    }

    #[test]
    fn heater_alerts_on_activation_once() {
        let mut heater = Heater::new(Room::DogBedArea, true);
        let mut out = Vec::new();
        heater.turn_on(&mut out);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], Action::Notify(_)));

        out.clear();
        heater.turn_on(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn heater_without_alert_only_commands() {
        let mut heater = Heater::new(Room::Nursery, false);
        let mut out = Vec::new();
        heater.turn_on(&mut out);
        assert_eq!(
            out,
            vec![Action::Device(Command::HeaterOn {
                room: Room::Nursery
            })]
        );
        out.clear();
        heater.turn_off(&mut out);
        assert_eq!(
            out,
            vec![Action::Device(Command::HeaterOff {
                room: Room::Nursery
            })]
        );
    }
}
