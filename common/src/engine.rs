use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::actuators::{Aircon, CeilingFan, Heater};
use crate::config::{ActiveThresholds, ClimateConfig, SettingName, ThresholdKey, ThresholdSettings};
use crate::monitor::TemperatureMonitor;
use crate::presence::{EngineCtx, VacancyWatches, WatchEvent};
use crate::types::{
    Action, AirconFanMode, HvacMode, Notification, NotifyTarget, Room, Scene, TimerKind, WatchId,
};

/// Snapshot of the engine-owned flags for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct ClimateStatus {
    #[serde(rename = "insideTemperature")]
    pub inside_temperature: Option<f64>,
    #[serde(rename = "outsideTemperature")]
    pub outside_temperature: Option<f64>,
    #[serde(rename = "controlEnabled")]
    pub control_enabled: bool,
    #[serde(rename = "airconOn")]
    pub aircon_on: bool,
    pub overridden: bool,
    #[serde(rename = "suggestionPending")]
    pub suggestion_pending: bool,
    #[serde(rename = "beforeAwayEnabled")]
    pub before_away_enabled: bool,
}

/// The climate control engine. Owns the control-enabled and aircon flags,
/// override history and the suggestion gate, and orchestrates the actuator
/// wrappers from temperature, scene and presence input.
///
/// Every entry point is synchronous and returns the side effects to run;
/// re-entrant transition chains (an aircon toggle can re-enable control,
/// which re-evaluates temperatures, which can toggle aircon) converge
/// because each guard captures the flags as they were when it started.
#[derive(Debug)]
pub struct ClimateEngine {
    config: ClimateConfig,
    settings: ThresholdSettings,
    monitor: TemperatureMonitor,
    aircons: BTreeMap<Room, Aircon>,
    fans: BTreeMap<Room, CeilingFan>,
    heaters: BTreeMap<Room, Heater>,
    watches: VacancyWatches,
    fan_watches: BTreeMap<Room, WatchId>,
    control_enabled: bool,
    control_last_changed_ms: Option<u64>,
    aircon_on: bool,
    overridden: bool,
    before_away_enabled: bool,
    suggested: bool,
    door_timer_pending: bool,
}

impl ClimateEngine {
    pub fn new(
        config: ClimateConfig,
        mut settings: ThresholdSettings,
        control_enabled: bool,
        aircon_on: bool,
    ) -> Self {
        settings.sanitize();
        Self {
            config,
            settings,
            monitor: TemperatureMonitor::new(),
            aircons: Room::AIRCON_ZONES
                .into_iter()
                .map(|zone| (zone, Aircon::new(zone)))
                .collect(),
            fans: Room::FAN_ROOMS
                .into_iter()
                .map(|room| (room, CeilingFan::new(room)))
                .collect(),
            heaters: Room::HEATER_ROOMS
                .into_iter()
                .map(|room| (room, Heater::new(room, room == Room::DogBedArea)))
                .collect(),
            watches: VacancyWatches::new(),
            fan_watches: BTreeMap::new(),
            control_enabled,
            control_last_changed_ms: None,
            aircon_on,
            overridden: false,
            before_away_enabled: control_enabled,
            suggested: false,
            door_timer_pending: false,
        }
    }

    /// Wire up sensing and presence watches. Call once after construction.
    pub fn initialize(&mut self, ctx: &EngineCtx) -> Vec<Action> {
        let mut out = Vec::new();
        self.monitor.configure_sensors(ctx.bedroom_only_sensing());
        self.configure_fan_presence(ctx, &mut out);
        self.reconfigure_door_listener(ctx, &mut out);
        out
    }

    pub fn control_enabled(&self) -> bool {
        self.control_enabled
    }

    pub fn aircon_on(&self) -> bool {
        self.aircon_on
    }

    pub fn is_overridden(&self) -> bool {
        self.overridden
    }

    pub fn suggestion_pending(&self) -> bool {
        self.suggested
    }

    pub fn settings(&self) -> &ThresholdSettings {
        &self.settings
    }

    pub fn monitor(&self) -> &TemperatureMonitor {
        &self.monitor
    }

    pub fn status(&self) -> ClimateStatus {
        ClimateStatus {
            inside_temperature: self.monitor.inside_temperature(),
            outside_temperature: self.monitor.outside_temperature(),
            control_enabled: self.control_enabled,
            aircon_on: self.aircon_on,
            overridden: self.overridden,
            suggestion_pending: self.suggested,
            before_away_enabled: self.before_away_enabled,
        }
    }

    /// Enable or disable autonomous control.
    pub fn set_control_enabled(&mut self, enabled: bool, ctx: &EngineCtx, now_ms: u64) -> Vec<Action> {
        let mut out = Vec::new();
        self.set_control_enabled_inner(enabled, ctx, now_ms, &mut out);
        out
    }

    /// Turn the aircon on or off (manual or automatic callers alike).
    pub fn set_aircon(&mut self, on: bool, ctx: &EngineCtx, now_ms: u64) -> Vec<Action> {
        let mut out = Vec::new();
        self.set_aircon_inner(on, ctx, now_ms, &mut out);
        out
    }

    /// Idempotent external re-evaluation trigger.
    pub fn handle_temperatures(&mut self, ctx: &EngineCtx, now_ms: u64) -> Vec<Action> {
        let mut out = Vec::new();
        self.handle_temperatures_inner(ctx, now_ms, &mut out);
        out
    }

    /// A temperature reading arrived (absent when the raw value was
    /// unparsable). Only a change in the rounded fused value re-evaluates.
    pub fn handle_sensor_temperature(
        &mut self,
        room: Room,
        value: Option<f64>,
        ctx: &EngineCtx,
        now_ms: u64,
    ) -> Vec<Action> {
        let mut out = Vec::new();
        match value {
            Some(value) => {
                if self.monitor.record_temperature(room, value) {
                    self.handle_temperatures_inner(ctx, now_ms, &mut out);
                }
            }
            None => debug!(room = room.as_str(), "ignoring absent temperature reading"),
        }
        out
    }

    pub fn handle_sensor_humidity(
        &mut self,
        room: Room,
        value: Option<f64>,
        ctx: &EngineCtx,
        now_ms: u64,
    ) -> Vec<Action> {
        let mut out = Vec::new();
        match value {
            Some(value) => {
                if self.monitor.record_humidity(room, value) {
                    self.handle_temperatures_inner(ctx, now_ms, &mut out);
                }
            }
            None => debug!(room = room.as_str(), "ignoring absent humidity reading"),
        }
        out
    }

    pub fn handle_outside_temperature(
        &mut self,
        value: Option<f64>,
        ctx: &EngineCtx,
        now_ms: u64,
    ) -> Vec<Action> {
        let mut out = Vec::new();
        match value {
            Some(value) => {
                if self.monitor.record_outside(value) {
                    self.handle_temperatures_inner(ctx, now_ms, &mut out);
                }
            }
            None => debug!("ignoring absent outside temperature"),
        }
        out
    }

    pub fn record_forecast(&mut self, hours_ahead: u8, value: f64) {
        self.monitor.record_forecast(hours_ahead, value);
    }

    /// Scene scheduler entry point. `ctx` must already reflect `new_scene`.
    pub fn handle_scene_transition(
        &mut self,
        new_scene: Scene,
        old_scene: Scene,
        ctx: &EngineCtx,
        now_ms: u64,
    ) -> Vec<Action> {
        let mut out = Vec::new();
        self.handle_scene_transition_inner(new_scene, old_scene, ctx, now_ms, &mut out);
        out
    }

    /// A user setting changed. Threshold edits are validated against their
    /// pair and trigger a full reset; the delay settings reconfigure their
    /// timers/watches in place.
    pub fn update_setting(
        &mut self,
        name: &str,
        value: f64,
        ctx: &EngineCtx,
        now_ms: u64,
    ) -> Vec<Action> {
        let mut out = Vec::new();
        match SettingName::parse(name) {
            Some(SettingName::Threshold { key, sleep }) => {
                self.settings.set(key, sleep, value);
                self.validate_setting_inner(key, sleep, ctx, now_ms, &mut out);
            }
            Some(SettingName::DoorCheckDelay) => {
                self.settings.door_check_delay_mins = value.max(0.0);
                self.reconfigure_door_listener(ctx, &mut out);
            }
            Some(SettingName::FanVacatingDelay) => {
                self.settings.fan_vacating_delay_mins = value.max(0.0);
                self.configure_fan_presence(ctx, &mut out);
            }
            None => warn!(name, "ignoring unknown setting"),
        }
        out
    }

    /// Check a threshold against its paired setting, correcting the pair if
    /// the edit broke it, then re-apply settings.
    pub fn validate_setting(&mut self, name: &str, ctx: &EngineCtx, now_ms: u64) -> Vec<Action> {
        let mut out = Vec::new();
        match SettingName::parse(name) {
            Some(SettingName::Threshold { key, sleep }) => {
                self.validate_setting_inner(key, sleep, ctx, now_ms, &mut out);
            }
            Some(_) => {}
            None => warn!(name, "cannot validate unknown setting"),
        }
        out
    }

    /// Reconfigure how long the door must stay open before it counts.
    pub fn set_door_check_delay(&mut self, minutes: f64, ctx: &EngineCtx) -> Vec<Action> {
        let mut out = Vec::new();
        self.settings.door_check_delay_mins = minutes.max(0.0);
        self.reconfigure_door_listener(ctx, &mut out);
        out
    }

    /// Raw kitchen door state change. Opening arms the sustained-open
    /// timer; closing cancels it and re-evaluates.
    pub fn handle_door_changed(&mut self, open: bool, ctx: &EngineCtx, now_ms: u64) -> Vec<Action> {
        let mut out = Vec::new();
        if open {
            if !self.door_timer_pending {
                out.push(Action::StartTimer {
                    kind: TimerKind::DoorOpen,
                    delay_ms: self.door_check_delay_ms(),
                });
                self.door_timer_pending = true;
            }
        } else {
            info!("kitchen door is now closed");
            if self.door_timer_pending {
                out.push(Action::CancelTimer {
                    kind: TimerKind::DoorOpen,
                });
                self.door_timer_pending = false;
            }
            self.handle_temperatures_inner(ctx, now_ms, &mut out);
        }
        out
    }

    /// Raw per-room presence change from the tracker.
    pub fn handle_room_presence(
        &mut self,
        room: Room,
        occupied: bool,
        ctx: &EngineCtx,
        now_ms: u64,
    ) -> Vec<Action> {
        let mut out = Vec::new();
        let events = self.watches.on_presence_change(room, occupied, &mut out);
        for event in events {
            self.deliver_watch_event(event, ctx, now_ms, &mut out);
        }
        out
    }

    /// A previously requested timer fired.
    pub fn handle_timer(&mut self, kind: TimerKind, ctx: &EngineCtx, now_ms: u64) -> Vec<Action> {
        let mut out = Vec::new();
        match kind {
            TimerKind::DoorOpen => {
                self.door_timer_pending = false;
                info!("kitchen door has stayed open past the check delay");
                if self.aircon_on && self.living_room_running() {
                    self.set_aircon_inner(false, ctx, now_ms, &mut out);
                    out.push(Action::Notify(Notification::new(
                        "The kitchen door is open, turning aircon off",
                        NotifyTarget::AnyoneHome,
                    )));
                }
            }
            TimerKind::FanAdjust(room) => {
                let control_enabled = self.control_enabled;
                if let Some(fan) = self.fans.get_mut(&room) {
                    if control_enabled {
                        fan.on_timer(now_ms, &mut out);
                    } else {
                        fan.clear_pending_timer();
                    }
                }
            }
            TimerKind::Vacancy(id) => {
                if let Some(event) = self.watches.on_timer(id) {
                    self.deliver_watch_event(event, ctx, now_ms, &mut out);
                }
            }
        }
        out
    }

    /// Re-apply the current settings: reconfigure sensing, re-assert the
    /// aircon state and re-evaluate.
    pub fn reset(&mut self, ctx: &EngineCtx, now_ms: u64) -> Vec<Action> {
        let mut out = Vec::new();
        self.reset_inner(ctx, now_ms, &mut out);
        out
    }

    /// Cancel every vacancy watch and pending timer before teardown, so no
    /// stale callback can reference a dismantled engine.
    pub fn shutdown(&mut self) -> Vec<Action> {
        let mut out = Vec::new();
        self.fan_watches.clear();
        self.watches.cancel_all(&mut out);
        for fan in self.fans.values_mut() {
            fan.cancel_timer(&mut out);
        }
        if self.door_timer_pending {
            out.push(Action::CancelTimer {
                kind: TimerKind::DoorOpen,
            });
            self.door_timer_pending = false;
        }
        out
    }

    /// Reconcile an aircon zone's cache with a device state report.
    pub fn sync_aircon_state(
        &mut self,
        zone: Room,
        mode: HvacMode,
        setpoint: Option<f64>,
        fan: Option<AirconFanMode>,
    ) {
        if let Some(unit) = self.aircons.get_mut(&zone) {
            unit.sync_observed(mode, setpoint, fan);
        }
    }

    pub fn sync_fan_state(&mut self, room: Room, on: bool, percent: u8, forward: bool) {
        if let Some(fan) = self.fans.get_mut(&room) {
            fan.sync_observed(on, percent, forward);
        }
    }

    pub fn sync_heater_state(&mut self, room: Room, on: bool) {
        if let Some(heater) = self.heaters.get_mut(&room) {
            heater.sync_observed(on);
        }
    }

    fn active(&self, ctx: &EngineCtx) -> ActiveThresholds {
        self.settings.active(ctx.sleep_settings())
    }

    fn inside_display(&self) -> String {
        self.monitor
            .inside_temperature()
            .map(|v| format!("{v:.1}"))
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn outside_display(&self) -> String {
        self.monitor
            .outside_temperature()
            .map(|v| format!("{v:.1}"))
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn bedroom_aircon_mode(&self) -> HvacMode {
        self.aircons
            .get(&Room::Bedroom)
            .map(|unit| unit.observed_mode())
            .unwrap_or(HvacMode::Off)
    }

    fn living_room_running(&self) -> bool {
        self.aircons
            .get(&Room::LivingRoom)
            .map(|unit| unit.observed_mode() != HvacMode::Off)
            .unwrap_or(false)
    }

    fn door_check_delay_ms(&self) -> u64 {
        (self.settings.door_check_delay_mins * 60_000.0) as u64
    }

    fn fan_vacating_delay_ms(&self) -> u64 {
        (self.settings.fan_vacating_delay_mins * 60_000.0) as u64
    }

    fn set_control_enabled_inner(
        &mut self,
        enabled: bool,
        ctx: &EngineCtx,
        now_ms: u64,
        out: &mut Vec<Action>,
    ) {
        let changed = self.control_enabled != enabled;
        if changed {
            info!(enabled, "climate control toggled");
        }
        let previous_change = self.control_last_changed_ms;
        self.control_enabled = enabled;
        if changed {
            self.control_last_changed_ms = Some(now_ms);
        }
        if enabled {
            self.handle_temperatures_inner(ctx, now_ms, out);
        } else {
            self.allow_suggestion();
        }
        if self.overridden {
            if let Some(last) = previous_change {
                if now_ms.saturating_sub(last) > self.config.override_expiry_ms {
                    debug!("protective override expired");
                    self.overridden = false;
                }
            }
        }
        let bedroom_ignore = self.should_bedroom_fan_ignore_vacancy(ctx);
        self.set_fan_ignore_vacancy(Room::Bedroom, bedroom_ignore, now_ms, out);
        let office_ignore = ctx.presence.pets_home_alone();
        self.set_fan_ignore_vacancy(Room::Office, office_ignore, now_ms, out);
    }

    fn set_aircon_inner(&mut self, on: bool, ctx: &EngineCtx, now_ms: u64, out: &mut Vec<Action>) {
        if self.aircon_on == on {
            info!(on, "ensuring aircon state");
        } else {
            info!(on, "switching aircon");
        }
        let was_overridden = self.overridden;
        if on {
            self.disable_control_if_would_trigger_off(ctx, now_ms, out);
            self.engage_aircon(ctx, out);
        } else {
            self.disable_control_if_would_trigger_on(ctx, now_ms, out);
            self.disengage_aircon(out);
        }
        self.aircon_on = on;
        let bedroom_ignore = self.should_bedroom_fan_ignore_vacancy(ctx);
        self.set_fan_ignore_vacancy(Room::Bedroom, bedroom_ignore, now_ms, out);
        if was_overridden {
            self.overridden = false;
            info!("aircon changed while overridden, re-enabling climate control");
            self.set_control_enabled_inner(true, ctx, now_ms, out);
        }
    }

    /// Turning aircon on while inside is already within target would make
    /// control turn it straight back off; disable control instead of
    /// contradicting the user.
    fn disable_control_if_would_trigger_off(
        &mut self,
        ctx: &EngineCtx,
        now_ms: u64,
        out: &mut Vec<Action>,
    ) {
        let thresholds = self.active(ctx);
        if self.control_enabled && self.monitor.is_within_target(&thresholds) {
            self.set_control_enabled_inner(false, ctx, now_ms, out);
            self.overridden = true;
            out.push(Action::Notify(Notification::new(
                "Inside is already within the desired temperature range, climate control \
                 is now disabled (you'll need to manually turn aircon off)",
                NotifyTarget::AnyoneHomeElseAll,
            )));
        }
    }

    /// Symmetric guard: turning aircon off while it is too hot or cold
    /// would have control turn it straight back on.
    fn disable_control_if_would_trigger_on(
        &mut self,
        ctx: &EngineCtx,
        now_ms: u64,
        out: &mut Vec<Action>,
    ) {
        let thresholds = self.active(ctx);
        if self.control_enabled && self.monitor.is_too_hot_or_cold(&thresholds) {
            self.set_control_enabled_inner(false, ctx, now_ms, out);
            self.overridden = true;
            out.push(Action::Notify(Notification::new(
                format!(
                    "The current temperature ({}º) will immediately trigger aircon on \
                     again - climate control is now disabled to prevent this",
                    self.inside_display()
                ),
                NotifyTarget::AnyoneHomeElseAll,
            )));
        }
    }

    fn engage_aircon(&mut self, ctx: &EngineCtx, out: &mut Vec<Action>) {
        let thresholds = self.active(ctx);
        let mode = if self.monitor.is_below_target(&thresholds) {
            HvacMode::Heat
        } else if self.monitor.is_above_target(&thresholds) {
            HvacMode::Cool
        } else {
            self.monitor.closer_to_heat_or_cool(&thresholds)
        };
        let setpoint = match mode {
            HvacMode::Heat => thresholds.heating_target + self.config.target_buffer,
            _ => thresholds.cooling_target - self.config.target_buffer,
        };
        info!(
            inside = %self.inside_display(),
            mode = mode.as_str(),
            setpoint,
            "engaging aircon"
        );
        let scene = ctx.scenes.scene();
        let pets_bedroom_only = ctx.presence.pets_home_alone()
            && !ctx.presence.anyone_home()
            && ctx.presence.is_door_open();
        if ctx.sleep_settings() || pets_bedroom_only {
            let fan = if ctx.scenes.is_pre_sleep() || scene != Scene::Sleep {
                AirconFanMode::High
            } else {
                AirconFanMode::Low
            };
            if let Some(unit) = self.aircons.get_mut(&Room::Bedroom) {
                unit.turn_on(mode, setpoint, Some(fan), out);
            }
            for zone in [Room::LivingRoom, Room::DiningRoom] {
                if let Some(unit) = self.aircons.get_mut(&zone) {
                    unit.turn_off(out);
                }
            }
        } else if scene == Scene::Morning {
            for zone in Room::AIRCON_ZONES {
                let fan = if zone == Room::Bedroom {
                    AirconFanMode::Low
                } else {
                    AirconFanMode::Auto
                };
                if let Some(unit) = self.aircons.get_mut(&zone) {
                    unit.turn_on(mode, setpoint, Some(fan), out);
                }
            }
        } else {
            for zone in Room::AIRCON_ZONES {
                if let Some(unit) = self.aircons.get_mut(&zone) {
                    unit.turn_on(mode, setpoint, Some(AirconFanMode::Auto), out);
                }
            }
        }
        self.allow_suggestion();
    }

    fn disengage_aircon(&mut self, out: &mut Vec<Action>) {
        for zone in Room::AIRCON_ZONES {
            if let Some(unit) = self.aircons.get_mut(&zone) {
                unit.turn_off(out);
            }
        }
        info!("aircon is off");
        self.allow_suggestion();
    }

    fn handle_temperatures_inner(&mut self, ctx: &EngineCtx, now_ms: u64, out: &mut Vec<Action>) {
        if self.monitor.inside_temperature().is_none() {
            return;
        }
        if self.control_enabled {
            self.adjust_fans(ctx, now_ms, out);
            self.adjust_heaters(ctx, out);
        }
        let thresholds = self.active(ctx);
        if !self.aircon_on {
            if self.monitor.is_too_hot_or_cold(&thresholds) {
                self.handle_too_hot_or_cold(ctx, now_ms, out);
            }
        } else if self.monitor.is_within_target(&thresholds) {
            let message = format!(
                "A desirable inside temperature of {}º has been reached,",
                self.inside_display()
            );
            if self.control_enabled {
                self.set_aircon_inner(false, ctx, now_ms, out);
                out.push(Action::Notify(Notification::new(
                    format!("{message} turning aircon off"),
                    NotifyTarget::AnyoneHomeElseAll,
                )));
            } else {
                self.suggest(
                    format!("{message} consider enabling climate control"),
                    out,
                );
            }
        }
    }

    /// Branches in priority order: unattended pets force action, then the
    /// outside-nicer path, then plain act-or-suggest.
    fn handle_too_hot_or_cold(&mut self, ctx: &EngineCtx, now_ms: u64, out: &mut Vec<Action>) {
        let thresholds = self.active(ctx);
        if ctx.presence.pets_home_alone() {
            self.set_aircon_inner(true, ctx, now_ms, out);
            let door_note = if ctx.presence.is_door_open() {
                " in the bedroom only (kitchen door is open)"
            } else {
                ""
            };
            out.push(Action::Notify(Notification::new(
                format!(
                    "It is {}º inside at home, turning aircon on for the pets{door_note}",
                    self.inside_display()
                ),
                NotifyTarget::All,
            )));
        } else if self.monitor.is_outside_nicer(
            &thresholds,
            self.config.inside_outside_delta,
            self.bedroom_aircon_mode(),
        ) {
            let mut message = format!(
                "Outside ({}º) is a more pleasant temperature than inside ({}º), consider",
                self.outside_display(),
                self.inside_display()
            );
            if self.control_enabled {
                if !ctx.presence.is_door_open() {
                    self.set_aircon_inner(true, ctx, now_ms, out);
                    self.suggest(format!("{message} opening up the house"), out);
                }
            } else if ctx.presence.anyone_home() {
                if !ctx.presence.is_door_open() {
                    message.push_str(" opening up the house and/or");
                }
                self.suggest(format!("{message} enabling climate control"), out);
            }
        } else {
            let mut message = format!(
                "It's {}º inside right now, consider",
                self.inside_display()
            );
            if self.control_enabled {
                if !ctx.presence.is_door_open() {
                    self.set_aircon_inner(true, ctx, now_ms, out);
                } else {
                    self.suggest(
                        format!("{message} closing up the house so airconditioning can turn on"),
                        out,
                    );
                }
            } else {
                if ctx.presence.is_door_open() {
                    message.push_str(" closing up the house and");
                }
                self.suggest(format!("{message} enabling climate control"), out);
            }
        }
    }

    /// One discrete step per degree above the cooling target, capped at the
    /// configured level count; a single baseline step keeps air moving when
    /// heating with the aircon on outside Sleep/Morning.
    fn adjust_fans(&mut self, ctx: &EngineCtx, now_ms: u64, out: &mut Vec<Action>) {
        let thresholds = self.active(ctx);
        let levels = u32::from(self.config.fan_speed_levels.max(1));
        let per_step = 100 / levels;
        let mut speed: u8 = 0;
        let mut cooling = false;
        if !self.monitor.is_within_target(&thresholds) {
            cooling = self.monitor.is_above_target(&thresholds);
            if cooling {
                if let Some(inside) = self.monitor.inside_temperature() {
                    let degrees = (inside - thresholds.cooling_target).ceil().max(1.0) as u32;
                    speed = (per_step * degrees.min(levels)) as u8;
                }
            } else if self.aircon_on
                && !matches!(ctx.scenes.scene(), Scene::Sleep | Scene::Morning)
            {
                speed = per_step as u8;
            }
        }
        let interval = self.config.fan_adjustment_interval_ms;
        for room in Room::FAN_ROOMS {
            if let Some(fan) = self.fans.get_mut(&room) {
                fan.settings_when_on(speed, cooling);
                fan.adjust(interval, now_ms, out);
            }
        }
        debug!(speed, cooling, "set desired ceiling fan speed");
    }

    /// Binary hysteresis around the heating target, gated by per-room
    /// eligibility. Any heater found on during Away is an anomaly.
    fn adjust_heaters(&mut self, ctx: &EngineCtx, out: &mut Vec<Action>) {
        if ctx.scenes.scene().is_away() {
            for room in Room::HEATER_ROOMS {
                if let Some(heater) = self.heaters.get_mut(&room) {
                    if heater.is_on() {
                        warn!(
                            room = room.as_str(),
                            "heater is on during an Away scene - should already be off"
                        );
                        heater.turn_off(out);
                    }
                }
            }
            return;
        }
        let thresholds = self.active(ctx);
        let buffer = self.config.heater_buffer;
        let vacancy_secs = self.config.heater_vacancy_secs;
        let sleep_like = ctx.scenes.is_bed_time() || ctx.scenes.scene() == Scene::Sleep;
        for room in Room::HEATER_ROOMS {
            let eligible = match room {
                Room::Nursery => sleep_like || !ctx.presence.is_room_vacant(room, vacancy_secs),
                Room::Office => !ctx.presence.is_room_vacant(room, vacancy_secs),
                _ => sleep_like,
            };
            let Some(temperature) = self.monitor.room_apparent_temperature(room) else {
                debug!(room = room.as_str(), "no reading for heater room yet");
                continue;
            };
            if let Some(heater) = self.heaters.get_mut(&room) {
                if !heater.is_on() {
                    if eligible && temperature < thresholds.heating_target - buffer {
                        heater.turn_on(out);
                    }
                } else if !eligible || temperature > thresholds.heating_target + buffer {
                    heater.turn_off(out);
                }
            }
        }
    }

    fn handle_scene_transition_inner(
        &mut self,
        new_scene: Scene,
        old_scene: Scene,
        ctx: &EngineCtx,
        now_ms: u64,
        out: &mut Vec<Action>,
    ) {
        info!(
            new = new_scene.as_str(),
            old = old_scene.as_str(),
            "scene transition"
        );
        self.monitor.configure_sensors(ctx.bedroom_only_sensing());
        if new_scene.is_away() && !old_scene.is_away() {
            if !ctx.presence.pets_home_alone() {
                self.before_away_enabled = self.control_enabled;
                self.set_control_enabled_inner(false, ctx, now_ms, out);
                self.set_aircon_inner(false, ctx, now_ms, out);
                for room in Room::FAN_ROOMS {
                    if let Some(fan) = self.fans.get_mut(&room) {
                        fan.turn_off(out);
                    }
                }
            } else if let Some(fan) = self.fans.get_mut(&Room::Nursery) {
                fan.turn_off(out);
            }
            for room in Room::HEATER_ROOMS {
                if let Some(heater) = self.heaters.get_mut(&room) {
                    heater.turn_off(out);
                }
            }
        } else if !new_scene.is_away() && old_scene.is_away() {
            if self.control_enabled && self.aircon_on && ctx.presence.is_door_open() {
                self.set_aircon_inner(false, ctx, now_ms, out);
            }
            self.set_control_enabled_inner(self.before_away_enabled, ctx, now_ms, out);
        }
        if self.control_enabled || !self.suggested {
            self.handle_temperatures_inner(ctx, now_ms, out);
        }
        if self.aircon_on {
            self.set_aircon_inner(true, ctx, now_ms, out);
        } else if !self.control_enabled
            && (matches!(
                (new_scene, old_scene),
                (Scene::Day, Scene::Sleep) | (Scene::Day, Scene::Morning) | (Scene::Night, Scene::Day)
            ) || (!new_scene.is_away() && old_scene.is_away())
                || ctx.presence.pets_home_alone())
        {
            self.suggest_if_forecast_triggers(ctx, out);
        }
        let bedroom_ignore = self.should_bedroom_fan_ignore_vacancy(ctx);
        self.set_fan_ignore_vacancy(Room::Bedroom, bedroom_ignore, now_ms, out);
    }

    fn suggest_if_forecast_triggers(&mut self, ctx: &EngineCtx, out: &mut Vec<Action>) {
        // Forecast suggestions may fire once per qualifying transition, so
        // clear the gate first.
        self.allow_suggestion();
        let thresholds = self.active(ctx);
        if let Some(forecast) = self.monitor.forecast_trigger(&thresholds) {
            self.suggest(
                format!("It's forecast to reach {forecast:.1}º, consider enabling climate control"),
                out,
            );
        }
    }

    fn validate_setting_inner(
        &mut self,
        key: ThresholdKey,
        sleep: bool,
        ctx: &EngineCtx,
        now_ms: u64,
        out: &mut Vec<Action>,
    ) {
        self.settings.validate_pair(key, sleep);
        self.reset_inner(ctx, now_ms, out);
    }

    fn reset_inner(&mut self, ctx: &EngineCtx, now_ms: u64, out: &mut Vec<Action>) {
        self.monitor.configure_sensors(ctx.bedroom_only_sensing());
        let on = self.aircon_on;
        self.set_aircon_inner(on, ctx, now_ms, out);
        self.handle_temperatures_inner(ctx, now_ms, out);
    }

    fn reconfigure_door_listener(&mut self, ctx: &EngineCtx, out: &mut Vec<Action>) {
        if self.door_timer_pending {
            out.push(Action::CancelTimer {
                kind: TimerKind::DoorOpen,
            });
            self.door_timer_pending = false;
        }
        if ctx.presence.is_door_open() {
            out.push(Action::StartTimer {
                kind: TimerKind::DoorOpen,
                delay_ms: self.door_check_delay_ms(),
            });
            self.door_timer_pending = true;
        }
    }

    /// (Re-)register a vacancy watch per fan room. Registration is always
    /// preceded by cancellation of the previous watch.
    fn configure_fan_presence(&mut self, ctx: &EngineCtx, out: &mut Vec<Action>) {
        let delay_ms = self.fan_vacating_delay_ms();
        for room in Room::FAN_ROOMS {
            if let Some(id) = self.fan_watches.remove(&room) {
                self.watches.cancel(id, out);
            }
            let id = self.watches.register(room, delay_ms);
            self.fan_watches.insert(room, id);
            let occupied = !ctx.presence.is_room_vacant(room, delay_ms / 1000);
            if let Some(fan) = self.fans.get_mut(&room) {
                fan.set_occupied(occupied);
            }
        }
    }

    fn deliver_watch_event(
        &mut self,
        event: WatchEvent,
        _ctx: &EngineCtx,
        now_ms: u64,
        out: &mut Vec<Action>,
    ) {
        if self.fan_watches.get(&event.room) != Some(&event.id) {
            return;
        }
        let control_enabled = self.control_enabled;
        let interval = self.config.fan_adjustment_interval_ms;
        if let Some(fan) = self.fans.get_mut(&event.room) {
            fan.set_occupied(event.occupied);
            if control_enabled {
                fan.adjust(interval, now_ms, out);
            }
        }
    }

    fn should_bedroom_fan_ignore_vacancy(&self, ctx: &EngineCtx) -> bool {
        self.aircon_on
            || matches!(ctx.scenes.scene(), Scene::Sleep | Scene::Morning)
            || ctx.presence.pets_home_alone()
    }

    fn set_fan_ignore_vacancy(
        &mut self,
        room: Room,
        ignore: bool,
        now_ms: u64,
        out: &mut Vec<Action>,
    ) {
        let control_enabled = self.control_enabled;
        let interval = self.config.fan_adjustment_interval_ms;
        if let Some(fan) = self.fans.get_mut(&room) {
            fan.set_ignore_vacancy(ignore);
            if control_enabled {
                fan.adjust(interval, now_ms, out);
            }
        }
    }

    fn suggest(&mut self, message: String, out: &mut Vec<Action>) {
        if self.suggested {
            return;
        }
        self.suggested = true;
        out.push(Action::Notify(Notification::new(
            message,
            NotifyTarget::AnyoneHomeElseAll,
        )));
    }

    fn allow_suggestion(&mut self) {
        if self.suggested {
            self.suggested = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{PresenceView, SceneView};
    use pretty_assertions::assert_eq;

    struct TestScenes {
        scene: Scene,
        bed_time: bool,
        pre_sleep: bool,
    }

    impl Default for TestScenes {
        fn default() -> Self {
            Self {
                scene: Scene::Day,
                bed_time: false,
                pre_sleep: false,
            }
        }
    }

    impl SceneView for TestScenes {
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

    #[derive(Default)]
    struct TestPresence {
        anyone_home: bool,
        door_open: bool,
        pets_home_alone: bool,
        occupied: Vec<Room>,
    }

    impl PresenceView for TestPresence {
        fn anyone_home(&self) -> bool {
            self.anyone_home
        }
        fn is_door_open(&self) -> bool {
            self.door_open
        }
        fn pets_home_alone(&self) -> bool {
            self.pets_home_alone
        }
        fn is_room_vacant(&self, room: Room, _for_secs: u64) -> bool {
            !self.occupied.contains(&room)
        }
    }

    fn engine(control_enabled: bool) -> ClimateEngine {
        ClimateEngine::new(
            ClimateConfig::default(),
            ThresholdSettings::default(),
            control_enabled,
            false,
        )
    }

    fn notifications(actions: &[Action]) -> Vec<&Notification> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Notify(notification) => Some(notification),
                _ => None,
            })
            .collect()
    }

    fn commands(actions: &[Action]) -> Vec<&crate::types::Command> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Device(command) => Some(command),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn redundant_aircon_on_disables_control_and_records_override() {
        let scenes = TestScenes::default();
        let presence = TestPresence {
            anyone_home: true,
            ..TestPresence::default()
        };
        let ctx = EngineCtx {
            scenes: &scenes,
            presence: &presence,
        };
        let mut engine = engine(true);
        engine.handle_sensor_temperature(Room::Bedroom, Some(22.0), &ctx, 0);

        let actions = engine.set_aircon(true, &ctx, 1_000);
        assert!(!engine.control_enabled());
        assert!(engine.is_overridden());
        assert!(engine.aircon_on());
        let notes = notifications(&actions);
        assert_eq!(notes.len(), 1);
        assert!(notes[0].message.contains("within the desired temperature range"));

        // A subsequent direct toggle supersedes the protective override.
        engine.set_aircon(false, &ctx, 2_000);
        assert!(engine.control_enabled());
        assert!(!engine.is_overridden());
    }

    #[test]
    fn override_expires_silently_after_threshold() {
        let scenes = TestScenes::default();
        let presence = TestPresence::default();
        let ctx = EngineCtx {
            scenes: &scenes,
            presence: &presence,
        };
        let mut engine = engine(true);
        engine.handle_sensor_temperature(Room::Bedroom, Some(22.0), &ctx, 0);
        engine.set_aircon(true, &ctx, 1_000);
        assert!(engine.is_overridden());

        // Well past the expiry window, a control toggle clears the flag
        // without re-enabling anything extra.
        engine.set_control_enabled(false, &ctx, 2_000_000);
        assert!(!engine.is_overridden());
        assert!(!engine.control_enabled());
    }

    #[test]
    fn crossing_the_high_trigger_turns_aircon_on_in_cool_mode() {
        let scenes = TestScenes::default();
        let presence = TestPresence::default();
        let ctx = EngineCtx {
            scenes: &scenes,
            presence: &presence,
        };
        let mut settings = ThresholdSettings {
            heating_target: 20.0,
            cooling_target: 25.0,
            high_trigger: 25.0,
            ..ThresholdSettings::default()
        };
        settings.sanitize();
        let mut engine =
            ClimateEngine::new(ClimateConfig::default(), settings, true, false);

        let actions = engine.handle_sensor_temperature(Room::Bedroom, Some(24.9), &ctx, 0);
        assert!(commands(&actions).is_empty());
        assert!(!engine.aircon_on());

        let actions = engine.handle_sensor_temperature(Room::Bedroom, Some(25.1), &ctx, 1_000);
        assert!(engine.aircon_on());
        assert!(engine.control_enabled());
        assert!(commands(&actions).contains(&&crate::types::Command::AirconMode {
            zone: Room::Bedroom,
            mode: HvacMode::Cool
        }));
    }

    #[test]
    fn unchanged_fused_temperature_does_not_re_evaluate() {
        let scenes = TestScenes::default();
        let presence = TestPresence::default();
        let ctx = EngineCtx {
            scenes: &scenes,
            presence: &presence,
        };
        let mut engine = engine(true);
        engine.handle_sensor_temperature(Room::Bedroom, Some(30.0), &ctx, 0);
        assert!(engine.aircon_on());

        // Same rounded value again: no commands, no notifications.
        let actions = engine.handle_sensor_temperature(Room::Bedroom, Some(30.04), &ctx, 1_000);
        assert!(actions.is_empty());
    }

    #[test]
    fn absent_reading_is_ignored() {
        let scenes = TestScenes::default();
        let presence = TestPresence::default();
        let ctx = EngineCtx {
            scenes: &scenes,
            presence: &presence,
        };
        let mut engine = engine(true);
        let actions = engine.handle_sensor_temperature(Room::Bedroom, None, &ctx, 0);
        assert!(actions.is_empty());
        assert_eq!(engine.monitor().inside_temperature(), None);
    }

    #[test]
    fn consecutive_too_cold_evaluations_notify_once() {
        let scenes = TestScenes::default();
        let presence = TestPresence {
            anyone_home: true,
            ..TestPresence::default()
        };
        let ctx = EngineCtx {
            scenes: &scenes,
            presence: &presence,
        };
        let mut engine = engine(false);
        let first = engine.handle_sensor_temperature(Room::Bedroom, Some(13.0), &ctx, 0);
        let second = engine.handle_sensor_temperature(Room::Bedroom, Some(12.8), &ctx, 1_000);
        assert_eq!(notifications(&first).len(), 1);
        assert!(notifications(&second).is_empty());
        assert!(engine.suggestion_pending());
    }

    #[test]
    fn entering_away_turns_everything_off_and_leaving_restores_control() {
        let day = TestScenes::default();
        let away = TestScenes {
            scene: Scene::AwayDay,
            ..TestScenes::default()
        };
        let presence = TestPresence::default();
        let mut engine = engine(true);

        // Warm enough that aircon is running before everyone leaves.
        {
            let ctx = EngineCtx {
                scenes: &day,
                presence: &presence,
            };
            engine.handle_sensor_temperature(Room::Bedroom, Some(30.0), &ctx, 0);
            assert!(engine.aircon_on());
        }

        let ctx = EngineCtx {
            scenes: &away,
            presence: &presence,
        };
        let actions = engine.handle_scene_transition(Scene::AwayDay, Scene::Day, &ctx, 10_000);
        assert!(!engine.aircon_on());
        assert!(!engine.control_enabled());
        assert!(commands(&actions)
            .iter()
            .any(|command| matches!(command, crate::types::Command::AirconOff { .. })));

        let ctx = EngineCtx {
            scenes: &day,
            presence: &presence,
        };
        engine.handle_scene_transition(Scene::Day, Scene::AwayDay, &ctx, 20_000);
        assert!(engine.control_enabled());
    }

    #[test]
    fn away_round_trip_preserves_disabled_control_too() {
        let day = TestScenes::default();
        let away = TestScenes {
            scene: Scene::AwayNight,
            ..TestScenes::default()
        };
        let presence = TestPresence::default();
        let mut engine = engine(false);
        {
            let ctx = EngineCtx {
                scenes: &away,
                presence: &presence,
            };
            engine.handle_scene_transition(Scene::AwayNight, Scene::Night, &ctx, 0);
        }
        let ctx = EngineCtx {
            scenes: &day,
            presence: &presence,
        };
        engine.handle_scene_transition(Scene::Day, Scene::AwayNight, &ctx, 1_000);
        assert!(!engine.control_enabled());
    }

    #[test]
    fn forecast_suggestion_fires_on_attention_worthy_transition() {
        let night = TestScenes {
            scene: Scene::Night,
            ..TestScenes::default()
        };
        let presence = TestPresence {
            anyone_home: true,
            ..TestPresence::default()
        };
        let ctx = EngineCtx {
            scenes: &night,
            presence: &presence,
        };
        let mut engine = engine(false);
        engine.handle_sensor_temperature(Room::Bedroom, Some(22.0), &ctx, 0);
        for (hour, value) in [(2u8, 18.0), (4, 22.0), (6, 30.0), (8, 16.0)] {
            engine.record_forecast(hour, value);
        }
        let actions = engine.handle_scene_transition(Scene::Night, Scene::Day, &ctx, 1_000);
        let notes = notifications(&actions);
        assert_eq!(notes.len(), 1);
        assert!(notes[0].message.contains("forecast to reach 30.0"));
    }

    #[test]
    fn sleep_scene_runs_bedroom_unit_only() {
        let sleep = TestScenes {
            scene: Scene::Sleep,
            ..TestScenes::default()
        };
        let presence = TestPresence::default();
        let ctx = EngineCtx {
            scenes: &sleep,
            presence: &presence,
        };
        let mut engine = engine(false);
        // Sleep settings apply: sleep cooling target 24, high trigger 27.
        engine.handle_sensor_temperature(Room::Bedroom, Some(30.0), &ctx, 0);
        let actions = engine.set_aircon(true, &ctx, 1_000);
        let cmds = commands(&actions);
        assert!(cmds.contains(&&crate::types::Command::AirconMode {
            zone: Room::Bedroom,
            mode: HvacMode::Cool
        }));
        assert!(cmds.contains(&&crate::types::Command::AirconFan {
            zone: Room::Bedroom,
            mode: AirconFanMode::Low
        }));
        assert!(!cmds
            .iter()
            .any(|command| matches!(command, crate::types::Command::AirconMode { zone, .. } if *zone != Room::Bedroom)));
    }

    #[test]
    fn sustained_open_door_cuts_aircon_off() {
        let scenes = TestScenes::default();
        let presence = TestPresence {
            anyone_home: true,
            ..TestPresence::default()
        };
        let ctx = EngineCtx {
            scenes: &scenes,
            presence: &presence,
        };
        let mut engine = engine(false);
        engine.handle_sensor_temperature(Room::Bedroom, Some(30.0), &ctx, 0);
        engine.set_aircon(true, &ctx, 1_000);
        assert!(engine.aircon_on());

        let actions = engine.handle_door_changed(true, &ctx, 2_000);
        assert_eq!(
            actions,
            vec![Action::StartTimer {
                kind: TimerKind::DoorOpen,
                delay_ms: 120_000
            }]
        );

        let actions = engine.handle_timer(TimerKind::DoorOpen, &ctx, 130_000);
        assert!(!engine.aircon_on());
        let notes = notifications(&actions);
        assert!(notes
            .iter()
            .any(|note| note.message.contains("kitchen door is open")));
    }

    #[test]
    fn closing_the_door_cancels_the_pending_check() {
        let scenes = TestScenes::default();
        let presence = TestPresence::default();
        let ctx = EngineCtx {
            scenes: &scenes,
            presence: &presence,
        };
        let mut engine = engine(false);
        engine.handle_door_changed(true, &ctx, 0);
        let actions = engine.handle_door_changed(false, &ctx, 5_000);
        assert!(actions.contains(&Action::CancelTimer {
            kind: TimerKind::DoorOpen
        }));
    }

    #[test]
    fn cold_nursery_heater_engages_when_occupied() {
        let scenes = TestScenes::default();
        let presence = TestPresence {
            anyone_home: true,
            occupied: vec![Room::Nursery],
            ..TestPresence::default()
        };
        let ctx = EngineCtx {
            scenes: &scenes,
            presence: &presence,
        };
        let mut engine = engine(true);
        let actions = engine.handle_sensor_temperature(Room::Nursery, Some(15.0), &ctx, 0);
        assert!(commands(&actions).contains(&&crate::types::Command::HeaterOn {
            room: Room::Nursery
        }));
        // Still cold on the next evaluation: the wrapper is idempotent.
        let actions = engine.handle_sensor_temperature(Room::Bedroom, Some(26.0), &ctx, 1_000);
        assert!(!commands(&actions).contains(&&crate::types::Command::HeaterOn {
            room: Room::Nursery
        }));
    }

    #[test]
    fn heater_on_during_away_is_forced_off() {
        let away = TestScenes {
            scene: Scene::AwayDay,
            ..TestScenes::default()
        };
        let presence = TestPresence::default();
        let ctx = EngineCtx {
            scenes: &away,
            presence: &presence,
        };
        let mut engine = engine(true);
        engine.sync_heater_state(Room::Office, true);
        engine.monitor.record_temperature(Room::Bedroom, 22.0);
        let actions = engine.handle_temperatures(&ctx, 0);
        assert!(commands(&actions).contains(&&crate::types::Command::HeaterOff {
            room: Room::Office
        }));
    }

    #[test]
    fn threshold_edit_validates_pair_and_resets() {
        let scenes = TestScenes::default();
        let presence = TestPresence::default();
        let ctx = EngineCtx {
            scenes: &scenes,
            presence: &presence,
        };
        let mut engine = engine(false);
        engine.update_setting("cooling_target_temperature", 32.0, &ctx, 0);
        assert_eq!(engine.settings().cooling_target, 32.0);
        // high trigger was 28, forced up to match the edited target
        assert_eq!(engine.settings().high_trigger, 32.0);
    }

    #[test]
    fn shutdown_cancels_registered_watches_and_timers() {
        let scenes = TestScenes::default();
        let presence = TestPresence {
            occupied: vec![Room::Office],
            ..TestPresence::default()
        };
        let ctx = EngineCtx {
            scenes: &scenes,
            presence: &presence,
        };
        let mut engine = engine(true);
        engine.initialize(&ctx);
        // Vacating the office schedules a delayed vacancy timer.
        let actions = engine.handle_room_presence(Room::Office, false, &ctx, 1_000);
        assert!(actions
            .iter()
            .any(|action| matches!(action, Action::StartTimer { kind: TimerKind::Vacancy(_), .. })));

        let actions = engine.shutdown();
        assert!(actions
            .iter()
            .any(|action| matches!(action, Action::CancelTimer { kind: TimerKind::Vacancy(_) })));
    }

    #[test]
    fn fan_speed_scales_with_degrees_above_cooling_target() {
        let scenes = TestScenes::default();
        let presence = TestPresence {
            anyone_home: true,
            occupied: vec![Room::Bedroom, Room::Office, Room::Nursery],
            ..TestPresence::default()
        };
        let ctx = EngineCtx {
            scenes: &scenes,
            presence: &presence,
        };
        let mut engine = engine(true);
        engine.initialize(&ctx);
        // 26.5 is 1.5º above the cooling target: two steps of 25% each.
        let actions = engine.handle_sensor_temperature(Room::Bedroom, Some(26.5), &ctx, 0);
        assert!(commands(&actions).contains(&&crate::types::Command::FanOn {
            room: Room::Bedroom,
            percent: 50
        }));
    }
}
