use serde::{Deserialize, Serialize};
use tracing::warn;

/// Static tuning knobs, as opposed to the user-editable [`ThresholdSettings`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClimateConfig {
    /// How long a protective override of climate control lasts before it
    /// silently expires.
    pub override_expiry_ms: u64,
    /// Number of discrete ceiling fan speed steps (100% / levels per step).
    pub fan_speed_levels: u8,
    /// Minimum interval between physical ceiling fan adjustments.
    pub fan_adjustment_interval_ms: u64,
    /// Offset applied to the aircon setpoint past the target (heat: above,
    /// cool: below) so units keep running until the target is reached.
    pub target_buffer: f64,
    /// How much nicer outside must be than inside before opening up the
    /// house beats running the aircon.
    pub inside_outside_delta: f64,
    /// Hysteresis band around the heating target for room heaters.
    pub heater_buffer: f64,
    /// How long a room must be empty before its heater treats it as vacant.
    pub heater_vacancy_secs: u64,
}

impl Default for ClimateConfig {
    fn default() -> Self {
        Self {
            override_expiry_ms: 600_000,
            fan_speed_levels: 4,
            fan_adjustment_interval_ms: 120_000,
            target_buffer: 1.0,
            inside_outside_delta: 2.0,
            heater_buffer: 2.0,
            heater_vacancy_secs: 300,
        }
    }
}

/// One of the four user-editable temperature thresholds. Each has a sleep
/// variant substituted while the Sleep scene is active or it is past bed
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdKey {
    HeatingTarget,
    CoolingTarget,
    LowTrigger,
    HighTrigger,
}

impl ThresholdKey {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HeatingTarget => "heating_target_temperature",
            Self::CoolingTarget => "cooling_target_temperature",
            Self::LowTrigger => "low_temperature_aircon_trigger",
            Self::HighTrigger => "high_temperature_aircon_trigger",
        }
    }
}

/// A recognised user setting name, e.g. `sleep_cooling_target_temperature`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingName {
    Threshold { key: ThresholdKey, sleep: bool },
    DoorCheckDelay,
    FanVacatingDelay,
}

impl SettingName {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "aircon_door_check_delay" => return Some(Self::DoorCheckDelay),
            "fan_vacating_delay" => return Some(Self::FanVacatingDelay),
            _ => {}
        }
        let (sleep, base) = match name.strip_prefix("sleep_") {
            Some(base) => (true, base),
            None => (false, name),
        };
        let key = match base {
            "heating_target_temperature" => ThresholdKey::HeatingTarget,
            "cooling_target_temperature" => ThresholdKey::CoolingTarget,
            "low_temperature_aircon_trigger" => ThresholdKey::LowTrigger,
            "high_temperature_aircon_trigger" => ThresholdKey::HighTrigger,
            _ => return None,
        };
        Some(Self::Threshold { key, sleep })
    }
}

/// The thresholds resolved for the current scene: the target band governs
/// actuation, the wider trigger band governs suggestions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveThresholds {
    pub heating_target: f64,
    pub cooling_target: f64,
    pub low_trigger: f64,
    pub high_trigger: f64,
}

/// User-editable settings, persisted by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSettings {
    pub heating_target: f64,
    pub cooling_target: f64,
    pub low_trigger: f64,
    pub high_trigger: f64,
    pub sleep_heating_target: f64,
    pub sleep_cooling_target: f64,
    pub sleep_low_trigger: f64,
    pub sleep_high_trigger: f64,
    pub door_check_delay_mins: f64,
    pub fan_vacating_delay_mins: f64,
}

impl Default for ThresholdSettings {
    fn default() -> Self {
        Self {
            heating_target: 20.0,
            cooling_target: 25.0,
            low_trigger: 14.0,
            high_trigger: 28.0,
            sleep_heating_target: 18.0,
            sleep_cooling_target: 24.0,
            sleep_low_trigger: 13.0,
            sleep_high_trigger: 27.0,
            door_check_delay_mins: 2.0,
            fan_vacating_delay_mins: 5.0,
        }
    }
}

impl ThresholdSettings {
    pub fn sanitize(&mut self) {
        for value in [
            &mut self.heating_target,
            &mut self.cooling_target,
            &mut self.low_trigger,
            &mut self.high_trigger,
            &mut self.sleep_heating_target,
            &mut self.sleep_cooling_target,
            &mut self.sleep_low_trigger,
            &mut self.sleep_high_trigger,
        ] {
            *value = value.clamp(5.0, 40.0);
        }
        self.door_check_delay_mins = self.door_check_delay_mins.clamp(0.0, 60.0);
        self.fan_vacating_delay_mins = self.fan_vacating_delay_mins.clamp(0.0, 120.0);
    }

    pub fn get(&self, key: ThresholdKey, sleep: bool) -> f64 {
        match (key, sleep) {
            (ThresholdKey::HeatingTarget, false) => self.heating_target,
            (ThresholdKey::CoolingTarget, false) => self.cooling_target,
            (ThresholdKey::LowTrigger, false) => self.low_trigger,
            (ThresholdKey::HighTrigger, false) => self.high_trigger,
            (ThresholdKey::HeatingTarget, true) => self.sleep_heating_target,
            (ThresholdKey::CoolingTarget, true) => self.sleep_cooling_target,
            (ThresholdKey::LowTrigger, true) => self.sleep_low_trigger,
            (ThresholdKey::HighTrigger, true) => self.sleep_high_trigger,
        }
    }

    pub fn set(&mut self, key: ThresholdKey, sleep: bool, value: f64) {
        let slot = match (key, sleep) {
            (ThresholdKey::HeatingTarget, false) => &mut self.heating_target,
            (ThresholdKey::CoolingTarget, false) => &mut self.cooling_target,
            (ThresholdKey::LowTrigger, false) => &mut self.low_trigger,
            (ThresholdKey::HighTrigger, false) => &mut self.high_trigger,
            (ThresholdKey::HeatingTarget, true) => &mut self.sleep_heating_target,
            (ThresholdKey::CoolingTarget, true) => &mut self.sleep_cooling_target,
            (ThresholdKey::LowTrigger, true) => &mut self.sleep_low_trigger,
            (ThresholdKey::HighTrigger, true) => &mut self.sleep_high_trigger,
        };
        *slot = value;
    }

    /// Resolve the thresholds for the current scene. The sleep variants are
    /// substituted as a set; the resolver is the only place that mapping
    /// lives.
    pub fn active(&self, sleep: bool) -> ActiveThresholds {
        ActiveThresholds {
            heating_target: self.get(ThresholdKey::HeatingTarget, sleep),
            cooling_target: self.get(ThresholdKey::CoolingTarget, sleep),
            low_trigger: self.get(ThresholdKey::LowTrigger, sleep),
            high_trigger: self.get(ThresholdKey::HighTrigger, sleep),
        }
    }

    /// Check the edited threshold against its paired setting and force the
    /// pair back into validity if the edit broke it: each target must stay
    /// inside its trigger (cooling ≤ high trigger, heating ≥ low trigger).
    /// Returns the corrected pair member, if any.
    pub fn validate_pair(&mut self, key: ThresholdKey, sleep: bool) -> Option<(ThresholdKey, f64)> {
        let value = self.get(key, sleep);
        let (other, invalid) = match key {
            ThresholdKey::CoolingTarget => (
                ThresholdKey::HighTrigger,
                value > self.get(ThresholdKey::HighTrigger, sleep),
            ),
            ThresholdKey::HeatingTarget => (
                ThresholdKey::LowTrigger,
                value < self.get(ThresholdKey::LowTrigger, sleep),
            ),
            ThresholdKey::HighTrigger => (
                ThresholdKey::CoolingTarget,
                self.get(ThresholdKey::CoolingTarget, sleep) > value,
            ),
            ThresholdKey::LowTrigger => (
                ThresholdKey::HeatingTarget,
                self.get(ThresholdKey::HeatingTarget, sleep) < value,
            ),
        };
        if !invalid {
            return None;
        }
        self.set(other, sleep, value);
        warn!(
            edited = key.as_str(),
            corrected = other.as_str(),
            sleep,
            value,
            "threshold pair was inconsistent, forced the paired setting to match"
        );
        Some((other, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn resolver_substitutes_sleep_variants() {
        let settings = ThresholdSettings::default();
        let day = settings.active(false);
        let sleep = settings.active(true);
        assert_eq!(day.cooling_target, 25.0);
        assert_eq!(sleep.cooling_target, 24.0);
        assert_eq!(day.low_trigger, 14.0);
        assert_eq!(sleep.low_trigger, 13.0);
    }

    #[test]
    fn setting_names_parse() {
        assert_eq!(
            SettingName::parse("cooling_target_temperature"),
            Some(SettingName::Threshold {
                key: ThresholdKey::CoolingTarget,
                sleep: false
            })
        );
        assert_eq!(
            SettingName::parse("sleep_low_temperature_aircon_trigger"),
            Some(SettingName::Threshold {
                key: ThresholdKey::LowTrigger,
                sleep: true
            })
        );
        assert_eq!(
            SettingName::parse("aircon_door_check_delay"),
            Some(SettingName::DoorCheckDelay)
        );
        assert_eq!(SettingName::parse("sleep_mystery"), None);
    }

    #[test]
    fn cooling_target_above_trigger_pushes_trigger_up() {
        let mut settings = ThresholdSettings::default();
        settings.set(ThresholdKey::CoolingTarget, false, 30.0);
        let corrected = settings.validate_pair(ThresholdKey::CoolingTarget, false);
        assert_eq!(corrected, Some((ThresholdKey::HighTrigger, 30.0)));
        assert_eq!(settings.high_trigger, 30.0);
    }

    #[test]
    fn low_trigger_above_heating_target_pushes_target_up() {
        let mut settings = ThresholdSettings::default();
        settings.set(ThresholdKey::LowTrigger, false, 22.0);
        let corrected = settings.validate_pair(ThresholdKey::LowTrigger, false);
        assert_eq!(corrected, Some((ThresholdKey::HeatingTarget, 22.0)));
        assert_eq!(settings.heating_target, 22.0);
    }

    #[test]
    fn consistent_pair_is_untouched() {
        let mut settings = ThresholdSettings::default();
        settings.set(ThresholdKey::HeatingTarget, false, 19.0);
        assert_eq!(settings.validate_pair(ThresholdKey::HeatingTarget, false), None);
        assert_eq!(settings.low_trigger, 14.0);
    }

    #[test]
    fn sleep_pair_corrections_stay_in_sleep_variants() {
        let mut settings = ThresholdSettings::default();
        settings.set(ThresholdKey::HighTrigger, true, 20.0);
        let corrected = settings.validate_pair(ThresholdKey::HighTrigger, true);
        assert_eq!(corrected, Some((ThresholdKey::CoolingTarget, 20.0)));
        assert_eq!(settings.sleep_cooling_target, 20.0);
        assert_eq!(settings.cooling_target, 25.0);
    }

    #[test]
    fn sanitize_clamps_delays() {
        let mut settings = ThresholdSettings {
            door_check_delay_mins: -3.0,
            fan_vacating_delay_mins: 500.0,
            ..ThresholdSettings::default()
        };
        settings.sanitize();
        assert_eq!(settings.door_check_delay_mins, 0.0);
        assert_eq!(settings.fan_vacating_delay_mins, 120.0);
    }
}
