use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ActiveThresholds;
use crate::types::{HvacMode, Room};

/// Plausible range for any temperature reading this house will ever see.
const MIN_VALID_TEMP: f64 = -40.0;
const MAX_VALID_TEMP: f64 = 60.0;

#[derive(Debug, Error, PartialEq)]
pub enum ReadingError {
    #[error("value is not a number")]
    NotNumeric,
    #[error("value {0} is outside the plausible range")]
    OutOfRange(f64),
}

/// Parse a raw sensor payload into a temperature. Errors are expected to be
/// logged and the reading dropped, never defaulted.
pub fn parse_temperature(raw: &str) -> Result<f64, ReadingError> {
    let value: f64 = raw.trim().parse().map_err(|_| ReadingError::NotNumeric)?;
    if !value.is_finite() {
        return Err(ReadingError::NotNumeric);
    }
    if !(MIN_VALID_TEMP..=MAX_VALID_TEMP).contains(&value) {
        return Err(ReadingError::OutOfRange(value));
    }
    Ok(value)
}

/// Parse a raw relative humidity payload (percent).
pub fn parse_humidity(raw: &str) -> Result<f64, ReadingError> {
    let value: f64 = raw.trim().parse().map_err(|_| ReadingError::NotNumeric)?;
    if !value.is_finite() {
        return Err(ReadingError::NotNumeric);
    }
    if !(0.0..=100.0).contains(&value) {
        return Err(ReadingError::OutOfRange(value));
    }
    Ok(value)
}

/// Apparent ("feels-like") temperature from dry-bulb temperature and
/// relative humidity, without a wind term. Falls back to the plain
/// temperature when no humidity reading is available.
pub fn apparent_temperature(temperature: f64, humidity: Option<f64>) -> f64 {
    let Some(rh) = humidity else {
        return temperature;
    };
    let vapour_pressure =
        rh / 100.0 * 6.105 * f64::exp(17.27 * temperature / (237.7 + temperature));
    temperature + 0.33 * vapour_pressure - 4.0
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct IndoorSensor {
    enabled: bool,
    temperature: Option<f64>,
    humidity: Option<f64>,
}

/// Fuses indoor sensor readings into a single feels-like temperature,
/// tracks the outside estimate and short-range forecast, and answers all
/// threshold queries for the engine.
#[derive(Debug, Clone)]
pub struct TemperatureMonitor {
    sensors: BTreeMap<Room, IndoorSensor>,
    inside: Option<f64>,
    outside: Option<f64>,
    forecast: BTreeMap<u8, f64>,
}

impl Default for TemperatureMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl TemperatureMonitor {
    pub fn new() -> Self {
        let sensors = Room::SENSOR_ROOMS
            .into_iter()
            .map(|room| {
                (
                    room,
                    IndoorSensor {
                        enabled: true,
                        ..IndoorSensor::default()
                    },
                )
            })
            .collect();
        Self {
            sensors,
            inside: None,
            outside: None,
            forecast: BTreeMap::new(),
        }
    }

    /// Latest fused feels-like inside temperature, rounded to one decimal.
    pub fn inside_temperature(&self) -> Option<f64> {
        self.inside
    }

    pub fn outside_temperature(&self) -> Option<f64> {
        self.outside
    }

    /// Feels-like temperature for one room, for per-room heater decisions.
    pub fn room_apparent_temperature(&self, room: Room) -> Option<f64> {
        let sensor = self.sensors.get(&room)?;
        let temperature = sensor.temperature?;
        Some(round_tenth(apparent_temperature(temperature, sensor.humidity)))
    }

    /// Restrict sensing to the bedroom (or widen back out) and recompute.
    /// Returns whether the rounded fused value changed.
    pub fn configure_sensors(&mut self, bedroom_only: bool) -> bool {
        for (room, sensor) in &mut self.sensors {
            sensor.enabled = !bedroom_only || *room == Room::Bedroom;
        }
        debug!(bedroom_only, "reconfigured indoor sensors");
        self.recompute()
    }

    /// Record a temperature reading. Returns whether the rounded fused
    /// value changed, so callers only re-evaluate on change.
    pub fn record_temperature(&mut self, room: Room, value: f64) -> bool {
        let Some(sensor) = self.sensors.get_mut(&room) else {
            warn!(room = room.as_str(), "temperature reading for unknown sensor");
            return false;
        };
        sensor.temperature = Some(value);
        self.recompute()
    }

    pub fn record_humidity(&mut self, room: Room, value: f64) -> bool {
        let Some(sensor) = self.sensors.get_mut(&room) else {
            warn!(room = room.as_str(), "humidity reading for unknown sensor");
            return false;
        };
        sensor.humidity = Some(value);
        self.recompute()
    }

    /// Record the outside feels-like estimate. Returns whether it changed.
    pub fn record_outside(&mut self, value: f64) -> bool {
        let rounded = round_tenth(value);
        if self.outside == Some(rounded) {
            return false;
        }
        self.outside = Some(rounded);
        true
    }

    /// Record a forecast sample for the given hour offset (+2/+4/+6/+8).
    pub fn record_forecast(&mut self, hours_ahead: u8, value: f64) {
        self.forecast.insert(hours_ahead, value);
    }

    fn recompute(&mut self) -> bool {
        let enabled = self
            .sensors
            .values()
            .filter(|sensor| sensor.enabled)
            .collect::<Vec<_>>();
        let temperatures: Vec<f64> = enabled.iter().filter_map(|s| s.temperature).collect();
        let fused = if temperatures.is_empty() {
            None
        } else {
            let mean_temperature =
                temperatures.iter().sum::<f64>() / temperatures.len() as f64;
            let humidities: Vec<f64> = enabled.iter().filter_map(|s| s.humidity).collect();
            let mean_humidity = if humidities.is_empty() {
                None
            } else {
                Some(humidities.iter().sum::<f64>() / humidities.len() as f64)
            };
            Some(round_tenth(apparent_temperature(
                mean_temperature,
                mean_humidity,
            )))
        };
        if fused == self.inside {
            return false;
        }
        debug!(?fused, previous = ?self.inside, "fused inside temperature changed");
        self.inside = fused;
        true
    }

    pub fn is_above_target(&self, thresholds: &ActiveThresholds) -> bool {
        self.inside
            .is_some_and(|inside| inside > thresholds.cooling_target)
    }

    pub fn is_below_target(&self, thresholds: &ActiveThresholds) -> bool {
        self.inside
            .is_some_and(|inside| inside < thresholds.heating_target)
    }

    /// Defined as the negation of the other two predicates so the three can
    /// never drift apart.
    pub fn is_within_target(&self, thresholds: &ActiveThresholds) -> bool {
        !(self.is_above_target(thresholds) || self.is_below_target(thresholds))
    }

    /// Inside falls outside the (wider) trigger band; ties trigger. This
    /// band governs suggestions, while the target band governs actuation.
    pub fn is_too_hot_or_cold(&self, thresholds: &ActiveThresholds) -> bool {
        self.inside.is_some_and(|inside| {
            !(thresholds.low_trigger < inside && inside < thresholds.high_trigger)
        })
    }

    /// Whether outside is enough nicer than inside to prefer opening the
    /// house. With the aircon off, "nicer" means inside is uncomfortable
    /// while outside sits within the trigger band.
    pub fn is_outside_nicer(
        &self,
        thresholds: &ActiveThresholds,
        delta: f64,
        aircon_mode: HvacMode,
    ) -> bool {
        let (Some(inside), Some(outside)) = (self.inside, self.outside) else {
            return false;
        };
        let nicer = match aircon_mode {
            HvacMode::Heat => inside < outside - delta,
            HvacMode::Cool => inside > outside + delta,
            HvacMode::Off => {
                let outside_in_band = thresholds.low_trigger <= outside
                    && outside <= thresholds.high_trigger;
                self.is_too_hot_or_cold(thresholds) && outside_in_band
            }
        };
        debug!(
            inside,
            outside,
            nicer,
            mode = aircon_mode.as_str(),
            "compared outside against inside"
        );
        nicer
    }

    /// Tie-break for when inside sits between the targets: compare against
    /// the midpoint of the target band.
    pub fn closer_to_heat_or_cool(&self, thresholds: &ActiveThresholds) -> HvacMode {
        let midpoint = (thresholds.cooling_target + thresholds.heating_target) / 2.0;
        match self.inside {
            Some(inside) if inside > midpoint => HvacMode::Cool,
            _ => HvacMode::Heat,
        }
    }

    /// The most extreme forecast value if it would breach a trigger: the
    /// maximum is checked against the high trigger first, then the minimum
    /// against the low trigger. Ties count as triggering.
    pub fn forecast_trigger(&self, thresholds: &ActiveThresholds) -> Option<f64> {
        if self.forecast.is_empty() {
            return None;
        }
        let max = self.forecast.values().copied().fold(f64::MIN, f64::max);
        if max >= thresholds.high_trigger {
            return Some(max);
        }
        let min = self.forecast.values().copied().fold(f64::MAX, f64::min);
        if min <= thresholds.low_trigger {
            return Some(min);
        }
        None
    }
}
