//! Reading and device-type model shared by collectors, the store and the
//! registry.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Kinds of devices collectors know how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    HueSensor,
    NestThermostat,
    WeatherApi,
    AlexaAqm,
    AmazonAqm,
}

impl DeviceType {
    pub const ALL: [Self; 5] = [
        Self::HueSensor,
        Self::NestThermostat,
        Self::WeatherApi,
        Self::AlexaAqm,
        Self::AmazonAqm,
    ];

    /// Stable identifier stored in the database and registry.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HueSensor => "hue_sensor",
            Self::NestThermostat => "nest_thermostat",
            Self::WeatherApi => "weather_api",
            Self::AlexaAqm => "alexa_aqm",
            Self::AmazonAqm => "amazon_aqm",
        }
    }

    /// Human label used when inferring display names.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::HueSensor => "Sensor",
            Self::NestThermostat => "Thermostat",
            Self::WeatherApi => "Weather",
            Self::AlexaAqm | Self::AmazonAqm => "Air Quality Monitor",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!(
                    "unknown device type: {s}. Expected one of: hue_sensor, nest_thermostat, weather_api, alexa_aqm, amazon_aqm"
                )
            })
    }
}

/// One observation from one device at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub temperature_celsius: f64,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub device_type: DeviceType,
    #[serde(default)]
    pub humidity_percent: Option<f64>,
    #[serde(default)]
    pub pm25_ugm3: Option<f64>,
    #[serde(default)]
    pub voc_ppb: Option<f64>,
    #[serde(default)]
    pub co_ppm: Option<f64>,
    #[serde(default)]
    pub co2_ppm: Option<f64>,
    #[serde(default)]
    pub iaq_score: Option<f64>,
    #[serde(default)]
    pub battery_level: Option<i64>,
    #[serde(default)]
    pub signal_strength: Option<i64>,
    #[serde(default)]
    pub thermostat_mode: Option<String>,
    #[serde(default)]
    pub thermostat_state: Option<String>,
    #[serde(default)]
    pub raw_response: Option<String>,
    /// Set by the store on insert; ignored on the way in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Reading {
    #[must_use]
    pub fn new(
        device_id: impl Into<String>,
        device_type: DeviceType,
        timestamp: DateTime<Utc>,
        temperature_celsius: f64,
    ) -> Self {
        Self {
            timestamp,
            device_id: device_id.into(),
            temperature_celsius,
            location: None,
            name: None,
            device_type,
            humidity_percent: None,
            pm25_ugm3: None,
            voc_ppb: None,
            co_ppm: None,
            co2_ppm: None,
            iaq_score: None,
            battery_level: None,
            signal_strength: None,
            thermostat_mode: None,
            thermostat_state: None,
            raw_response: None,
            created_at: None,
        }
    }

    #[must_use]
    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn humidity(mut self, percent: f64) -> Self {
        self.humidity_percent = Some(percent);
        self
    }

    #[must_use]
    pub fn air_quality(
        mut self,
        pm25_ugm3: Option<f64>,
        voc_ppb: Option<f64>,
        co_ppm: Option<f64>,
        co2_ppm: Option<f64>,
        iaq_score: Option<f64>,
    ) -> Self {
        self.pm25_ugm3 = pm25_ugm3;
        self.voc_ppb = voc_ppb;
        self.co_ppm = co_ppm;
        self.co2_ppm = co2_ppm;
        self.iaq_score = iaq_score;
        self
    }

    #[must_use]
    pub fn battery(mut self, level: i64) -> Self {
        self.battery_level = Some(level);
        self
    }

    #[must_use]
    pub fn signal(mut self, strength: i64) -> Self {
        self.signal_strength = Some(strength);
        self
    }

    #[must_use]
    pub fn thermostat(mut self, mode: impl Into<String>, state: impl Into<String>) -> Self {
        self.thermostat_mode = Some(mode.into());
        self.thermostat_state = Some(state.into());
        self
    }

    #[must_use]
    pub fn raw_response(mut self, raw: impl Into<String>) -> Self {
        self.raw_response = Some(raw.into());
        self
    }

    /// Canonical text form of the timestamp used as part of the unique key.
    ///
    /// Fixed-width UTC with microseconds: two readings for the same instant
    /// always produce the same string, and lexical order is time order.
    #[must_use]
    pub fn timestamp_key(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Range-check every field the store constrains.
    ///
    /// Collectors may call this to reject early; the store enforces the same
    /// ranges with CHECK constraints regardless.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.device_id.trim().is_empty() {
            problems.push("device_id is empty".to_string());
        }
        check_range(&mut problems, "temperature_celsius", Some(self.temperature_celsius), -40.0, 50.0);
        check_range(&mut problems, "humidity_percent", self.humidity_percent, 0.0, 100.0);
        check_min(&mut problems, "pm25_ugm3", self.pm25_ugm3);
        check_min(&mut problems, "voc_ppb", self.voc_ppb);
        check_min(&mut problems, "co_ppm", self.co_ppm);
        check_min(&mut problems, "co2_ppm", self.co2_ppm);
        check_range(&mut problems, "iaq_score", self.iaq_score, 0.0, 100.0);
        check_range(&mut problems, "battery_level", self.battery_level.map(|v| v as f64), 0.0, 100.0);
        check_range(&mut problems, "signal_strength", self.signal_strength.map(|v| v as f64), 0.0, 100.0);

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidReading(format!(
                "{} at {}: {}",
                self.device_id,
                self.timestamp_key(),
                problems.join(", ")
            )))
        }
    }

    /// Whether the reading is worth an operator's attention.
    #[must_use]
    pub fn is_anomalous(&self) -> bool {
        let t = self.temperature_celsius;
        t < 5.0
            || t > 35.0
            || self.co2_ppm.is_some_and(|v| v > 2000.0)
            || self.pm25_ugm3.is_some_and(|v| v > 35.0)
            || self.co_ppm.is_some_and(|v| v > 9.0)
            || self.iaq_score.is_some_and(|v| v < 30.0)
            || self.battery_level.is_some_and(|v| v < 10)
    }
}

fn check_range(problems: &mut Vec<String>, field: &str, value: Option<f64>, min: f64, max: f64) {
    if let Some(v) = value {
        if !(min..=max).contains(&v) {
            problems.push(format!("{field}={v} outside [{min}, {max}]"));
        }
    }
}

fn check_min(problems: &mut Vec<String>, field: &str, value: Option<f64>) {
    if let Some(v) = value {
        if !(v >= 0.0) {
            problems.push(format!("{field}={v} is negative"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn device_type_roundtrip_and_labels() {
        for t in DeviceType::ALL {
            assert_eq!(t.as_str().parse::<DeviceType>().unwrap(), t);
        }
        assert_eq!(DeviceType::HueSensor.label(), "Sensor");
        assert_eq!(DeviceType::NestThermostat.label(), "Thermostat");
        assert_eq!(DeviceType::AmazonAqm.label(), "Air Quality Monitor");
        assert!("toaster".parse::<DeviceType>().is_err());
    }

    #[test]
    fn device_type_serde_is_snake_case() {
        let json = serde_json::to_string(&DeviceType::NestThermostat).unwrap();
        assert_eq!(json, "\"nest_thermostat\"");
    }

    #[test]
    fn valid_reading_passes() {
        let r = Reading::new("hue:1", DeviceType::HueSensor, ts(), 21.5)
            .location("Hall")
            .humidity(40.0)
            .battery(80);
        assert!(r.validate().is_ok());
        assert!(!r.is_anomalous());
    }

    #[test]
    fn out_of_range_fields_are_all_reported() {
        let mut r = Reading::new("hue:1", DeviceType::HueSensor, ts(), 55.0).humidity(120.0);
        r.co2_ppm = Some(-1.0);
        let err = r.validate().unwrap_err().to_string();
        assert!(err.contains("temperature_celsius=55"));
        assert!(err.contains("humidity_percent=120"));
        assert!(err.contains("co2_ppm=-1"));
    }

    #[test]
    fn nan_is_rejected() {
        let r = Reading::new("hue:1", DeviceType::HueSensor, ts(), f64::NAN);
        assert!(r.validate().is_err());
    }

    #[test]
    fn anomaly_thresholds() {
        assert!(Reading::new("a", DeviceType::WeatherApi, ts(), -5.0).is_anomalous());
        let mut r = Reading::new("b", DeviceType::AlexaAqm, ts(), 21.0);
        r.co2_ppm = Some(2500.0);
        assert!(r.is_anomalous());
        let low_battery = Reading::new("c", DeviceType::HueSensor, ts(), 21.0).battery(5);
        assert!(low_battery.is_anomalous());
    }

    #[test]
    fn timestamp_key_is_canonical_utc() {
        let parsed: DateTime<Utc> = DateTime::parse_from_rfc3339("2025-01-15T13:00:00+01:00")
            .unwrap()
            .with_timezone(&Utc);
        let r = Reading::new("a", DeviceType::HueSensor, parsed, 20.0);
        assert_eq!(r.timestamp_key(), "2025-01-15T12:00:00.000000Z");
    }

    #[test]
    fn deserializes_minimal_json() {
        let r: Reading = serde_json::from_str(
            r#"{"timestamp":"2025-01-15T12:00:00Z","device_id":"nest:1","temperature_celsius":19.5,"device_type":"nest_thermostat"}"#,
        )
        .unwrap();
        assert_eq!(r.device_type, DeviceType::NestThermostat);
        assert!(r.location.is_none());
    }
}
