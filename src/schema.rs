use serde::Deserialize;

/// A single reading pushed by the pulse-oximeter sensor.
///
/// This is the wire contract with the sensor firmware. Each WebSocket
/// text frame carries exactly one JSON object of this shape:
///
/// ```text
/// { "spO2": 97, "hr": 72, "hrQuality": 88, "status": "measuring" }
/// ```
///
/// DESIGN NOTES:
/// - Validation is limited to a successful parse. Values are forwarded
///   to subscribers as-is (no range checks).
/// - Unknown fields are ignored.
/// - Older firmware omits `status`; that is `None`, not an error.
///
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    /// Blood oxygen saturation in percent
    #[serde(rename = "spO2")]
    pub spo2: f64,

    /// Heart rate in beats per minute
    pub hr: f64,

    /// Heart-rate signal quality as reported by the sensor
    pub hr_quality: f64,

    /// Finger presence / measuring tag
    #[serde(default)]
    pub status: Option<MeasurementStatus>,
}

// ------------------------------------------------------------
// Measurement status
// ------------------------------------------------------------
//
// Reported by the sensor alongside every reading.
//
// `Unknown` absorbs tags introduced by newer firmware so the
// rest of the record is still delivered.
//
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementStatus {
    NoFinger,
    Measuring,
    #[serde(other)]
    Unknown,
}

impl MeasurementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementStatus::NoFinger => "no_finger",
            MeasurementStatus::Measuring => "measuring",
            MeasurementStatus::Unknown => "unknown",
        }
    }
}
