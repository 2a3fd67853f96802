// Event stream payload decoding
//
// Pure conversion from the `data` member of a `com.simplisafe.event.standard`
// envelope into a typed `WebsocketEvent`. Codes and device types the
// tables do not know decode to `Unknown` with a warning, never an error,
// so new vendor codes do not break listeners.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Envelope `type` of domain events.
pub const EVENT_STANDARD: &str = "com.simplisafe.event.standard";

/// Envelope `type` of the identification handshake.
pub const CONNECTION_IDENTIFY: &str = "com.simplisafe.connection.identify";

// ── Envelope ─────────────────────────────────────────────────────────

/// Outer wrapper of every message on the stream.
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// `data` member of a standard event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub event_cid: u32,
    #[serde(default)]
    pub info: String,
    pub sid: u64,
    /// Epoch milliseconds.
    pub event_timestamp: i64,
    #[serde(default)]
    pub pin_name: Option<String>,
    #[serde(default)]
    pub sensor_name: Option<String>,
    #[serde(default)]
    pub sensor_serial: Option<String>,
    #[serde(default)]
    pub sensor_type: Option<u16>,
}

// ── EventType ────────────────────────────────────────────────────────

/// Category of a stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AlarmCanceled,
    AlarmTriggered,
    ArmedAway,
    ArmedAwayByKeypad,
    ArmedAwayByRemote,
    ArmedHome,
    AutomaticTest,
    AwayExitDelayByKeypad,
    AwayExitDelayByRemote,
    CameraMotionDetected,
    ConnectionLost,
    ConnectionRestored,
    DisarmedByMasterPin,
    DisarmedByRemote,
    DoorbellDetected,
    EntityTest,
    EntryDelay,
    HomeExitDelay,
    LockError,
    LockLocked,
    LockUnlocked,
    PowerOutage,
    PowerRestored,
    SecretAlertTriggered,
    SensorNotResponding,
    SensorPairedAndNamed,
    SensorRestored,
    UserInitiatedTest,
    Unknown,
}

impl EventType {
    /// Look up a vendor event code (CID).
    pub fn from_code(code: u32) -> Option<Self> {
        let event_type = match code {
            1110 | 1120 | 1132 | 1134 | 1154 | 1159 | 1162 => Self::AlarmTriggered,
            1170 => Self::CameraMotionDetected,
            1301 => Self::PowerOutage,
            1350 => Self::ConnectionLost,
            1381 => Self::SensorNotResponding,
            1400 => Self::DisarmedByMasterPin,
            1406 => Self::AlarmCanceled,
            1407 => Self::DisarmedByRemote,
            1409 => Self::SecretAlertTriggered,
            1429 => Self::EntryDelay,
            1458 => Self::DoorbellDetected,
            1531 => Self::SensorPairedAndNamed,
            1601 => Self::UserInitiatedTest,
            1602 => Self::AutomaticTest,
            1604 => Self::EntityTest,
            3301 => Self::PowerRestored,
            3350 => Self::ConnectionRestored,
            3381 => Self::SensorRestored,
            3401 => Self::ArmedAwayByKeypad,
            3407 => Self::ArmedAwayByRemote,
            3441 | 3491 => Self::ArmedHome,
            3481 | 3487 => Self::ArmedAway,
            9401 => Self::AwayExitDelayByKeypad,
            9407 => Self::AwayExitDelayByRemote,
            9441 => Self::HomeExitDelay,
            9700 => Self::LockUnlocked,
            9701 => Self::LockLocked,
            9703 => Self::LockError,
            _ => return None,
        };
        Some(event_type)
    }
}

// ── DeviceType ───────────────────────────────────────────────────────

/// Kind of sensor or device that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Remote,
    Keypad,
    Keychain,
    PanicButton,
    Motion,
    Entry,
    GlassBreak,
    CarbonMonoxide,
    Smoke,
    Leak,
    Temperature,
    Camera,
    Siren,
    SmokeAndCarbonMonoxide,
    Doorbell,
    Lock,
    OutdoorCamera,
    MotionV2,
    OutdoorAlarmSecurityBellBox,
    LockKeypad,
    Unknown,
}

impl DeviceType {
    pub fn from_code(code: u16) -> Option<Self> {
        let device_type = match code {
            0 => Self::Remote,
            1 => Self::Keypad,
            2 => Self::Keychain,
            3 => Self::PanicButton,
            4 => Self::Motion,
            5 => Self::Entry,
            6 => Self::GlassBreak,
            7 => Self::CarbonMonoxide,
            8 => Self::Smoke,
            9 => Self::Leak,
            10 => Self::Temperature,
            12 => Self::Camera,
            13 => Self::Siren,
            14 => Self::SmokeAndCarbonMonoxide,
            15 => Self::Doorbell,
            16 => Self::Lock,
            17 => Self::OutdoorCamera,
            20 => Self::MotionV2,
            22 => Self::OutdoorAlarmSecurityBellBox,
            253 => Self::LockKeypad,
            _ => return None,
        };
        Some(device_type)
    }
}

// ── WebsocketEvent ───────────────────────────────────────────────────

/// A decoded stream event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebsocketEvent {
    pub event_type: EventType,
    /// Raw vendor code, kept for events that decode to `Unknown`.
    pub event_code: u32,
    pub info: String,
    pub system_id: u64,
    pub timestamp: DateTime<Utc>,
    pub changed_by: Option<String>,
    pub sensor_name: Option<String>,
    pub sensor_serial: Option<String>,
    pub sensor_type: Option<DeviceType>,
}

/// Decode a standard event payload.
pub fn decode_event(payload: &EventPayload) -> WebsocketEvent {
    let event_type = EventType::from_code(payload.event_cid).unwrap_or_else(|| {
        warn!(
            event_cid = payload.event_cid,
            info = %payload.info,
            "unknown websocket event type"
        );
        EventType::Unknown
    });

    let sensor_type = payload.sensor_type.map(|code| {
        DeviceType::from_code(code).unwrap_or_else(|| {
            warn!(
                sensor_type = code,
                info = %payload.info,
                "unknown device type"
            );
            DeviceType::Unknown
        })
    });

    let timestamp = DateTime::from_timestamp_millis(payload.event_timestamp).unwrap_or_else(|| {
        warn!(
            event_timestamp = payload.event_timestamp,
            "event timestamp out of range"
        );
        DateTime::<Utc>::UNIX_EPOCH
    });

    WebsocketEvent {
        event_type,
        event_code: payload.event_cid,
        info: payload.info.clone(),
        system_id: payload.sid,
        timestamp,
        changed_by: payload.pin_name.clone(),
        sensor_name: payload.sensor_name.clone(),
        sensor_serial: payload.sensor_serial.clone(),
        sensor_type,
    }
}
