//! Event types broadcast to host UIs.
//!
//! | Event | Source |
//! |-------|--------|
//! | `LevelEvent` | `LiveMonitor` tick |
//! | `RecorderStatusEvent` | capture engine lifecycle |
//! | `PlaybackEvent` | player state transitions |
//!
//! All types serialize with camelCase field names.

use serde::{Deserialize, Serialize};

use crate::capture::RecorderStatus;
use crate::playback::PlaybackState;

/// One monitor sample: live volume plus the derived display state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelEvent {
    /// Monotonically increasing sample sequence number.
    pub seq: u64,
    /// Latest frame peak in [0.0, 1.0].
    pub volume: f32,
    /// Highest volume since the last peak reset.
    pub max_volume: f32,
    /// Percentage of samples at the maximum, one decimal (e.g. `"100.0"`).
    pub percent_peaks_at_max: String,
    /// Formatted elapsed time, e.g. `"00:03.2"`.
    pub current_time: String,
}

/// Emitted when the capture pipeline's readiness changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderStatusEvent {
    pub status: RecorderStatus,
    /// Optional human-readable detail (e.g. the stream error).
    pub detail: Option<String>,
}

/// Emitted on player state transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackEvent {
    pub state: PlaybackState,
    /// Playback position in seconds at the time of the event.
    pub position: f64,
    /// Optional detail (e.g. the store error that ended a run early).
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_event_serializes_with_camel_case_fields() {
        let event = LevelEvent {
            seq: 3,
            volume: 0.25,
            max_volume: 0.5,
            percent_peaks_at_max: "66.7".into(),
            current_time: "00:12.3".into(),
        };

        let json = serde_json::to_value(&event).expect("serialize level event");
        assert_eq!(json["seq"], 3);
        let volume = json["volume"].as_f64().expect("volume is a number");
        assert!((volume - 0.25).abs() < 1e-6);
        assert_eq!(json["maxVolume"], 0.5);
        assert_eq!(json["percentPeaksAtMax"], "66.7");
        assert_eq!(json["currentTime"], "00:12.3");

        let round_trip: LevelEvent =
            serde_json::from_value(json).expect("deserialize level event");
        assert_eq!(round_trip.seq, 3);
        assert_eq!(round_trip.percent_peaks_at_max, "66.7");
    }

    #[test]
    fn recorder_status_event_round_trips() {
        let event = RecorderStatusEvent {
            status: RecorderStatus::NoMicrophone,
            detail: Some("access denied".into()),
        };

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["status"], "noMicrophone");
        assert_eq!(json["detail"], "access denied");

        let round_trip: RecorderStatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip.status, RecorderStatus::NoMicrophone);
    }

    #[test]
    fn playback_event_serializes_state_lowercase() {
        let event = PlaybackEvent {
            state: PlaybackState::Paused,
            position: 1.5,
            detail: None,
        };

        let json = serde_json::to_value(&event).expect("serialize playback event");
        assert_eq!(json["state"], "paused");
        assert_eq!(json["position"], 1.5);
        assert_eq!(json["detail"], serde_json::Value::Null);
    }
}
