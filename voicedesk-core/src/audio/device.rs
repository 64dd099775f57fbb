//! Audio device enumeration for both directions.

use serde::{Deserialize, Serialize};

use super::StreamDirection;

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default device for its direction.
    pub is_default: bool,
    /// Heuristic flag for inputs that likely capture system/output audio.
    pub is_loopback_like: bool,
    /// Heuristic recommendation for the best device in this direction.
    pub is_recommended: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "virtual output",
    "monitor of",
    "speakers (",
    "headphones (",
];

const MIC_POSITIVE_KEYWORDS: &[&str] = &[
    "microphone",
    "mic",
    "array",
    "headset",
    "input",
    "usb",
    "webcam",
];

const SPEAKER_POSITIVE_KEYWORDS: &[&str] = &["speaker", "headphone", "headset", "output"];

/// Best-effort heuristic for loopback/system-output capture devices.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Score a device name for the given direction. Higher is better.
///
/// Inputs penalise loopback-looking names (they would feed the agent its
/// own voice back); outputs only reward speaker-ish names.
pub fn preference_score(name: &str, direction: StreamDirection) -> i32 {
    let lowered = name.trim().to_ascii_lowercase();
    let mut score = 0;
    match direction {
        StreamDirection::Input => {
            score += if is_loopback_like_name(&lowered) { -16 } else { 8 };
            if MIC_POSITIVE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
                score += 6;
            }
        }
        StreamDirection::Output => {
            if SPEAKER_POSITIVE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
                score += 6;
            }
        }
    }
    if lowered.contains("default") {
        score += 1;
    }
    score
}

fn rank(mut list: Vec<DeviceInfo>, direction: StreamDirection) -> Vec<DeviceInfo> {
    if let Some((idx, _)) = list
        .iter()
        .enumerate()
        .max_by_key(|(_, d)| preference_score(&d.name, direction) + if d.is_default { 2 } else { 0 })
    {
        if let Some(best) = list.get_mut(idx) {
            best.is_recommended = true;
        }
    }

    list.sort_by_key(|d| {
        (
            !d.is_recommended,
            d.is_loopback_like,
            !d.is_default,
            d.name.to_ascii_lowercase(),
        )
    });
    list
}

/// List audio devices for a direction, best candidate first.
///
/// Returns an empty `Vec` if cpal is not available or no devices exist.
#[cfg(feature = "audio-cpal")]
pub fn list_devices(direction: StreamDirection) -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let (default_name, devices) = match direction {
        StreamDirection::Input => (
            host.default_input_device().and_then(|d| d.name().ok()),
            host.input_devices().map(|it| it.collect::<Vec<_>>()),
        ),
        StreamDirection::Output => (
            host.default_output_device().and_then(|d| d.name().ok()),
            host.output_devices().map(|it| it.collect::<Vec<_>>()),
        ),
    };

    match devices {
        Ok(devices) => {
            let list = devices
                .into_iter()
                .enumerate()
                .map(|(idx, device)| {
                    let name = device
                        .name()
                        .unwrap_or_else(|_| format!("{direction:?} Device {}", idx + 1));
                    DeviceInfo {
                        is_default: default_name.as_deref() == Some(name.as_str()),
                        is_loopback_like: direction == StreamDirection::Input
                            && is_loopback_like_name(&name),
                        is_recommended: false,
                        name,
                    }
                })
                .collect::<Vec<_>>();
            rank(list, direction)
        }
        Err(e) => {
            tracing::warn!(?direction, "failed to enumerate devices: {e}");
            default_name
                .map(|name| {
                    vec![DeviceInfo {
                        is_loopback_like: direction == StreamDirection::Input
                            && is_loopback_like_name(&name),
                        name,
                        is_default: true,
                        is_recommended: true,
                    }]
                })
                .unwrap_or_default()
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_devices(_direction: StreamDirection) -> Vec<DeviceInfo> {
    vec![]
}
