//! Pure mappings from amplitude, emotion and time to avatar rig parameters.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::AvatarError;

/// Jaw angle in radians with the mouth shut.
pub const JAW_CLOSED: f32 = 0.03;
/// Jaw angle in radians at full amplitude.
pub const JAW_OPEN: f32 = 0.45;

/// Expression tag supplied by the user and read by the renderers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    #[default]
    Neutral,
    Happy,
    Sad,
    Angry,
    Surprised,
}

impl Emotion {
    pub const ALL: [Emotion; 5] = [
        Emotion::Neutral,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Angry,
        Emotion::Surprised,
    ];

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Neutral => "neutral",
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Angry => "angry",
            Emotion::Surprised => "surprised",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Emotion {
    type Err = AvatarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Emotion::ALL
            .into_iter()
            .find(|emotion| emotion.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| AvatarError::msg(format!("unknown emotion `{s}`")))
    }
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

fn unit(amplitude: f32) -> f32 {
    if amplitude.is_finite() {
        amplitude.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Jaw angle the puppet eases toward for `amplitude`.
pub fn jaw_target(amplitude: f32) -> f32 {
    lerp(JAW_CLOSED, JAW_OPEN, unit(amplitude))
}

/// One easing step from `current` toward `target`.
pub fn ease_toward(current: f32, target: f32, factor: f32) -> f32 {
    current + (target - current) * factor.clamp(0.0, 1.0)
}

/// Vertical mouth radius in portrait pixels at a 300 px tall reference.
pub fn mouth_openness(amplitude: f32) -> f32 {
    (unit(amplitude) * 50.0).max(6.0)
}

/// Vertical eyebrow offset in portrait pixels at a 300 px tall reference.
/// Negative raises the brows.
pub fn brow_offset(emotion: Emotion) -> f32 {
    match emotion {
        Emotion::Neutral => 0.0,
        Emotion::Happy => -8.0,
        Emotion::Sad => 8.0,
        Emotion::Angry => 6.0,
        Emotion::Surprised => -12.0,
    }
}

/// Puppet eye offset as `(forward, up)` in rig units.
pub fn eye_offset(emotion: Emotion) -> (f32, f32) {
    match emotion {
        Emotion::Neutral => (0.0, 0.0),
        Emotion::Happy => (0.12, 0.04),
        Emotion::Sad => (-0.1, -0.03),
        Emotion::Angry => (-0.06, 0.05),
        Emotion::Surprised => (0.2, 0.08),
    }
}

/// Vertical eye scale. Dips to 0.2 briefly every couple of seconds.
pub fn blink_scale(time_seconds: f32) -> f32 {
    let phase = (3.1 * time_seconds + 1.7).sin().max(0.0);
    (1.0 - phase.powi(10) * 0.8).clamp(0.2, 1.0)
}

/// Idle head rotation as `(yaw, pitch)` in radians.
pub fn sway(time_seconds: f32) -> (f32, f32) {
    ((0.6 * time_seconds).sin() * 0.1, (0.4 * time_seconds).sin() * 0.05)
}

/// Hand heights for `(left, right)`; they bob in opposite phase while speaking.
pub fn hand_heights(amplitude: f32, time_seconds: f32) -> (f32, f32) {
    let bob = (2.0 * time_seconds).sin() * unit(amplitude) * 0.6;
    (0.4 + bob, 0.4 - bob)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jaw_target_spans_closed_to_open() {
        assert_eq!(jaw_target(0.0), JAW_CLOSED);
        assert!((jaw_target(1.0) - JAW_OPEN).abs() < 1e-6);
        assert_eq!(jaw_target(f32::NAN), JAW_CLOSED);
        assert!((jaw_target(7.0) - JAW_OPEN).abs() < 1e-6);
    }

    #[test]
    fn easing_approaches_without_overshoot() {
        let mut jaw = JAW_CLOSED;
        for _ in 0..60 {
            let next = ease_toward(jaw, JAW_OPEN, 0.35);
            assert!(next >= jaw && next <= JAW_OPEN);
            jaw = next;
        }
        assert!((jaw - JAW_OPEN).abs() < 1e-4);
    }

    #[test]
    fn mouth_never_fully_closes() {
        assert_eq!(mouth_openness(0.0), 6.0);
        assert_eq!(mouth_openness(0.5), 25.0);
        assert_eq!(mouth_openness(1.0), 50.0);
    }

    #[test]
    fn blink_stays_in_range() {
        let mut lowest: f32 = 1.0;
        for step in 0..1_000 {
            let value = blink_scale(step as f32 * 0.01);
            assert!((0.2..=1.0).contains(&value));
            lowest = lowest.min(value);
        }
        assert!(lowest < 0.3);
    }

    #[test]
    fn hands_rest_when_silent() {
        assert_eq!(hand_heights(0.0, 0.7), (0.4, 0.4));
        let (left, right) = hand_heights(1.0, 0.7);
        assert!((left + right - 0.8).abs() < 1e-6);
    }

    #[test]
    fn emotions_parse_case_insensitively() {
        assert_eq!("Happy".parse::<Emotion>().unwrap(), Emotion::Happy);
        assert!("bored".parse::<Emotion>().is_err());
        assert_eq!(brow_offset(Emotion::Surprised), -12.0);
        assert_eq!(eye_offset(Emotion::Sad), (-0.1, -0.03));
    }
}
