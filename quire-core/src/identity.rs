//! Participant identity.
//!
//! A participant is a user (stable across sessions) joined through one
//! session (fresh per open). The session id is what tags outbound log
//! entries and presence updates, so two tabs of the same user still see
//! each other's edits.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Display color assigned to a participant.
///
/// Derived from the user id, so the same user gets the same color in every
/// session and on every replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl ParticipantColor {
    pub fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Stable, saturated color for a user id.
    pub fn for_user(user_id: &str) -> Self {
        let digest = blake3::hash(user_id.as_bytes());
        let bytes = digest.as_bytes();
        let seed = u16::from_le_bytes([bytes[0], bytes[1]]);
        let hue = f32::from(seed % 360) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.55);
        Self {
            r: (r * 255.0).round() as u8,
            g: (g * 255.0).round() as u8,
            b: (b * 255.0).round() as u8,
        }
    }

    /// `#rrggbb`
    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    /// Normalized RGBA for renderers.
    pub fn to_array(&self) -> [f32; 4] {
        [
            f32::from(self.r) / 255.0,
            f32::from(self.g) / 255.0,
            f32::from(self.b) / 255.0,
            1.0,
        ]
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_channel(p, q, h + 1.0 / 3.0),
        hue_to_channel(p, q, h),
        hue_to_channel(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_channel(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        p + (q - p) * 6.0 * t
    } else if t < 0.5 {
        q
    } else if t < 2.0 / 3.0 {
        p + (q - p) * (2.0 / 3.0 - t) * 6.0
    } else {
        p
    }
}

/// A user joined to a document through one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    /// Unique per session; tags log entries and presence updates.
    pub session_id: Uuid,
    pub display_name: String,
    pub color: ParticipantColor,
}

impl Participant {
    /// New participant with a fresh session id.
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self::with_session(user_id, display_name, Uuid::new_v4())
    }

    pub fn with_session(
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        session_id: Uuid,
    ) -> Self {
        let user_id = user_id.into();
        let color = ParticipantColor::for_user(&user_id);
        Self {
            user_id,
            session_id,
            display_name: display_name.into(),
            color,
        }
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_is_stable_per_user() {
        let a = ParticipantColor::for_user("alice");
        let b = ParticipantColor::for_user("alice");
        assert_eq!(a, b);
        assert_eq!(a.to_hex().len(), 7);
        assert!(a.to_hex().starts_with('#'));
    }

    #[test]
    fn test_color_is_saturated() {
        for user in ["alice", "bob", "carol", "dave"] {
            let c = ParticipantColor::for_user(user);
            let max = c.r.max(c.g).max(c.b);
            let min = c.r.min(c.g).min(c.b);
            assert!(max - min > 80, "{user} got a washed-out color {c:?}");
        }
    }

    #[test]
    fn test_sessions_differ_for_same_user() {
        let first = Participant::new("alice", "Alice");
        let second = Participant::new("alice", "Alice");
        assert_ne!(first.session_id, second.session_id);
        assert_eq!(first.color, second.color);
    }

    #[test]
    fn test_to_array_normalized() {
        let arr = ParticipantColor::rgb(255, 0, 51).to_array();
        assert_eq!(arr, [1.0, 0.0, 0.2, 1.0]);
    }
}
