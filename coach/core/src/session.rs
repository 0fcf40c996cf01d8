//! Session Model
//!
//! A session is one coaching conversation between a participant and a coach
//! persona. The backend creates it; the controller only finalizes it.
//!
//! The invariant everything else leans on: `ended_at` is `None` exactly while
//! the session is active.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::messages::SessionId;

/// Coaching persona driving the assistant's tone
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persona {
    /// Pushes back, asks hard questions
    DirectChallenger,
    /// Encouraging, plans alongside the participant
    #[default]
    SupportiveStrategist,
}

impl Persona {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectChallenger => "direct_challenger",
            Self::SupportiveStrategist => "supportive_strategist",
        }
    }

    /// Human readable name
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::DirectChallenger => "Direct Challenger",
            Self::SupportiveStrategist => "Supportive Strategist",
        }
    }
}

/// Kind of session the participant asked for
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    /// Short regular check-in
    #[default]
    CheckIn,
    /// Longer exploration of one topic
    DeepDive,
    /// Review progress on goals
    GoalReview,
    /// No fixed structure
    Freeform,
}

impl SessionType {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CheckIn => "check_in",
            Self::DeepDive => "deep_dive",
            Self::GoalReview => "goal_review",
            Self::Freeform => "freeform",
        }
    }
}

/// How the participant talks to the coach
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// Typed messages
    #[default]
    Text,
    /// Spoken messages; replies are played back
    Voice,
}

impl InputMode {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Voice => "voice",
        }
    }
}

macro_rules! wire_enum_text {
    ($ty:ty, [$($variant:expr),+ $(,)?]) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let wanted = s.trim().replace('-', "_").to_lowercase();
                [$($variant),+]
                    .into_iter()
                    .find(|v| v.as_str() == wanted)
                    .ok_or_else(|| {
                        let names: Vec<&str> = [$($variant),+].iter().map(|v| v.as_str()).collect();
                        format!("unknown value '{s}', expected one of: {}", names.join(", "))
                    })
            }
        }
    };
}

wire_enum_text!(
    Persona,
    [Persona::DirectChallenger, Persona::SupportiveStrategist]
);
wire_enum_text!(
    SessionType,
    [
        SessionType::CheckIn,
        SessionType::DeepDive,
        SessionType::GoalReview,
        SessionType::Freeform,
    ]
);
wire_enum_text!(InputMode, [InputMode::Text, InputMode::Voice]);

/// A coaching session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Backend-assigned ID
    pub id: SessionId,
    /// Who the session belongs to
    pub participant_id: String,
    /// Coach persona
    pub persona: Persona,
    /// Session kind
    pub session_type: SessionType,
    /// Text or voice
    pub input_mode: InputMode,
    /// When the backend opened the session
    pub started_at: DateTime<Utc>,
    /// Set when the session is finalized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Total length, known once ended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
    /// Messages exchanged
    #[serde(default)]
    pub message_count: usize,
    /// Backend-written recap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Goals this session is linked to
    #[serde(default)]
    pub goal_ids: Vec<String>,
}

impl Session {
    /// Create an active session starting now
    pub fn new(
        participant_id: impl Into<String>,
        persona: Persona,
        session_type: SessionType,
        input_mode: InputMode,
    ) -> Self {
        Self {
            id: SessionId::new(),
            participant_id: participant_id.into(),
            persona,
            session_type,
            input_mode,
            started_at: Utc::now(),
            ended_at: None,
            duration_seconds: None,
            message_count: 0,
            summary: None,
            goal_ids: Vec::new(),
        }
    }

    /// Whether the session is still open
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Seconds between start and `now`, clamped at zero
    #[must_use]
    pub fn seconds_since_start(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from((now - self.started_at).num_seconds()).unwrap_or(0)
    }

    /// Finalize the session at `ended_at`
    ///
    /// Duration is computed from the timestamps unless one is already known.
    /// Ending twice keeps the first end time.
    pub fn finish(&mut self, ended_at: DateTime<Utc>, summary: Option<String>) {
        if self.ended_at.is_some() {
            return;
        }
        self.ended_at = Some(ended_at);
        if self.duration_seconds.is_none() {
            self.duration_seconds = Some(self.seconds_since_start(ended_at));
        }
        if summary.is_some() {
            self.summary = summary;
        }
    }
}

/// Format seconds as `MM:SS`, or `H:MM:SS` past the hour
#[must_use]
pub fn format_elapsed(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes:02}:{secs:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_new_session_is_active() {
        let session = Session::new(
            "p-1",
            Persona::DirectChallenger,
            SessionType::CheckIn,
            InputMode::Text,
        );
        assert!(session.is_active());
        assert_eq!(session.message_count, 0);
    }

    #[test]
    fn test_finish_sets_duration_once() {
        let mut session = Session::new(
            "p-1",
            Persona::SupportiveStrategist,
            SessionType::DeepDive,
            InputMode::Text,
        );
        let end = session.started_at + Duration::seconds(95);
        session.finish(end, Some("Talked about delegation".to_string()));

        assert!(!session.is_active());
        assert_eq!(session.duration_seconds, Some(95));
        assert_eq!(session.summary.as_deref(), Some("Talked about delegation"));

        session.finish(end + Duration::seconds(60), None);
        assert_eq!(session.ended_at, Some(end));
        assert_eq!(session.duration_seconds, Some(95));
    }

    #[test]
    fn test_seconds_since_start_clamps_future_start() {
        let session = Session::new("p", Persona::default(), SessionType::default(), InputMode::Text);
        let before = session.started_at - Duration::seconds(10);
        assert_eq!(session.seconds_since_start(before), 0);
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!("check-in".parse::<SessionType>(), Ok(SessionType::CheckIn));
        assert_eq!("DEEP_DIVE".parse::<SessionType>(), Ok(SessionType::DeepDive));
        assert_eq!(
            "direct_challenger".parse::<Persona>(),
            Ok(Persona::DirectChallenger)
        );
        assert_eq!("voice".parse::<InputMode>(), Ok(InputMode::Voice));
        assert!("therapist".parse::<Persona>().is_err());
    }

    #[test]
    fn test_wire_names() {
        let json = serde_json::to_string(&SessionType::GoalReview).unwrap();
        assert_eq!(json, "\"goal_review\"");
        assert_eq!(Persona::SupportiveStrategist.to_string(), "supportive_strategist");
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(0), "00:00");
        assert_eq!(format_elapsed(75), "01:15");
        assert_eq!(format_elapsed(3_725), "1:02:05");
    }
}
