//! Safety Signal Detection
//!
//! Scans text for crisis language so resources can be shown right away,
//! independent of whether a reply is still streaming. Matching is a
//! case-insensitive substring search; a miss is not an error.
//!
//! Two places feed it: every user message before its reply stream opens, and
//! the last few messages when the participant asks for a human coach.

use serde::{Deserialize, Serialize};

use crate::conversation::Message;

/// Phrases that mean the participant may be at risk
pub const CRISIS_SET: &[&str] = &[
    "suicide",
    "kill myself",
    "want to die",
    "end my life",
    "hopeless",
    "self-harm",
    "hurt myself",
    "no reason to live",
    "自杀",
    "想死",
];

/// Topics that need a human but are not an emergency
pub const ESCALATION_SET: &[&str] = &[
    "legal",
    "lawsuit",
    "hr investigation",
    "harassment",
    "discrimination",
];

/// Messages considered when evaluating a handoff request
pub const HANDOFF_WINDOW: usize = 4;

/// Coarse risk bucket
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Nothing found
    None,
    /// Needs a human, not urgent
    Medium,
    /// Crisis language
    High,
}

impl RiskLevel {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Whether `text` contains crisis language
#[must_use]
pub fn is_crisis(text: &str) -> bool {
    matches_any(text, CRISIS_SET)
}

/// Risk bucket for `text`
#[must_use]
pub fn risk_level(text: &str) -> RiskLevel {
    if is_crisis(text) {
        RiskLevel::High
    } else if matches_any(text, ESCALATION_SET) {
        RiskLevel::Medium
    } else {
        RiskLevel::None
    }
}

fn matches_any(text: &str, terms: &[impl AsRef<str>]) -> bool {
    let lower = text.to_lowercase();
    terms.iter().any(|t| lower.contains(&t.as_ref().to_lowercase()))
}

/// Where a crisis signal came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrisisTrigger {
    /// A message the participant just sent
    UserMessage,
    /// The recent conversation, checked on a handoff request
    Handoff,
    /// The backend marked the streaming reply as high risk
    StreamMetadata,
}

/// A crisis line shown with a crisis signal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrisisResource {
    /// Service name
    pub name: String,
    /// Number to call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Number to text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_number: Option<String>,
    /// Availability or usage note
    pub available: String,
}

/// The fixed list of crisis resources
#[must_use]
pub fn crisis_resources() -> Vec<CrisisResource> {
    vec![
        CrisisResource {
            name: "988 Suicide & Crisis Lifeline".to_string(),
            phone: Some("988".to_string()),
            text_number: None,
            available: "Available 24/7".to_string(),
        },
        CrisisResource {
            name: "Crisis Text Line".to_string(),
            phone: None,
            text_number: Some("741741".to_string()),
            available: "Text HOME to 741741".to_string(),
        },
    ]
}

/// Result of evaluating a handoff request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandoffOutcome {
    /// Crisis language in the recent conversation
    Crisis,
    /// No crisis; offer ways to reach a human coach
    Options,
}

/// Configurable detector used by the controller
#[derive(Clone, Debug)]
pub struct SafetySignalDetector {
    crisis_terms: Vec<String>,
    window: usize,
}

impl Default for SafetySignalDetector {
    fn default() -> Self {
        Self {
            crisis_terms: CRISIS_SET.iter().map(|s| (*s).to_string()).collect(),
            window: HANDOFF_WINDOW,
        }
    }
}

impl SafetySignalDetector {
    /// Detector with the default crisis set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add extra crisis terms
    #[must_use]
    pub fn with_terms<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.crisis_terms.extend(terms.into_iter().map(Into::into));
        self
    }

    /// Override how many recent messages a handoff looks at
    #[must_use]
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    /// Messages considered on a handoff request
    #[must_use]
    pub fn window(&self) -> usize {
        self.window
    }

    /// Whether `text` contains crisis language
    #[must_use]
    pub fn is_crisis(&self, text: &str) -> bool {
        matches_any(text, &self.crisis_terms)
    }

    /// Evaluate a handoff request over the tail of the conversation
    #[must_use]
    pub fn evaluate_handoff(&self, messages: &[Message]) -> HandoffOutcome {
        let start = messages.len().saturating_sub(self.window);
        let context = messages[start..]
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if self.is_crisis(&context) {
            HandoffOutcome::Crisis
        } else {
            HandoffOutcome::Options
        }
    }
}
