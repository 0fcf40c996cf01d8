//! Diagnostics & Quick Replies
//!
//! Diagnostics describe how the coach read a turn: the style it used, the
//! emotion it picked up, and which goal the turn links to. They come from two
//! places:
//!
//! - [`Diagnostics::heuristic`]: keyword buckets run over the user's text
//!   before the reply starts, so the placeholder has something to show
//! - [`Diagnostics::from_meta`]: the `__META__:` event the backend sends
//!   mid-stream, which replaces the heuristic snapshot wholesale
//!
//! Quick replies are derived from the emotion bucket after each reply.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::safety;

/// Emotion used when nothing more specific is known
pub const DEFAULT_EMOTION: &str = "neutral";

/// Goal link used when nothing more specific is known
pub const DEFAULT_GOAL_LINK: &str = "professional_growth";

/// Analysis attached to a message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Coaching style the reply used
    pub style_used: String,
    /// Emotion bucket detected in the user's text
    pub emotion_detected: String,
    /// Goal category the turn links to
    pub goal_link: String,
    /// Specific goal the turn is anchored to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_anchor: Option<String>,
    /// `none`, `medium` or `high`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<String>,
    /// Style the backend suggests for the next turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_style_shift: Option<String>,
    /// Backend-defined goal tree
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_hierarchy: Option<Value>,
    /// Backend-defined skill plan
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progressive_skill_building: Option<Value>,
    /// Backend-defined outcome forecast
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome_prediction: Option<Value>,
}

/// Metadata event body as sent on the wire; every key is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MetaPayload {
    style_used: Option<String>,
    emotion_detected: Option<String>,
    goal_link: Option<String>,
    goal_anchor: Option<String>,
    risk_level: Option<String>,
    recommended_style_shift: Option<String>,
    goal_hierarchy: Option<Value>,
    progressive_skill_building: Option<Value>,
    outcome_prediction: Option<Value>,
}

impl Diagnostics {
    /// Diagnostics with every default filled in
    #[must_use]
    pub fn neutral(style: &str) -> Self {
        Self {
            style_used: style.to_string(),
            emotion_detected: DEFAULT_EMOTION.to_string(),
            goal_link: DEFAULT_GOAL_LINK.to_string(),
            goal_anchor: None,
            risk_level: None,
            recommended_style_shift: None,
            goal_hierarchy: None,
            progressive_skill_building: None,
            outcome_prediction: None,
        }
    }

    /// Parse and normalize a metadata event body
    ///
    /// Missing keys get defaults (`neutral`, `professional_growth`, and
    /// `default_style`). Blank strings count as missing.
    ///
    /// # Errors
    ///
    /// Returns the JSON error when the body is not a JSON object with the
    /// expected value types.
    pub fn from_meta(json: &str, default_style: &str) -> Result<Self, serde_json::Error> {
        let meta: MetaPayload = serde_json::from_str(json.trim())?;
        let non_blank = |value: Option<String>| value.filter(|s| !s.trim().is_empty());

        Ok(Self {
            style_used: non_blank(meta.style_used).unwrap_or_else(|| default_style.to_string()),
            emotion_detected: non_blank(meta.emotion_detected)
                .unwrap_or_else(|| DEFAULT_EMOTION.to_string()),
            goal_link: non_blank(meta.goal_link).unwrap_or_else(|| DEFAULT_GOAL_LINK.to_string()),
            goal_anchor: non_blank(meta.goal_anchor),
            risk_level: non_blank(meta.risk_level),
            recommended_style_shift: non_blank(meta.recommended_style_shift),
            goal_hierarchy: meta.goal_hierarchy,
            progressive_skill_building: meta.progressive_skill_building,
            outcome_prediction: meta.outcome_prediction,
        })
    }

    /// Keyword pre-analysis of a user message
    #[must_use]
    pub fn heuristic(text: &str, style: &str) -> Self {
        let mut diagnostics = Self::neutral(style);
        diagnostics.emotion_detected = detect_emotion(text).to_string();
        diagnostics.goal_link = infer_goal_link(text).to_string();
        diagnostics.risk_level = Some(safety::risk_level(text).as_str().to_string());
        diagnostics
    }

    /// Whether the backend flagged this turn as high risk
    #[must_use]
    pub fn is_high_risk(&self) -> bool {
        self.risk_level
            .as_deref()
            .is_some_and(|level| level.eq_ignore_ascii_case("high"))
    }
}

const EMOTION_BUCKETS: &[(&str, &[&str])] = &[
    (
        "distressed",
        &[
            "hopeless",
            "panic",
            "can't",
            "cannot cope",
            "overwhelmed",
            "burnout",
            "burned out",
            "anxious",
            "stressed",
        ],
    ),
    (
        "low_confidence",
        &[
            "imposter",
            "impostor",
            "not good enough",
            "doubt",
            "afraid to fail",
        ],
    ),
    ("motivated", &["excited", "ready", "committed", "motivated"]),
    ("uncertain", &["not sure", "confused", "unclear", "maybe"]),
];

const GOAL_BUCKETS: &[(&str, &[&str])] = &[
    (
        "career_advancement",
        &["promotion", "vp", "director", "career growth"],
    ),
    (
        "leadership_effectiveness",
        &["team", "manager", "leadership", "stakeholder"],
    ),
    (
        "execution_excellence",
        &["focus", "productivity", "prioritize", "execution"],
    ),
];

fn first_bucket(text: &str, buckets: &[(&'static str, &[&str])]) -> Option<&'static str> {
    let lower = text.to_lowercase();
    buckets
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| contains_term(&lower, k)))
        .map(|(name, _)| *name)
}

/// Substring match, but whole-word for short ASCII terms like `vp`
fn contains_term(haystack: &str, term: &str) -> bool {
    if term.len() > 3 || !term.is_ascii() {
        return haystack.contains(term);
    }
    haystack
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| word == term)
}

/// Emotion bucket for a piece of text
#[must_use]
pub fn detect_emotion(text: &str) -> &'static str {
    first_bucket(text, EMOTION_BUCKETS).unwrap_or(DEFAULT_EMOTION)
}

/// Goal category for a piece of text
#[must_use]
pub fn infer_goal_link(text: &str) -> &'static str {
    first_bucket(text, GOAL_BUCKETS).unwrap_or(DEFAULT_GOAL_LINK)
}

/// What a quick reply is for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuickReplyKind {
    /// Ask the coach for direction
    Guidance,
    /// Ask the coach to explain
    Clarification,
    /// Steer toward a concrete goal
    GoalOriented,
    /// Ask for support
    EmotionalSupport,
}

/// A one-tap suggestion offered after a reply
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickReply {
    /// Stable within one suggestion set
    pub id: String,
    /// Text sent when chosen
    pub text: String,
    /// Category
    pub kind: QuickReplyKind,
}

impl QuickReply {
    fn new(index: usize, text: &str, kind: QuickReplyKind) -> Self {
        Self {
            id: format!("qr-{index}"),
            text: text.to_string(),
            kind,
        }
    }
}

/// Suggestions for the emotion bucket of the last turn
#[must_use]
pub fn quick_replies_for(emotion: &str) -> Vec<QuickReply> {
    use QuickReplyKind::{Clarification, EmotionalSupport, GoalOriented, Guidance};

    let options: &[(&str, QuickReplyKind)] = match emotion {
        "distressed" => &[
            ("This feels like a lot right now", EmotionalSupport),
            ("Help me find one thing I can control", Guidance),
            ("What is a small first step?", GoalOriented),
        ],
        "low_confidence" => &[
            ("Why do I keep doubting myself?", Clarification),
            ("Help me see my progress so far", EmotionalSupport),
            ("What would build my confidence?", Guidance),
        ],
        "motivated" => &[
            ("Let's turn this into a plan", GoalOriented),
            ("What should I tackle first?", Guidance),
            ("How do I keep this momentum?", Clarification),
        ],
        "uncertain" => &[
            ("Can you explain that differently?", Clarification),
            ("Help me weigh my options", Guidance),
            ("What goal should I focus on?", GoalOriented),
        ],
        _ => &[
            ("Tell me more", Clarification),
            ("What should I do next?", Guidance),
            ("How does this connect to my goals?", GoalOriented),
        ],
    };

    options
        .iter()
        .enumerate()
        .map(|(i, (text, kind))| QuickReply::new(i + 1, text, *kind))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_meta_defaults() {
        let d = Diagnostics::from_meta("{}", "supportive").unwrap();
        assert_eq!(d, Diagnostics::neutral("supportive"));
    }

    #[test]
    fn test_meta_full_payload() {
        let json = r#"{
            "style_used": "challenging",
            "emotion_detected": "motivated",
            "goal_link": "career_advancement",
            "goal_anchor": "Director by Q4",
            "risk_level": "none",
            "recommended_style_shift": "supportive",
            "goal_hierarchy": {"root": "Director", "children": ["Visibility"]},
            "outcome_prediction": {"confidence": 0.7}
        }"#;
        let d = Diagnostics::from_meta(json, "supportive").unwrap();

        assert_eq!(d.style_used, "challenging");
        assert_eq!(d.emotion_detected, "motivated");
        assert_eq!(d.goal_anchor.as_deref(), Some("Director by Q4"));
        assert_eq!(d.recommended_style_shift.as_deref(), Some("supportive"));
        assert_eq!(d.goal_hierarchy.unwrap()["root"], "Director");
        assert!(d.progressive_skill_building.is_none());
    }

    #[test]
    fn test_meta_blank_strings_use_defaults() {
        let d = Diagnostics::from_meta(r#"{"emotion_detected": "  ", "style_used": ""}"#, "direct")
            .unwrap();
        assert_eq!(d.emotion_detected, DEFAULT_EMOTION);
        assert_eq!(d.style_used, "direct");
    }

    #[test]
    fn test_meta_malformed() {
        assert!(Diagnostics::from_meta("{not json", "s").is_err());
        assert!(Diagnostics::from_meta("[1, 2]", "s").is_err());
        assert!(Diagnostics::from_meta(r#"{"goal_link": 5}"#, "s").is_err());
    }

    #[test]
    fn test_emotion_buckets() {
        assert_eq!(detect_emotion("I'm completely OVERWHELMED"), "distressed");
        assert_eq!(detect_emotion("Classic imposter feelings"), "low_confidence");
        assert_eq!(detect_emotion("I'm ready to commit"), "motivated");
        assert_eq!(detect_emotion("I'm not sure what to do"), "uncertain");
        assert_eq!(detect_emotion("Let's talk about Monday"), DEFAULT_EMOTION);
    }

    #[test]
    fn test_goal_buckets() {
        assert_eq!(infer_goal_link("Aiming for VP next year"), "career_advancement");
        assert_eq!(infer_goal_link("My team keeps missing deadlines"), "leadership_effectiveness");
        assert_eq!(infer_goal_link("I need to prioritize better"), "execution_excellence");
        assert_eq!(infer_goal_link("Everything is fine"), DEFAULT_GOAL_LINK);
        // "vp" only as a word
        assert_eq!(infer_goal_link("an mvp launch"), DEFAULT_GOAL_LINK);
    }

    #[test]
    fn test_heuristic_snapshot() {
        let d = Diagnostics::heuristic("Burnout is hitting my whole team", "supportive");
        assert_eq!(d.style_used, "supportive");
        assert_eq!(d.emotion_detected, "distressed");
        assert_eq!(d.goal_link, "leadership_effectiveness");
        assert_eq!(d.risk_level.as_deref(), Some("none"));
    }

    #[test]
    fn test_high_risk_flag() {
        let d = Diagnostics::from_meta(r#"{"risk_level": "HIGH"}"#, "s").unwrap();
        assert!(d.is_high_risk());
        assert!(!Diagnostics::neutral("s").is_high_risk());
    }

    #[test]
    fn test_quick_replies() {
        let replies = quick_replies_for("distressed");
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0].kind, QuickReplyKind::EmotionalSupport);
        assert_eq!(replies[0].id, "qr-1");

        let fallback = quick_replies_for("something-new");
        assert!((2..=3).contains(&fallback.len()));
    }
}
