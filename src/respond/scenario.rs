//! Response scenarios.

use serde::{Deserialize, Serialize};

/// The kind of automated reply being generated. Each scenario carries
/// its own system prompt, generation parameters, and (for the email
/// scenarios) a strategist prompt for the two-step workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    Summarizer,
    IntroEmail,
    ContinuationEmail,
    ClosingReferral,
    FollowUp,
}

impl Scenario {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summarizer => "summarizer",
            Self::IntroEmail => "intro_email",
            Self::ContinuationEmail => "continuation_email",
            Self::ClosingReferral => "closing_referral",
            Self::FollowUp => "follow_up",
        }
    }

    /// Parse a scenario keyword. The bare "intro" shorthand maps to
    /// `intro_email`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "summarizer" => Some(Self::Summarizer),
            "intro" | "intro_email" => Some(Self::IntroEmail),
            "continuation_email" => Some(Self::ContinuationEmail),
            "closing_referral" => Some(Self::ClosingReferral),
            "follow_up" => Some(Self::FollowUp),
            _ => None,
        }
    }

    /// Scenarios the selector model is allowed to choose. `FollowUp` is
    /// driven by conversation state, never by the selector.
    pub fn selectable(&self) -> bool {
        !matches!(self, Self::FollowUp)
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keywords() {
        assert_eq!(Scenario::parse("intro_email"), Some(Scenario::IntroEmail));
        assert_eq!(Scenario::parse("intro"), Some(Scenario::IntroEmail));
        assert_eq!(Scenario::parse(" Continuation_Email "), Some(Scenario::ContinuationEmail));
        assert_eq!(Scenario::parse("follow_up"), Some(Scenario::FollowUp));
        assert_eq!(Scenario::parse("something_else"), None);
    }

    #[test]
    fn follow_up_is_not_selectable() {
        assert!(!Scenario::FollowUp.selectable());
        assert!(Scenario::IntroEmail.selectable());
        assert!(Scenario::Summarizer.selectable());
    }
}
