//! Rule-based ticket triage.
//!
//! Runs before retrieval and flags tickets that must not be answered
//! automatically: incoherent input is rejected outright, and risk signals
//! (hostile tone, disclosed credentials or card numbers) route the ticket
//! straight to a human.

use serde::Serialize;

use helpdesk_harness_core::models::Priority;

const NEGATIVE_WORDS: &[&str] = &[
    // English
    "furious",
    "angry",
    "unacceptable",
    "outrageous",
    "ridiculous",
    "disgusting",
    "terrible",
    "horrible",
    "disaster",
    "lawyer",
    "lawsuit",
    "sue",
    "scam",
    // French
    "furieux",
    "furieuse",
    "énervé",
    "énervée",
    "inacceptable",
    "catastrophique",
    "scandaleux",
    "avocat",
    "arnaque",
];

const NEGATIVE_PHRASES: &[&str] = &[
    "third time",
    "still broken",
    "cancel my subscription",
    "3ème fois",
    "troisième fois",
    "toujours pas",
];

const CREDENTIAL_PHRASES: &[&str] = &[
    "my password is",
    "password:",
    "password =",
    "pwd:",
    "mot de passe est",
    "mot de passe:",
    "mon mdp est",
    "mdp:",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFlag {
    NegativeEmotion,
    SensitiveData,
}

impl RiskFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskFlag::NegativeEmotion => "negative_emotion",
            RiskFlag::SensitiveData => "sensitive_data",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    Bug,
    Account,
    Feedback,
    Question,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::Bug => "bug",
            QuestionType::Account => "account",
            QuestionType::Feedback => "feedback",
            QuestionType::Question => "question",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriageReport {
    pub coherent: bool,
    pub question_type: QuestionType,
    pub flags: Vec<RiskFlag>,
}

impl TriageReport {
    /// Priority for an immediate hand-off, if any risk flag is set.
    pub fn escalation_priority(&self) -> Option<Priority> {
        if self.flags.contains(&RiskFlag::SensitiveData) {
            Some(Priority::Critical)
        } else if self.flags.contains(&RiskFlag::NegativeEmotion) {
            Some(Priority::High)
        } else {
            None
        }
    }

    pub fn reason(&self) -> String {
        if !self.coherent {
            return "ticket text is not a readable question".to_string();
        }
        let flags: Vec<&str> = self.flags.iter().map(RiskFlag::as_str).collect();
        if flags.is_empty() {
            "no risk signals".to_string()
        } else {
            format!("risk signals: {}", flags.join(", "))
        }
    }
}

fn words(lower: &str) -> impl Iterator<Item = &str> {
    lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
}

fn is_coherent(text: &str) -> bool {
    text.split(|c: char| !c.is_alphabetic())
        .any(|w| w.chars().count() >= 2)
}

/// Digit runs, allowing single space, dash, or dot separators between
/// digits (`4111 1111-1111.1111` is one run `4111111111111111`).
fn digit_runs(text: &str) -> Vec<String> {
    let mut runs = Vec::new();
    let mut current = String::new();
    let mut pending_sep = false;
    for c in text.chars() {
        if c.is_ascii_digit() {
            current.push(c);
            pending_sep = false;
        } else if !current.is_empty() && !pending_sep && matches!(c, ' ' | '-' | '.') {
            pending_sep = true;
        } else {
            if !current.is_empty() {
                runs.push(std::mem::take(&mut current));
            }
            pending_sep = false;
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

/// Luhn checksum over an all-digit string.
fn luhn_valid(digits: &str) -> bool {
    let mut sum = 0u32;
    for (i, c) in digits.chars().rev().enumerate() {
        let Some(mut d) = c.to_digit(10) else {
            return false;
        };
        if i % 2 == 1 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }
    sum % 10 == 0
}

/// 13 to 19 digits passing the Luhn check. Order, ticket, and phone
/// numbers are shorter or fail the checksum.
fn is_card_number(run: &str) -> bool {
    (13..=19).contains(&run.len()) && luhn_valid(run)
}

fn has_sensitive_data(lower: &str) -> bool {
    if CREDENTIAL_PHRASES.iter().any(|p| lower.contains(p)) {
        return true;
    }
    digit_runs(lower).iter().any(|run| is_card_number(run))
}

fn has_negative_emotion(lower: &str) -> bool {
    words(lower).any(|w| NEGATIVE_WORDS.contains(&w))
        || NEGATIVE_PHRASES.iter().any(|p| lower.contains(p))
}

fn question_type(lower: &str) -> QuestionType {
    let has = |list: &[&str]| words(lower).any(|w| list.contains(&w));
    if has(&["error", "bug", "crash", "crashes", "broken", "fails", "failed", "erreur", "plantage"]) {
        QuestionType::Bug
    } else if has(&["account", "password", "login", "compte", "connexion"]) {
        QuestionType::Account
    } else if has(&["suggest", "suggestion", "feature", "wish", "feedback", "idée"]) {
        QuestionType::Feedback
    } else {
        QuestionType::Question
    }
}

pub fn triage(text: &str) -> TriageReport {
    let lower = text.to_lowercase();
    let coherent = is_coherent(text);

    let mut flags = Vec::new();
    if coherent {
        if has_negative_emotion(&lower) {
            flags.push(RiskFlag::NegativeEmotion);
        }
        if has_sensitive_data(&lower) {
            flags.push(RiskFlag::SensitiveData);
        }
    }

    TriageReport {
        coherent,
        question_type: question_type(&lower),
        flags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_question_has_no_flags() {
        let r = triage("How do I enable two-factor authentication?");
        assert!(r.coherent);
        assert!(r.flags.is_empty());
        assert_eq!(r.escalation_priority(), None);
        assert_eq!(r.question_type, QuestionType::Question);
    }

    #[test]
    fn test_incoherent_input() {
        assert!(!triage("?? !! 12345").coherent);
        assert!(!triage("").coherent);
        assert!(triage("ok").coherent);
    }

    #[test]
    fn test_negative_emotion_english_and_french() {
        let r = triage("This is unacceptable, third time I ask!");
        assert_eq!(r.flags, vec![RiskFlag::NegativeEmotion]);
        assert_eq!(r.escalation_priority(), Some(Priority::High));

        let r = triage("Je suis furieux, rien ne marche");
        assert!(r.flags.contains(&RiskFlag::NegativeEmotion));
    }

    #[test]
    fn test_negative_word_needs_whole_word() {
        assert!(triage("Please issue my invoice").flags.is_empty());
    }

    #[test]
    fn test_password_disclosure_is_critical() {
        let r = triage("I can't log in, my password is hunter2");
        assert!(r.flags.contains(&RiskFlag::SensitiveData));
        assert_eq!(r.escalation_priority(), Some(Priority::Critical));
        assert_eq!(r.question_type, QuestionType::Account);
    }

    #[test]
    fn test_card_number_detected() {
        let r = triage("Charge card 4111 1111 1111 1111 again please");
        assert!(r.flags.contains(&RiskFlag::SensitiveData));
    }

    #[test]
    fn test_short_numbers_are_fine() {
        let r = triage("I get error 500 on page 404 since 2024");
        assert!(r.flags.is_empty());
        assert_eq!(r.question_type, QuestionType::Bug);
    }

    #[test]
    fn test_digit_runs() {
        assert_eq!(digit_runs("4111-1111-1111-1111"), vec!["4111111111111111"]);
        assert_eq!(digit_runs("call +33 6 12 34 56 78"), vec!["33612345678"]);
        assert_eq!(digit_runs("a 12  34"), vec!["12", "34"]);
    }

    #[test]
    fn test_order_and_phone_numbers_not_sensitive() {
        for text in [
            "Where is my order 123456789?",
            "Ticket 4820193746 is still open",
            "Call me at +33 6 12 34 56 78",
            "Invoice number 1234567890123 looks wrong",
        ] {
            let r = triage(text);
            assert!(
                !r.flags.contains(&RiskFlag::SensitiveData),
                "flagged as sensitive: {}",
                text
            );
        }
    }

    #[test]
    fn test_luhn() {
        assert!(luhn_valid("4111111111111111"));
        assert!(luhn_valid("5500005555555559"));
        assert!(!luhn_valid("4111111111111112"));
        assert!(!is_card_number("1234567890123"));
        assert!(!is_card_number("79927398713"));
    }

    #[test]
    fn test_both_flags_take_critical() {
        let r = triage("Unacceptable! My password is abc123");
        assert_eq!(r.flags.len(), 2);
        assert_eq!(r.escalation_priority(), Some(Priority::Critical));
        assert!(r.reason().contains("negative_emotion"));
    }
}
