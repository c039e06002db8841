use serde::{Deserialize, Serialize};

/// Closed set of root-cause categories a confusion can be classified into.
///
/// The wire codes (`MP`, `WMM`, `LC`, `PU`) are what the model is instructed to
/// emit; anything else fails deserialization and is treated as a malformed
/// response, never as a new category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RootCause {
    #[serde(rename = "MP")]
    MissingPrerequisite,
    #[serde(rename = "WMM")]
    WrongMentalModel,
    #[serde(rename = "LC")]
    LanguageConfusion,
    #[serde(rename = "PU")]
    PartialUnderstanding,
}

impl RootCause {
    /// Human-readable label for the category.
    pub fn label(&self) -> &'static str {
        match self {
            RootCause::MissingPrerequisite => "Missing Prerequisite",
            RootCause::WrongMentalModel => "Wrong Mental Model",
            RootCause::LanguageConfusion => "Language Confusion",
            RootCause::PartialUnderstanding => "Partial Understanding",
        }
    }
}

/// Structured diagnosis of a learner's confusion, produced by one model call.
///
/// Immutable once built; a new query replaces the whole object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnosis {
    pub root_cause_code: RootCause,
    pub root_cause_explanation: String,
    pub empathetic_summary: String,
    pub prescribed_fix: String,
    pub check_question: String,
}

impl Diagnosis {
    /// Returns the name of the first text field that is empty after trimming,
    /// if any. A diagnosis with an empty field is not usable.
    pub fn first_empty_field(&self) -> Option<&'static str> {
        [
            ("rootCauseExplanation", &self.root_cause_explanation),
            ("empatheticSummary", &self.empathetic_summary),
            ("prescribedFix", &self.prescribed_fix),
            ("checkQuestion", &self.check_question),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
    }
}

/// Pass/fail judgement of a learner's answer to the check question.
///
/// Replaced wholesale on retry, never merged with a previous attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub is_correct: bool,
    pub feedback: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cause_codes_round_trip() {
        for (code, variant) in [
            ("MP", RootCause::MissingPrerequisite),
            ("WMM", RootCause::WrongMentalModel),
            ("LC", RootCause::LanguageConfusion),
            ("PU", RootCause::PartialUnderstanding),
        ] {
            let parsed: RootCause =
                serde_json::from_str(&format!("\"{}\"", code)).unwrap();
            assert_eq!(parsed, variant);
            assert_eq!(serde_json::to_string(&variant).unwrap(), format!("\"{}\"", code));
        }
    }

    #[test]
    fn unknown_root_cause_code_is_rejected() {
        assert!(serde_json::from_str::<RootCause>("\"XX\"").is_err());
    }

    #[test]
    fn first_empty_field_reports_trimmed_emptiness() {
        let diagnosis = Diagnosis {
            root_cause_code: RootCause::WrongMentalModel,
            root_cause_explanation: "Wrong Mental Model".into(),
            empathetic_summary: "   ".into(),
            prescribed_fix: "Think of it as...".into(),
            check_question: "Explain it back".into(),
        };
        assert_eq!(diagnosis.first_empty_field(), Some("empatheticSummary"));
    }
}
