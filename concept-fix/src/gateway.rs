use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use rig::providers::openrouter;
use tracing::{debug, info};

use crate::diagnosis::{Diagnosis, Evaluation};
use crate::error::{GatewayError, Result};

/// Default model id, routed through OpenRouter. Override with CONCEPT_FIX_MODEL.
pub const DEFAULT_MODEL: &str = "google/gemini-2.5-flash";

// Slightly creative so analogies vary, low enough to classify consistently.
const DIAGNOSIS_TEMPERATURE: f64 = 0.4;
const EVALUATION_TEMPERATURE: f64 = 0.3;

const DIAGNOSIS_PROMPT: &str = r#"You are ConceptFix, a cognitive diagnostic specialist. Your goal is to pinpoint and resolve the exact root cause of a student's confusion on any subject before providing any instruction.

PROTOCOL: DIAGNOSE, THEN FIX

1. Analyze: the user states a concept they studied but still don't understand.
2. Diagnose exactly one root cause:
    * MP  (Missing Prerequisite): missing a fundamental prior concept.
    * WMM (Wrong Mental Model): flawed understanding of a core principle.
    * LC  (Language Confusion): confused by specific jargon.
    * PU  (Partial Understanding): understands parts but not the connection.
3. Summarize empathetically what they understand versus where the gap is.
4. Prescribe a targeted fix focused ONLY on the missing element. Use analogies.
5. Ask a check question requiring them to re-explain the concept in their own words.

Respond with ONLY this JSON, no other text:
{
  "rootCauseCode": "MP" | "WMM" | "LC" | "PU",
  "rootCauseExplanation": "short label for the root cause, e.g. 'Wrong Mental Model'",
  "empatheticSummary": "what they understand vs where the gap is",
  "prescribedFix": "the targeted one-paragraph explanation or analogy",
  "checkQuestion": "ask the student to re-explain in their own words"
}
All five fields are required and must be non-empty.
"#;

const EVALUATION_PROMPT: &str = r#"You are a supportive tutor evaluating a student's answer to a check question derived from a diagnosis.

Context:
1. The student was confused about a concept.
2. A specific root cause was diagnosed.
3. A targeted fix was provided.
4. A check question was asked to verify understanding.

Determine whether the student's answer demonstrates they have grasped the specific missing element or corrected the mental model. Judge the core idea, not exact wording.

Respond with ONLY this JSON, no other text:
{
  "isCorrect": true/false,
  "feedback": "one or two sentences; validate warmly if correct, otherwise gently point out what is still missing based on the original fix"
}
Both fields are required.
"#;

/// Sole boundary between the application and the external generative model.
/// Both prompt templates and both response schemas live behind this seam, so
/// the provider is swappable and the controller is testable without a network.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn request_diagnosis(&self, query: &str) -> Result<Diagnosis>;

    async fn request_evaluation(
        &self,
        query: &str,
        diagnosis: &Diagnosis,
        answer: &str,
    ) -> Result<Evaluation>;
}

/// Gateway backed by OpenRouter via rig. Stateless: the credential is read and
/// the agent is rebuilt on every call.
pub struct OpenRouterGateway {
    model: String,
}

impl OpenRouterGateway {
    pub fn new(model: impl Into<String>) -> Self {
        Self { model: model.into() }
    }

    /// Model id from CONCEPT_FIX_MODEL, falling back to [`DEFAULT_MODEL`].
    pub fn from_env() -> Self {
        let model =
            std::env::var("CONCEPT_FIX_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Self::new(model)
    }

    fn agent(
        &self,
        preamble: &str,
        temperature: f64,
    ) -> Result<rig::agent::Agent<openrouter::CompletionModel>> {
        let api_key =
            std::env::var("OPENROUTER_API_KEY").map_err(|_| GatewayError::MissingApiKey)?;
        let client = openrouter::Client::new(&api_key);
        Ok(client
            .agent(&self.model)
            .preamble(preamble)
            .temperature(temperature)
            .build())
    }
}

#[async_trait]
impl ModelGateway for OpenRouterGateway {
    async fn request_diagnosis(&self, query: &str) -> Result<Diagnosis> {
        let agent = self.agent(DIAGNOSIS_PROMPT, DIAGNOSIS_TEMPERATURE)?;

        debug!(model = %self.model, query_length = query.len(), "requesting diagnosis");
        let raw = agent
            .prompt(query.trim())
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;

        let diagnosis = parse_diagnosis(&raw)?;
        info!(root_cause = %diagnosis.root_cause_code.label(), "diagnosis received");
        Ok(diagnosis)
    }

    async fn request_evaluation(
        &self,
        query: &str,
        diagnosis: &Diagnosis,
        answer: &str,
    ) -> Result<Evaluation> {
        let agent = self.agent(EVALUATION_PROMPT, EVALUATION_TEMPERATURE)?;

        let prompt = format!(
            r#"Original Confusion: "{}"
Root Cause: {}
Fix Provided: "{}"
Check Question: "{}"
Student Answer: "{}""#,
            query.trim(),
            diagnosis.root_cause_explanation,
            diagnosis.prescribed_fix,
            diagnosis.check_question,
            answer.trim(),
        );

        debug!(model = %self.model, answer_length = answer.len(), "requesting evaluation");
        let raw = agent
            .prompt(prompt)
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;

        let evaluation = parse_evaluation(&raw)?;
        info!(is_correct = evaluation.is_correct, "evaluation received");
        Ok(evaluation)
    }
}

/// Strips a markdown code fence if the model wrapped its JSON in one.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim()
}

/// Parses and validates a diagnosis payload. Any missing field, unknown root
/// cause code, or empty text field is a schema violation.
fn parse_diagnosis(raw: &str) -> Result<Diagnosis> {
    if raw.trim().is_empty() {
        return Err(GatewayError::EmptyResponse);
    }
    let cleaned = strip_code_fences(raw);
    let diagnosis: Diagnosis = serde_json::from_str(cleaned)
        .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;
    if let Some(field) = diagnosis.first_empty_field() {
        return Err(GatewayError::MalformedResponse(format!(
            "field {} is empty",
            field
        )));
    }
    Ok(diagnosis)
}

/// Parses and validates an evaluation payload.
fn parse_evaluation(raw: &str) -> Result<Evaluation> {
    if raw.trim().is_empty() {
        return Err(GatewayError::EmptyResponse);
    }
    let cleaned = strip_code_fences(raw);
    let evaluation: Evaluation = serde_json::from_str(cleaned)
        .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;
    if evaluation.feedback.trim().is_empty() {
        return Err(GatewayError::MalformedResponse(
            "field feedback is empty".to_string(),
        ));
    }
    Ok(evaluation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnosis::RootCause;

    const VALID_DIAGNOSIS: &str = r#"{
        "rootCauseCode": "WMM",
        "rootCauseExplanation": "Wrong Mental Model",
        "empatheticSummary": "You follow the steps but picture the process backwards.",
        "prescribedFix": "Think of it like water finding its own level.",
        "checkQuestion": "Explain Y in your own words."
    }"#;

    #[test]
    fn parses_valid_diagnosis() {
        let diagnosis = parse_diagnosis(VALID_DIAGNOSIS).unwrap();
        assert_eq!(diagnosis.root_cause_code, RootCause::WrongMentalModel);
        assert_eq!(diagnosis.check_question, "Explain Y in your own words.");
    }

    #[test]
    fn parses_diagnosis_wrapped_in_code_fence() {
        let fenced = format!("```json\n{}\n```", VALID_DIAGNOSIS);
        assert!(parse_diagnosis(&fenced).is_ok());
        let bare_fence = format!("```\n{}\n```", VALID_DIAGNOSIS);
        assert!(parse_diagnosis(&bare_fence).is_ok());
    }

    #[test]
    fn empty_reply_is_empty_response() {
        assert!(matches!(
            parse_diagnosis("   \n"),
            Err(GatewayError::EmptyResponse)
        ));
    }

    #[test]
    fn unknown_root_cause_code_is_malformed() {
        let raw = VALID_DIAGNOSIS.replace("WMM", "SOMETHING_ELSE");
        assert!(matches!(
            parse_diagnosis(&raw),
            Err(GatewayError::MalformedResponse(_))
        ));
    }

    #[test]
    fn missing_field_is_malformed() {
        let raw = r#"{"rootCauseCode": "MP", "rootCauseExplanation": "Missing Prerequisite"}"#;
        assert!(matches!(
            parse_diagnosis(raw),
            Err(GatewayError::MalformedResponse(_))
        ));
    }

    #[test]
    fn empty_field_is_malformed() {
        let raw = VALID_DIAGNOSIS.replace("Explain Y in your own words.", "  ");
        assert!(matches!(
            parse_diagnosis(&raw),
            Err(GatewayError::MalformedResponse(_))
        ));
    }

    #[test]
    fn parses_valid_evaluation() {
        let raw = r#"{"isCorrect": true, "feedback": "Exactly right, well put."}"#;
        let evaluation = parse_evaluation(raw).unwrap();
        assert!(evaluation.is_correct);
        assert_eq!(evaluation.feedback, "Exactly right, well put.");
    }

    #[test]
    fn evaluation_with_blank_feedback_is_malformed() {
        let raw = r#"{"isCorrect": false, "feedback": ""}"#;
        assert!(matches!(
            parse_evaluation(raw),
            Err(GatewayError::MalformedResponse(_))
        ));
    }

    #[test]
    fn evaluation_with_non_boolean_verdict_is_malformed() {
        let raw = r#"{"isCorrect": "yes", "feedback": "Good try."}"#;
        assert!(matches!(
            parse_evaluation(raw),
            Err(GatewayError::MalformedResponse(_))
        ));
    }
}
