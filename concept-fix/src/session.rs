use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::diagnosis::{Diagnosis, Evaluation};
use crate::gateway::ModelGateway;

/// The one message shown to the learner for any gateway failure. The error
/// kind is logged internally but never distinguished in the UI.
pub const GENERIC_FAILURE_MESSAGE: &str =
    "Unable to complete diagnosis. Please try again or check your connection.";

/// Phase of the diagnostic cycle, as exposed to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Diagnosing,
    Diagnosed,
    Verifying,
    Verified,
}

/// Session state as a tagged union: each phase carries exactly the data that
/// is valid for it, so combinations like "loading with an error set" cannot
/// be represented.
#[derive(Debug, Clone)]
enum State {
    Idle {
        error: Option<String>,
    },
    Diagnosing {
        query: String,
    },
    Diagnosed {
        query: String,
        diagnosis: Diagnosis,
        // Holds a failed-verification message; the diagnosis survives it.
        error: Option<String>,
    },
    Verifying {
        query: String,
        diagnosis: Diagnosis,
    },
    Verified {
        query: String,
        diagnosis: Diagnosis,
        evaluation: Evaluation,
    },
}

impl State {
    fn phase(&self) -> Phase {
        match self {
            State::Idle { .. } => Phase::Idle,
            State::Diagnosing { .. } => Phase::Diagnosing,
            State::Diagnosed { .. } => Phase::Diagnosed,
            State::Verifying { .. } => Phase::Verifying,
            State::Verified { .. } => Phase::Verified,
        }
    }
}

/// Rejected operations. The state is left untouched when one of these is
/// returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("input is empty")]
    EmptyInput,

    #[error("{action} is not valid while the session is {phase:?}")]
    InvalidTransition { action: &'static str, phase: Phase },
}

/// Read-only snapshot of a session for the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<Diagnosis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Evaluation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Sequences the two-step diagnostic protocol: query -> diagnosis -> answer
/// -> evaluation, with an explicit retry path for incorrect answers.
///
/// All mutation goes through `&mut self`, so a session can never have two
/// gateway calls in flight; callers that share a session across tasks must
/// serialize access themselves (the service does so with a per-session mutex).
/// Every transition is also published on a watch channel so observers can see
/// the in-flight phases without touching the controller.
pub struct SessionController {
    gateway: Arc<dyn ModelGateway>,
    state: State,
    view_tx: watch::Sender<SessionView>,
}

impl SessionController {
    pub fn new(gateway: Arc<dyn ModelGateway>) -> Self {
        let (view_tx, _) = watch::channel(SessionView {
            phase: Phase::Idle,
            query: None,
            diagnosis: None,
            evaluation: None,
            error_message: None,
        });
        Self {
            gateway,
            state: State::Idle { error: None },
            view_tx,
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Live feed of the session view, updated on every transition. Receivers
    /// observe `Diagnosing`/`Verifying` while a call is running, without
    /// taking any lock on the controller.
    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view_tx.subscribe()
    }

    fn set_state(&mut self, state: State) {
        self.state = state;
        let _ = self.view_tx.send(self.view());
    }

    /// An in-flight phase found at entry to a `&mut self` method means the
    /// future driving that call was dropped before it settled (a live call
    /// would still hold the caller's exclusive access, as when an HTTP client
    /// disconnects mid-request). Roll back to the last stable phase so the
    /// session stays usable.
    fn settle_abandoned_call(&mut self) {
        match &self.state {
            State::Diagnosing { .. } => {
                warn!("diagnosis call was abandoned before settling; resetting to idle");
                self.set_state(State::Idle { error: None });
            }
            State::Verifying { query, diagnosis } => {
                warn!("evaluation call was abandoned before settling; diagnosis retained");
                let (query, diagnosis) = (query.clone(), diagnosis.clone());
                self.set_state(State::Diagnosed {
                    query,
                    diagnosis,
                    error: None,
                });
            }
            _ => {}
        }
    }

    /// Starts a fresh diagnostic cycle. Valid from any settled phase; any
    /// held diagnosis, evaluation, or error is discarded before the call.
    pub async fn submit_query(&mut self, text: &str) -> Result<(), SessionError> {
        let query = text.trim();
        if query.is_empty() {
            return Err(SessionError::EmptyInput);
        }
        self.settle_abandoned_call();

        self.set_state(State::Diagnosing {
            query: query.to_string(),
        });

        match self.gateway.request_diagnosis(query).await {
            Ok(diagnosis) => {
                info!(root_cause = %diagnosis.root_cause_code.label(), "session diagnosed");
                self.set_state(State::Diagnosed {
                    query: query.to_string(),
                    diagnosis,
                    error: None,
                });
            }
            Err(e) => {
                warn!(error = %e, "diagnosis failed");
                self.set_state(State::Idle {
                    error: Some(GENERIC_FAILURE_MESSAGE.to_string()),
                });
            }
        }
        Ok(())
    }

    /// Submits an answer to the held diagnosis's check question. Valid only
    /// from `Diagnosed` (including after a failed verification). On failure
    /// the diagnosis is kept so the learner can retry without re-diagnosing.
    pub async fn submit_answer(&mut self, text: &str) -> Result<(), SessionError> {
        let answer = text.trim();
        if answer.is_empty() {
            return Err(SessionError::EmptyInput);
        }
        self.settle_abandoned_call();
        let (query, diagnosis) = match &self.state {
            State::Diagnosed { query, diagnosis, .. } => (query.clone(), diagnosis.clone()),
            other => {
                return Err(SessionError::InvalidTransition {
                    action: "submit_answer",
                    phase: other.phase(),
                });
            }
        };

        self.set_state(State::Verifying {
            query: query.clone(),
            diagnosis: diagnosis.clone(),
        });

        match self
            .gateway
            .request_evaluation(&query, &diagnosis, answer)
            .await
        {
            Ok(evaluation) => {
                info!(is_correct = evaluation.is_correct, "answer evaluated");
                self.set_state(State::Verified {
                    query,
                    diagnosis,
                    evaluation,
                });
            }
            Err(e) => {
                warn!(error = %e, "evaluation failed");
                self.set_state(State::Diagnosed {
                    query,
                    diagnosis,
                    error: Some(GENERIC_FAILURE_MESSAGE.to_string()),
                });
            }
        }
        Ok(())
    }

    /// Discards an incorrect evaluation and re-opens the answer step. Valid
    /// only from `Verified` with `is_correct == false`; the diagnosis is
    /// retained unchanged.
    pub fn retry(&mut self) -> Result<(), SessionError> {
        self.settle_abandoned_call();
        match &self.state {
            State::Verified {
                query,
                diagnosis,
                evaluation,
            } if !evaluation.is_correct => {
                let (query, diagnosis) = (query.clone(), diagnosis.clone());
                self.set_state(State::Diagnosed {
                    query,
                    diagnosis,
                    error: None,
                });
                Ok(())
            }
            other => Err(SessionError::InvalidTransition {
                action: "retry",
                phase: other.phase(),
            }),
        }
    }

    pub fn view(&self) -> SessionView {
        match &self.state {
            State::Idle { error } => SessionView {
                phase: Phase::Idle,
                query: None,
                diagnosis: None,
                evaluation: None,
                error_message: error.clone(),
            },
            State::Diagnosing { query } => SessionView {
                phase: Phase::Diagnosing,
                query: Some(query.clone()),
                diagnosis: None,
                evaluation: None,
                error_message: None,
            },
            State::Diagnosed {
                query,
                diagnosis,
                error,
            } => SessionView {
                phase: Phase::Diagnosed,
                query: Some(query.clone()),
                diagnosis: Some(diagnosis.clone()),
                evaluation: None,
                error_message: error.clone(),
            },
            State::Verifying { query, diagnosis } => SessionView {
                phase: Phase::Verifying,
                query: Some(query.clone()),
                diagnosis: Some(diagnosis.clone()),
                evaluation: None,
                error_message: None,
            },
            State::Verified {
                query,
                diagnosis,
                evaluation,
            } => SessionView {
                phase: Phase::Verified,
                query: Some(query.clone()),
                diagnosis: Some(diagnosis.clone()),
                evaluation: Some(evaluation.clone()),
                error_message: None,
            },
        }
    }
}
