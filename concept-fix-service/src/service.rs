use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Mutex, watch};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use concept_fix::{ModelGateway, SessionController, SessionError, SessionView};

type ApiResult<T> = Result<Json<T>, ApiError>;
type ApiError = (StatusCode, Json<Value>);

fn bad_request_error(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn not_found_error(message: &str, id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": message,
            "session_id": id
        })),
    )
}

fn conflict_error(message: &str) -> ApiError {
    (StatusCode::CONFLICT, Json(json!({ "error": message })))
}

fn session_error_response(error: SessionError) -> ApiError {
    match error {
        SessionError::EmptyInput => bad_request_error("input must not be empty"),
        SessionError::InvalidTransition { .. } => conflict_error(&error.to_string()),
    }
}

/// One live session: the controller behind its serializing mutex, plus the
/// controller's view feed so reads never contend with an in-flight call.
#[derive(Clone)]
struct SessionEntry {
    controller: Arc<Mutex<SessionController>>,
    views: watch::Receiver<SessionView>,
}

#[derive(Clone)]
pub struct AppState {
    sessions: Arc<DashMap<String, SessionEntry>>,
    gateway: Arc<dyn ModelGateway>,
}

impl AppState {
    pub fn new(gateway: Arc<dyn ModelGateway>) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            gateway,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DiagnoseRequest {
    session_id: Option<String>,
    query: String,
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    session_id: String,
    answer: String,
}

#[derive(Debug, Deserialize)]
struct RetryRequest {
    session_id: String,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    session_id: String,
    #[serde(flatten)]
    view: SessionView,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/diagnose", post(diagnose))
        .route("/api/verify", post(verify))
        .route("/api/retry", post(retry))
        .route("/api/session/{id}", get(get_session))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

/// Looks up an existing session, enforcing the id rules: a provided id must
/// parse as a UUID and must be known.
fn resolve_session(state: &AppState, session_id: &str) -> Result<SessionEntry, ApiError> {
    if Uuid::parse_str(session_id).is_err() {
        return Err(bad_request_error("invalid session id format"));
    }
    state
        .sessions
        .get(session_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| not_found_error("session not found", session_id))
}

fn new_session_entry(state: &AppState) -> SessionEntry {
    let controller = SessionController::new(state.gateway.clone());
    let views = controller.subscribe();
    SessionEntry {
        controller: Arc::new(Mutex::new(controller)),
        views,
    }
}

async fn diagnose(
    State(state): State<AppState>,
    Json(request): Json<DiagnoseRequest>,
) -> ApiResult<SessionResponse> {
    let (session_id, entry) = match &request.session_id {
        Some(id) => (id.clone(), resolve_session(&state, id)?),
        None => {
            let id = Uuid::new_v4().to_string();
            let entry = new_session_entry(&state);
            state.sessions.insert(id.clone(), entry.clone());
            info!(session_id = %id, "created new session");
            (id, entry)
        }
    };

    // try_lock, not lock: a contended session has a call in flight, and
    // submissions are rejected rather than queued while one is running.
    let mut guard = entry
        .controller
        .try_lock()
        .map_err(|_| conflict_error("a model call is already in flight"))?;

    guard
        .submit_query(&request.query)
        .await
        .map_err(session_error_response)?;

    Ok(Json(SessionResponse {
        session_id,
        view: guard.view(),
    }))
}

async fn verify(
    State(state): State<AppState>,
    Json(request): Json<VerifyRequest>,
) -> ApiResult<SessionResponse> {
    let entry = resolve_session(&state, &request.session_id)?;

    let mut guard = entry
        .controller
        .try_lock()
        .map_err(|_| conflict_error("a model call is already in flight"))?;

    guard
        .submit_answer(&request.answer)
        .await
        .map_err(session_error_response)?;

    Ok(Json(SessionResponse {
        session_id: request.session_id,
        view: guard.view(),
    }))
}

async fn retry(
    State(state): State<AppState>,
    Json(request): Json<RetryRequest>,
) -> ApiResult<SessionResponse> {
    let entry = resolve_session(&state, &request.session_id)?;

    let mut guard = entry
        .controller
        .try_lock()
        .map_err(|_| conflict_error("a model call is already in flight"))?;

    guard.retry().map_err(session_error_response)?;

    Ok(Json(SessionResponse {
        session_id: request.session_id,
        view: guard.view(),
    }))
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<SessionResponse> {
    let entry = resolve_session(&state, &session_id)?;

    // Read from the view feed, not the controller: a busy session reports
    // its in-flight phase instead of blocking until the call settles.
    let view = entry.views.borrow().clone();

    Ok(Json(SessionResponse {
        session_id,
        view,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use concept_fix::{Diagnosis, Evaluation, GatewayError, Phase, RootCause};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::oneshot;

    enum Reply {
        Diagnosis(Result<Diagnosis, GatewayError>),
        Gated(oneshot::Receiver<Result<Diagnosis, GatewayError>>),
    }

    struct ScriptedGateway {
        replies: StdMutex<VecDeque<Reply>>,
    }

    #[async_trait]
    impl ModelGateway for ScriptedGateway {
        async fn request_diagnosis(&self, _query: &str) -> Result<Diagnosis, GatewayError> {
            let next = self.replies.lock().unwrap().pop_front();
            match next {
                Some(Reply::Diagnosis(result)) => result,
                Some(Reply::Gated(gate)) => gate.await.expect("gate closed"),
                None => panic!("unexpected request_diagnosis"),
            }
        }

        async fn request_evaluation(
            &self,
            _query: &str,
            _diagnosis: &Diagnosis,
            _answer: &str,
        ) -> Result<Evaluation, GatewayError> {
            panic!("unexpected request_evaluation")
        }
    }

    fn test_state(replies: Vec<Reply>) -> AppState {
        AppState::new(Arc::new(ScriptedGateway {
            replies: StdMutex::new(replies.into()),
        }))
    }

    fn sample_diagnosis() -> Diagnosis {
        Diagnosis {
            root_cause_code: RootCause::PartialUnderstanding,
            root_cause_explanation: "Partial Understanding".into(),
            empathetic_summary: "The pieces are there, the connection is not.".into(),
            prescribed_fix: "Walk the chain from X to Y one link at a time.".into(),
            check_question: "How does X lead to Y?".into(),
        }
    }

    #[tokio::test]
    async fn busy_session_reports_in_flight_phase_and_rejects_submissions() {
        let (gate, gated) = oneshot::channel();
        let state = test_state(vec![
            Reply::Diagnosis(Ok(sample_diagnosis())),
            Reply::Gated(gated),
        ]);

        let created = diagnose(
            State(state.clone()),
            Json(DiagnoseRequest {
                session_id: None,
                query: "first concept".into(),
            }),
        )
        .await
        .expect("session created")
        .0;
        let session_id = created.session_id;

        let slow = diagnose(
            State(state.clone()),
            Json(DiagnoseRequest {
                session_id: Some(session_id.clone()),
                query: "second concept".into(),
            }),
        );
        let observer = async {
            // The slow call is parked on the gate; reads see its phase live
            // and further submissions are turned away.
            let live = get_session(State(state.clone()), Path(session_id.clone()))
                .await
                .expect("live view")
                .0;
            assert_eq!(live.view.phase, Phase::Diagnosing);

            let rejected = diagnose(
                State(state.clone()),
                Json(DiagnoseRequest {
                    session_id: Some(session_id.clone()),
                    query: "third concept".into(),
                }),
            )
            .await;
            assert_eq!(rejected.unwrap_err().0, StatusCode::CONFLICT);

            gate.send(Ok(sample_diagnosis())).unwrap();
        };

        let (settled, _) = tokio::join!(slow, observer);
        assert_eq!(settled.expect("slow call settles").0.view.phase, Phase::Diagnosed);
    }
}
