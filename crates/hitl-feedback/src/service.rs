//! Request routing for the feedback HTTP service.
//!
//! Routing is transport-free: the binary owns the socket and hands each
//! parsed request line to [`route`].

use hitl_optimizer::{Study, Trial, TrialState};
use hitl_types::{validation_error, ArtifactError, FeedbackError, HitlError, HitlResult, StorageError};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::artifact::{find_artifact, get_artifact_path, list_artifacts, ArtifactBackend};
use crate::note::get_note;
use crate::scoring::{score_trial, skip_trial};
use crate::widgets::{registered_widgets, ObjectiveFormWidget, WidgetResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
}

impl Request {
    /// Parse the request line (`GET /api/trials?state=running HTTP/1.1`)
    /// from the head of an HTTP request.
    pub fn parse(head: &str) -> Option<Self> {
        let line = head.lines().next()?;
        let mut parts = line.split_whitespace();
        let method = match parts.next()? {
            "GET" => Method::Get,
            "POST" => Method::Post,
            _ => return None,
        };
        let target = parts.next()?;
        if !target.starts_with('/') {
            return None;
        }
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (target.to_string(), None),
        };
        Some(Self {
            method,
            path,
            query,
        })
    }

    fn query_param(&self, key: &str) -> Option<&str> {
        self.query.as_deref()?.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == key).then_some(v)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl Response {
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json".to_string(),
            body: value.to_string().into_bytes(),
        }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self::json(status, &json!({ "error": message.into() }))
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::error(400, message)
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            409 => "Conflict",
            _ => "Internal Server Error",
        }
    }

    /// Serialise as an HTTP/1.1 response with `Connection: close`.
    pub fn to_http_bytes(&self) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status,
            self.reason(),
            self.content_type,
            self.body.len()
        )
        .into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

fn status_for(err: &HitlError) -> u16 {
    match err {
        HitlError::Storage(StorageError::TrialNotFound { .. })
        | HitlError::Storage(StorageError::StudyNotFound { .. })
        | HitlError::Artifact(ArtifactError::NotFound { .. }) => 404,
        HitlError::Storage(StorageError::TrialAlreadyFinished { .. })
        | HitlError::Feedback(FeedbackError::WidgetsNotRegistered { .. })
        | HitlError::Feedback(FeedbackError::TrialNotPresented { .. }) => 409,
        HitlError::Artifact(ArtifactError::InvalidId { .. })
        | HitlError::Feedback(_)
        | HitlError::Validation(_) => 400,
        _ => 500,
    }
}

impl From<HitlError> for Response {
    fn from(err: HitlError) -> Self {
        let status = status_for(&err);
        if status == 500 {
            warn!(error = %err, "request failed");
        }
        Self::error(status, err.to_string())
    }
}

#[derive(Debug, Serialize)]
struct ArtifactView {
    artifact_id: String,
    filename: String,
    mimetype: String,
    path: String,
}

#[derive(Debug, Serialize)]
struct TrialView<'a> {
    number: usize,
    state: TrialState,
    value: Option<f64>,
    params: &'a hitl_optimizer::Params,
    note: Option<String>,
    artifacts: Vec<ArtifactView>,
}

fn trial_view(trial: &Trial) -> HitlResult<serde_json::Value> {
    let note = match get_note(trial) {
        Ok(note) => note.map(|n| n.body),
        Err(e) => {
            warn!(trial = trial.number, error = %e, "unreadable note");
            None
        }
    };
    let artifacts = list_artifacts(trial)
        .into_iter()
        .map(|meta| ArtifactView {
            path: get_artifact_path(trial, &meta.artifact_id),
            artifact_id: meta.artifact_id,
            filename: meta.filename,
            mimetype: meta.mimetype,
        })
        .collect();
    Ok(serde_json::to_value(TrialView {
        number: trial.number,
        state: trial.state,
        value: trial.value,
        params: &trial.parameters,
        note,
        artifacts,
    })?)
}

/// Handle one request against `study`.
pub fn route(study: &mut Study, backend: &dyn ArtifactBackend, request: &Request) -> Response {
    debug!(method = ?request.method, path = %request.path, "feedback request");
    let segments: Vec<&str> = request
        .path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    let result = match (request.method, segments.as_slice()) {
        (Method::Get, ["api", "study"]) => study_summary(study),
        (Method::Get, ["api", "trials"]) => list_trials(study, request),
        (Method::Get, ["api", "trials", number]) => {
            with_number(number, |n| trial_view(&study.get_trial(n)?))
        }
        (Method::Post, ["api", "trials", number, "choice", index]) => {
            let Ok(index) = index.parse::<usize>() else {
                return Response::bad_request(format!("invalid choice index '{index}'"));
            };
            with_number(number, |n| {
                let (trial, _) = score_trial(study, n, &WidgetResponse::Choice(index))?;
                trial_view(&trial)
            })
        }
        (Method::Post, ["api", "trials", number, "value", value]) => {
            let Ok(value) = value.parse::<f64>() else {
                return Response::bad_request(format!("invalid value '{value}'"));
            };
            with_number(number, |n| {
                let (trial, _) = score_trial(study, n, &WidgetResponse::Value(value))?;
                trial_view(&trial)
            })
        }
        (Method::Post, ["api", "trials", number, "skip"]) => with_number(number, |n| {
            let (trial, _) = skip_trial(study, n)?;
            trial_view(&trial)
        }),
        (Method::Get, ["artifacts", study_id, trial_id, artifact_id]) => {
            return serve_artifact(study, backend, study_id, trial_id, artifact_id);
        }
        (_, ["api", ..]) | (_, ["artifacts", ..]) => {
            return Response::error(405, "method not allowed for this path")
        }
        _ => return Response::error(404, format!("no route for {}", request.path)),
    };

    match result {
        Ok(Some(body)) => Response::json(200, &body),
        Ok(None) => Response::bad_request("trial number must be a non-negative integer"),
        Err(err) => err.into(),
    }
}

/// `Ok(None)` when the path carried a malformed trial number.
type RouteResult = HitlResult<Option<serde_json::Value>>;

fn with_number(raw: &str, f: impl FnOnce(usize) -> HitlResult<serde_json::Value>) -> RouteResult {
    match raw.parse::<usize>() {
        Ok(n) => f(n).map(Some),
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Serialize)]
struct StudySummary {
    id: String,
    name: String,
    direction: &'static str,
    metric_names: Vec<String>,
    n_trials: usize,
    n_running: usize,
    best_trial: Option<serde_json::Value>,
    objective_form_widgets: Vec<ObjectiveFormWidget>,
}

fn study_summary(study: &Study) -> RouteResult {
    let trials = study.trials(None)?;
    let summary = StudySummary {
        id: study.id().to_string(),
        name: study.name().to_string(),
        direction: study.direction().as_str(),
        metric_names: study.metric_names()?,
        n_trials: trials.len(),
        n_running: trials.iter().filter(|t| t.state == TrialState::Running).count(),
        best_trial: study.best_trial()?.as_ref().map(trial_view).transpose()?,
        objective_form_widgets: registered_widgets(study).unwrap_or_default(),
    };
    Ok(Some(serde_json::to_value(summary)?))
}

fn list_trials(study: &Study, request: &Request) -> RouteResult {
    let trials = match request.query_param("state") {
        None => study.trials(None)?,
        Some(raw) => match TrialState::parse(raw) {
            Some(state) => study.trials(Some(&[state]))?,
            None => {
                return Err(validation_error!("unknown trial state '{raw}'"));
            }
        },
    };
    let views = trials.iter().map(trial_view).collect::<HitlResult<Vec<_>>>()?;
    Ok(Some(serde_json::Value::Array(views)))
}

fn serve_artifact(
    study: &Study,
    backend: &dyn ArtifactBackend,
    study_id: &str,
    trial_id: &str,
    artifact_id: &str,
) -> Response {
    let not_found = || Response::error(404, format!("artifact {artifact_id} not found"));
    if study_id != study.id().to_string() {
        return not_found();
    }
    let trials = match study.trials(None) {
        Ok(trials) => trials,
        Err(err) => return err.into(),
    };
    let Some(trial) = trials.iter().find(|t| t.id.to_string() == trial_id) else {
        return not_found();
    };
    let Some(meta) = find_artifact(trial, artifact_id) else {
        return not_found();
    };
    match backend.read(artifact_id) {
        Ok(body) => Response {
            status: 200,
            content_type: meta.mimetype,
            body,
        },
        Err(err) => err.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{upload_artifact, FileSystemBackend};
    use crate::note::{save_note, trial_note_template};
    use crate::widgets::register_objective_form_widgets;
    use hitl_optimizer::{InMemoryStorage, SearchSpace, StudyConfig, StudyStorage};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        study: Study,
        backend: FileSystemBackend,
        artifact_path: String,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage: Arc<dyn StudyStorage> = Arc::new(InMemoryStorage::new());
        let mut study = Study::create(&StudyConfig::default(), storage).unwrap();
        study
            .set_metric_names(&["Do you like this color?".to_string()])
            .unwrap();
        register_objective_form_widgets(&study, &[ObjectiveFormWidget::rating()]).unwrap();
        study.ask(&SearchSpace::rgb()).unwrap();
        study.ask(&SearchSpace::rgb()).unwrap();

        let backend = FileSystemBackend::new(dir.path().join("artifact")).unwrap();
        let local = dir.path().join("img.png");
        std::fs::write(&local, b"png-bytes").unwrap();
        let id = upload_artifact(&backend, &study, 0, &local).unwrap();
        let trial = study.get_trial(0).unwrap();
        let artifact_path = get_artifact_path(&trial, &id);
        save_note(&study, 0, &trial_note_template(0, &artifact_path)).unwrap();

        Fixture {
            _dir: dir,
            study,
            backend,
            artifact_path,
        }
    }

    fn call(f: &mut Fixture, head: &str) -> Response {
        let request = Request::parse(head).unwrap();
        route(&mut f.study, &f.backend, &request)
    }

    fn body(response: &Response) -> serde_json::Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    #[test]
    fn parses_request_line() {
        let request = Request::parse("POST /api/trials/3/choice/0 HTTP/1.1\r\nHost: x\r\n").unwrap();
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.path, "/api/trials/3/choice/0");
        assert_eq!(request.query, None);

        let request = Request::parse("GET /api/trials?state=running HTTP/1.1").unwrap();
        assert_eq!(request.query_param("state"), Some("running"));

        assert!(Request::parse("DELETE / HTTP/1.1").is_none());
        assert!(Request::parse("").is_none());
    }

    #[test]
    fn lists_running_trials_with_notes() {
        let mut f = fixture();
        let response = call(&mut f, "GET /api/trials?state=running HTTP/1.1");
        assert_eq!(response.status, 200);
        let trials = body(&response);
        assert_eq!(trials.as_array().unwrap().len(), 2);
        assert_eq!(trials[0]["state"], "running");
        assert_eq!(
            trials[0]["note"],
            format!("## Trial 0\n\n![generated-image]({})\n", f.artifact_path)
        );
        assert_eq!(trials[0]["artifacts"][0]["path"], f.artifact_path.as_str());
        assert!(trials[1]["note"].is_null());
    }

    #[test]
    fn choice_scores_trial() {
        let mut f = fixture();
        let response = call(&mut f, "POST /api/trials/0/choice/0 HTTP/1.1");
        assert_eq!(response.status, 200);
        assert_eq!(body(&response)["value"], -1.0);

        let again = call(&mut f, "POST /api/trials/0/choice/0 HTTP/1.1");
        assert_eq!(again.status, 200);

        let conflict = call(&mut f, "POST /api/trials/0/choice/2 HTTP/1.1");
        assert_eq!(conflict.status, 409);

        let running = body(&call(&mut f, "GET /api/trials?state=running HTTP/1.1"));
        assert_eq!(running.as_array().unwrap().len(), 1);
    }

    #[test]
    fn error_statuses() {
        let mut f = fixture();
        assert_eq!(call(&mut f, "GET /api/trials/42 HTTP/1.1").status, 404);
        assert_eq!(call(&mut f, "GET /api/trials/abc HTTP/1.1").status, 400);
        assert_eq!(call(&mut f, "POST /api/trials/1/choice/7 HTTP/1.1").status, 400);
        assert_eq!(call(&mut f, "POST /api/trials/1/value/0.5 HTTP/1.1").status, 400);
        // Trial 1 never got an image or note.
        assert_eq!(call(&mut f, "POST /api/trials/1/choice/0 HTTP/1.1").status, 409);
        assert_eq!(call(&mut f, "POST /api/trials/1/skip HTTP/1.1").status, 200);
        assert_eq!(call(&mut f, "GET /api/trials?state=waiting HTTP/1.1").status, 400);
        assert_eq!(call(&mut f, "POST /api/study HTTP/1.1").status, 405);
        assert_eq!(call(&mut f, "GET /favicon.ico HTTP/1.1").status, 404);
    }

    #[test]
    fn skip_marks_failed() {
        let mut f = fixture();
        let response = call(&mut f, "POST /api/trials/1/skip HTTP/1.1");
        assert_eq!(response.status, 200);
        assert_eq!(body(&response)["state"], "failed");
    }

    #[test]
    fn serves_artifact_bytes() {
        let mut f = fixture();
        let head = format!("GET {} HTTP/1.1", f.artifact_path);
        let response = call(&mut f, &head);
        assert_eq!(response.status, 200);
        assert_eq!(response.content_type, "image/png");
        assert_eq!(response.body, b"png-bytes");

        let missing = format!("GET /artifacts/{}/nope/nope HTTP/1.1", f.study.id());
        assert_eq!(call(&mut f, &missing).status, 404);
    }

    #[test]
    fn study_summary_reports_counts() {
        let mut f = fixture();
        let summary = body(&call(&mut f, "GET /api/study HTTP/1.1"));
        assert_eq!(summary["name"], "Human-in-the-loop Optimization");
        assert_eq!(summary["n_trials"], 2);
        assert_eq!(summary["n_running"], 2);
        assert_eq!(summary["metric_names"][0], "Do you like this color?");
        assert!(summary["best_trial"].is_null());
    }

    #[test]
    fn http_bytes_have_length_header() {
        let bytes = Response::json(200, &json!({"ok": true})).to_http_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.ends_with("{\"ok\":true}"));
    }
}
