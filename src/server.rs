use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::credits::{self, LedgerEntry};
use crate::database::{self, Character, Comic, Scene};
use crate::error::PipelineError;
use crate::pipeline::{ComicPipeline, GenerateRequest, ProgressEvent, ProgressSink};
use crate::render::ImageSynthesizer;

#[derive(Clone)]
pub struct AppState {
    pub db: Pool<Sqlite>,
    pub pipeline: Arc<ComicPipeline>,
    pub synthesizer: Arc<dyn ImageSynthesizer>,
    pub jobs: Arc<DashMap<String, CancellationToken>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/comics/generate", post(generate))
        .route("/api/comics/{id}", get(get_comic))
        .route("/api/scenes/{id}/retry", post(retry_scene))
        .route("/api/images/compose", post(compose_images))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/characters", post(create_character))
        .route("/api/users/{id}/credits", get(user_credits))
        .route("/api/users/{id}/credits/grant", post(grant_credits))
        .with_state(state)
}

/// One frame on the generate stream: progress while the job runs,
/// then exactly one terminal payload.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum JobMessage {
    Progress(ProgressEvent),
    Completed {
        job_id: String,
        comic_id: String,
        scenes: Vec<Scene>,
    },
    Failed {
        job_id: String,
        error: String,
    },
}

fn sse_event(msg: &JobMessage) -> Event {
    match Event::default().json_data(msg) {
        Ok(ev) => ev,
        Err(_) => Event::default().data("{}"),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

/// Submit a generation job. The response is a long-lived SSE stream of
/// progress events terminating in a completion or error payload.
/// Dropping the connection cancels the job.
async fn generate(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let job_id = Uuid::new_v4().to_string();
    let token = CancellationToken::new();
    state.jobs.insert(job_id.clone(), token.clone());
    info!(job_id = %job_id, user_id = %request.user_id, "generation job accepted");

    let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressEvent>(64);
    let (out_tx, out_rx) = mpsc::channel::<JobMessage>(64);

    // Forward progress events onto the output stream.
    let forward_tx = out_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            if forward_tx.send(JobMessage::Progress(event)).await.is_err() {
                break;
            }
        }
    });

    // Run the pipeline; its result becomes the terminal frame.
    let pipeline = state.pipeline.clone();
    let jobs = state.jobs.clone();
    let task_job_id = job_id.clone();
    let task_token = token.clone();
    tokio::spawn(async move {
        let sink = ProgressSink::new(progress_tx);
        let result = pipeline.generate(request, sink, task_token).await;
        jobs.remove(&task_job_id);

        let terminal = match result {
            Ok(outcome) => JobMessage::Completed {
                job_id: task_job_id,
                comic_id: outcome.comic_id,
                scenes: outcome.scenes,
            },
            Err(err) => {
                error!(job_id = %task_job_id, error = %err, "generation job failed");
                JobMessage::Failed {
                    job_id: task_job_id,
                    error: err.to_string(),
                }
            }
        };
        let _ = out_tx.send(terminal).await;
    });

    // The drop guard cancels the job if the client goes away before
    // the stream finishes.
    let guard = token.drop_guard();
    let stream = futures_util::stream::unfold(
        (out_rx, Some(guard), false),
        |(mut rx, mut guard, done)| async move {
            if done {
                return None;
            }
            let msg = rx.recv().await?;
            let terminal =
                matches!(msg, JobMessage::Completed { .. } | JobMessage::Failed { .. });
            if terminal {
                // Disarm so normal completion is not recorded as a cancel.
                if let Some(g) = guard.take() {
                    let _ = g.disarm();
                }
            }
            Some((Ok(sse_event(&msg)), (rx, guard, terminal)))
        },
    );

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
struct RetryRequest {
    user_id: String,
    description: String,
}

async fn retry_scene(
    State(state): State<AppState>,
    Path(scene_id): Path<String>,
    Json(body): Json<RetryRequest>,
) -> Result<Json<Scene>, ApiError> {
    let scene = state
        .pipeline
        .retry_scene(&scene_id, &body.description, &body.user_id)
        .await?;
    Ok(Json(scene))
}

#[derive(Debug, Deserialize)]
struct ComposeRequest {
    prompt: String,
    images: Vec<String>,
}

/// Stateless multi-reference composition, used by the visual editor:
/// one prompt plus several raw images, no job/poll cycle.
async fn compose_images(
    State(state): State<AppState>,
    Json(body): Json<ComposeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let image = state
        .synthesizer
        .compose(&body.prompt, &body.images)
        .await
        .map_err(|reason| ApiError(PipelineError::Compositing(reason)))?;
    Ok(Json(serde_json::json!({ "image_base64": image })))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> StatusCode {
    match state.jobs.remove(&job_id) {
        Some((_, token)) => {
            token.cancel();
            info!(job_id = %job_id, "job cancelled by request");
            StatusCode::ACCEPTED
        }
        None => StatusCode::NOT_FOUND,
    }
}

#[derive(Debug, Deserialize)]
struct CreateCharacterRequest {
    user_id: String,
    name: String,
    avatar_url: String,
}

async fn create_character(
    State(state): State<AppState>,
    Json(body): Json<CreateCharacterRequest>,
) -> Result<Json<Character>, ApiError> {
    let character =
        database::insert_character(&state.db, &body.user_id, &body.name, &body.avatar_url).await?;
    Ok(Json(character))
}

#[derive(Debug, Serialize)]
struct CreditsView {
    balance: i64,
    ledger: Vec<LedgerEntry>,
}

async fn user_credits(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<CreditsView>, ApiError> {
    let balance = credits::balance(&state.db, &user_id).await?;
    let ledger = credits::ledger_for_user(&state.db, &user_id).await?;
    Ok(Json(CreditsView { balance, ledger }))
}

#[derive(Debug, Deserialize)]
struct GrantRequest {
    amount: i64,
    description: String,
}

async fn grant_credits(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(body): Json<GrantRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let balance = credits::grant(&state.db, &user_id, body.amount, &body.description).await?;
    Ok(Json(serde_json::json!({ "balance": balance })))
}

#[derive(Debug, Serialize)]
struct ComicView {
    comic: Comic,
    scenes: Vec<Scene>,
}

async fn get_comic(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ComicView>, ApiError> {
    let comic = database::get_comic(&state.db, &id).await?;
    let scenes = database::get_scenes_for_comic(&state.db, &id).await?;
    Ok(Json(ComicView { comic, scenes }))
}

/// Maps pipeline errors onto HTTP statuses at the API boundary.
pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PipelineError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            PipelineError::UnauthorizedCharacter { .. } => StatusCode::FORBIDDEN,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::AnalysisFormat(_)
            | PipelineError::SceneRender { .. }
            | PipelineError::Compositing(_)
            | PipelineError::Deduction(_) => StatusCode::BAD_GATEWAY,
            PipelineError::Cancelled => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}
