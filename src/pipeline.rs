use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, trace, warn};

use crate::analyzer::{SceneDraft, StoryAnalyzer};
use crate::compositor::{self, Direction, Slot};
use crate::credits;
use crate::database::{
    self, Character, Comic, ComicFormat, ComicStatus, NewScene, Scene,
};
use crate::error::{PipelineError, Result};
use crate::prompt;
use crate::render::{ImageSynthesizer, RenderMode};
use crate::settings::Settings;
use crate::storage;

/// Ephemeral status push describing pipeline advancement. Never
/// persisted; consumed by a caller-supplied sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub step: String,
    pub message: String,
    pub progress: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_scene: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_scenes: Option<usize>,
}

/// Non-blocking wrapper over the caller's channel. A slow consumer
/// drops events instead of stalling the pipeline.
#[derive(Clone)]
pub struct ProgressSink {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressSink {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        ProgressSink { tx }
    }

    pub fn emit(&self, step: &str, message: &str, progress: u32) {
        self.emit_scene(step, message, progress, None, None);
    }

    pub fn emit_scene(
        &self,
        step: &str,
        message: &str,
        progress: u32,
        current_scene: Option<usize>,
        total_scenes: Option<usize>,
    ) {
        let event = ProgressEvent {
            step: step.to_string(),
            message: message.to_string(),
            progress: progress.min(100),
            current_scene,
            total_scenes,
        };
        if self.tx.try_send(event).is_err() {
            trace!(step, progress, "progress sink full, dropping event");
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequest {
    pub user_id: String,
    pub story: String,
    pub character_ids: Vec<String>,
    pub style: String,
    pub format: ComicFormat,
    #[serde(default)]
    pub layout_mode: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateOutcome {
    pub comic_id: String,
    pub scenes: Vec<Scene>,
    pub status: ComicStatus,
}

/// The top-level state machine. All collaborators are injected so
/// tests can script the external models.
pub struct ComicPipeline {
    db: Pool<Sqlite>,
    http: reqwest::Client,
    analyzer: Arc<dyn StoryAnalyzer>,
    synthesizer: Arc<dyn ImageSynthesizer>,
    settings: Settings,
    data_root: PathBuf,
}

// Progress band occupied by the per-scene rendering loop.
const RENDER_BAND_START: u32 = 25;
const RENDER_BAND_END: u32 = 90;

/// Vertical layouts stack the reference canvas the same way the panels
/// will be stacked; everything else composes left-to-right.
fn composite_direction(layout_mode: &str) -> Direction {
    if layout_mode == "vertical" {
        Direction::Vertical
    } else {
        Direction::Horizontal
    }
}

impl ComicPipeline {
    pub fn new(
        db: Pool<Sqlite>,
        http: reqwest::Client,
        analyzer: Arc<dyn StoryAnalyzer>,
        synthesizer: Arc<dyn ImageSynthesizer>,
        settings: Settings,
        data_root: PathBuf,
    ) -> Self {
        ComicPipeline {
            db,
            http,
            analyzer,
            synthesizer,
            settings,
            data_root,
        }
    }

    /// Run the full generation pipeline for one request.
    ///
    /// Stage order is fixed; each stage's success is a precondition for
    /// the next. Credits are deducted only after every scene rendered.
    #[instrument(skip(self, sink, cancel), fields(user_id = %request.user_id, format = request.format.as_str()))]
    pub async fn generate(
        &self,
        request: GenerateRequest,
        sink: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<GenerateOutcome> {
        // Stage 1: credit precheck; reject before any paid work.
        sink.emit("credit_check", "Checking credit balance", 2);
        let cost = credits::format_cost(request.format);
        credits::check(&self.db, &request.user_id, cost).await?;

        // Stage 2: character ownership validation.
        sink.emit("validate_characters", "Validating characters", 5);
        let characters = database::get_characters(&self.db, &request.character_ids).await?;
        for character in &characters {
            if character.user_id != request.user_id {
                return Err(PipelineError::UnauthorizedCharacter {
                    character_id: character.id.clone(),
                    user_id: request.user_id.clone(),
                });
            }
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        // Stage 3: story analysis, one external call with a fixed scene count.
        let scene_count = request.format.scene_count();
        sink.emit("analyze", "Breaking the story into scenes", 10);
        let drafts = self
            .analyzer
            .analyze(&request.story, &characters, scene_count)
            .await?;
        if drafts.len() != scene_count {
            return Err(PipelineError::AnalysisFormat(format!(
                "analyzer produced {} scenes, expected {scene_count}",
                drafts.len()
            )));
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        // Stage 4: persist the comic and its pending scenes.
        sink.emit("persist", "Saving comic", 20);
        let layout_mode = request.layout_mode.as_deref().unwrap_or("grid");
        let new_scenes: Vec<NewScene> = drafts
            .iter()
            .map(|d| NewScene {
                content: d.description.clone(),
                scenario: d.description.clone(),
                mood: d.mood.clone(),
                quote: d.quote.clone(),
                character_ids: d.character_ids.clone(),
            })
            .collect();
        let (comic, scenes) = database::create_comic_with_scenes(
            &self.db,
            &request.user_id,
            &request.story,
            &request.style,
            request.format,
            layout_mode,
            &new_scenes,
        )
        .await?;
        info!(comic_id = %comic.id, scenes = scenes.len(), "comic created");

        // Stage 5: sequential per-scene rendering. A failed scene is
        // fatal for the whole job; its row stays behind for retry.
        for (i, scene) in scenes.iter().enumerate() {
            if cancel.is_cancelled() {
                return self.abort_cancelled(&comic).await;
            }

            let result = self
                .render_scene(&comic, scene, &drafts[i], &characters, &sink, i, scene_count)
                .await;

            if let Err(err) = result {
                error!(comic_id = %comic.id, scene_id = %scene.id, error = %err, "scene render failed");
                database::fail_scene(&self.db, &scene.id).await?;
                database::set_comic_status(&self.db, &comic.id, ComicStatus::Failed).await?;
                sink.emit_scene(
                    "failed",
                    "Scene rendering failed",
                    RENDER_BAND_START,
                    Some(i + 1),
                    Some(scene_count),
                );
                return Err(err);
            }
        }

        // Stage 6: deduct credits. A deduction failure does not take
        // the finished comic away from the user; it is only logged.
        sink.emit("deduct", "Recording credit usage", 95);
        let deduction = credits::deduct(
            &self.db,
            &request.user_id,
            cost,
            &format!("{} generation", request.format.as_str()),
            "comic",
            &comic.id,
        )
        .await;
        if let Err(err) = deduction {
            let err = PipelineError::Deduction(err.to_string());
            warn!(comic_id = %comic.id, error = %err, "credit deduction failed after successful render");
        }

        // Stage 7: finalize.
        database::set_comic_status(&self.db, &comic.id, ComicStatus::Completed).await?;
        sink.emit("complete", "Comic ready", 100);

        let scenes = database::get_scenes_for_comic(&self.db, &comic.id).await?;
        Ok(GenerateOutcome {
            comic_id: comic.id,
            scenes,
            status: ComicStatus::Completed,
        })
    }

    async fn abort_cancelled(&self, comic: &Comic) -> Result<GenerateOutcome> {
        warn!(comic_id = %comic.id, "job cancelled mid-flight");
        database::set_comic_status(&self.db, &comic.id, ComicStatus::Failed).await?;
        Err(PipelineError::Cancelled)
    }

    /// Render one scene: composite reference, rewrite prompt, call the
    /// image model, persist the result.
    async fn render_scene(
        &self,
        comic: &Comic,
        scene: &Scene,
        draft: &SceneDraft,
        roster: &[Character],
        sink: &ProgressSink,
        index: usize,
        total: usize,
    ) -> Result<()> {
        database::mark_scene_processing(&self.db, &scene.id).await?;

        let band = RENDER_BAND_END - RENDER_BAND_START;
        let scene_base = RENDER_BAND_START + band * index as u32 / total as u32;
        let scene_span = band / total as u32;

        sink.emit_scene(
            "render_scene",
            &format!("Rendering scene {} of {total}", index + 1),
            scene_base,
            Some(index + 1),
            Some(total),
        );

        // Characters referenced by this scene, in draft order.
        let scene_characters: Vec<Character> = draft
            .character_ids
            .iter()
            .filter_map(|id| roster.iter().find(|c| &c.id == id).cloned())
            .collect();

        let reference = compositor::composite(
            &self.http,
            &scene_characters,
            composite_direction(&comic.layout_mode),
            &self.settings,
        )
        .await?;

        let labeled: Vec<(Character, Slot)> = match &reference {
            Some(r) => scene_characters
                .iter()
                .cloned()
                .zip(r.slots.iter().map(|(_, slot)| *slot))
                .collect(),
            None => Vec::new(),
        };

        let processed = prompt::process(&draft.description, &labeled);
        let final_prompt = prompt::build_scene_prompt(
            &processed,
            &comic.style,
            draft.mood.as_deref(),
            draft.quote.as_deref(),
            reference.is_some(),
        );

        let mode = if reference.is_some() {
            RenderMode::Edit
        } else {
            RenderMode::Generate
        };

        let progress_sink = sink.clone();
        let mut on_progress = move |pct: u32| {
            let overall = scene_base + scene_span * pct.min(100) / 100;
            progress_sink.emit_scene(
                "render_scene",
                &format!("Rendering scene {} of {total}", index + 1),
                overall,
                Some(index + 1),
                Some(total),
            );
        };

        let image_b64 = self
            .synthesizer
            .render(
                &final_prompt,
                reference.as_ref().map(|r| r.image_url.as_str()),
                mode,
                &mut on_progress,
            )
            .await
            .map_err(|reason| PipelineError::SceneRender {
                scene_id: scene.id.clone(),
                reason,
            })?;

        let image_url = storage::save_scene_image(
            &self.data_root,
            &comic.user_id,
            comic.format,
            &scene.id,
            false,
            &image_b64,
        )
        .await
        .map_err(|e| PipelineError::SceneRender {
            scene_id: scene.id.clone(),
            reason: format!("image save: {e}"),
        })?;

        database::complete_scene(&self.db, &scene.id, &image_url, &final_prompt).await?;
        sink.emit_scene(
            "render_scene",
            &format!("Scene {} of {total} complete", index + 1),
            scene_base + scene_span,
            Some(index + 1),
            Some(total),
        );
        Ok(())
    }

    /// Re-render a single scene with a new description, independent of
    /// the main all-or-nothing policy. The fresh image is stored under
    /// a retry-qualified name and retry_count is bumped.
    #[instrument(skip(self, new_description), fields(scene_id = %scene_id, user_id = %user_id))]
    pub async fn retry_scene(
        &self,
        scene_id: &str,
        new_description: &str,
        user_id: &str,
    ) -> Result<Scene> {
        let scene = database::get_scene(&self.db, scene_id).await?;
        let comic = database::get_comic(&self.db, &scene.comic_id).await?;
        if comic.user_id != user_id {
            return Err(PipelineError::NotFound(format!("scene {scene_id}")));
        }

        let characters = database::get_characters(&self.db, &scene.character_ids).await?;
        let reference = compositor::composite(
            &self.http,
            &characters,
            composite_direction(&comic.layout_mode),
            &self.settings,
        )
        .await?;

        let labeled: Vec<(Character, Slot)> = match &reference {
            Some(r) => characters
                .iter()
                .cloned()
                .zip(r.slots.iter().map(|(_, slot)| *slot))
                .collect(),
            None => Vec::new(),
        };

        let processed = prompt::process(new_description, &labeled);
        let final_prompt = prompt::build_scene_prompt(
            &processed,
            &comic.style,
            scene.mood.as_deref(),
            scene.quote.as_deref(),
            reference.is_some(),
        );

        let mode = if reference.is_some() {
            RenderMode::Edit
        } else {
            RenderMode::Generate
        };

        let mut on_progress = |_pct: u32| {};
        let image_b64 = self
            .synthesizer
            .render(
                &final_prompt,
                reference.as_ref().map(|r| r.image_url.as_str()),
                mode,
                &mut on_progress,
            )
            .await
            .map_err(|reason| PipelineError::SceneRender {
                scene_id: scene_id.to_string(),
                reason,
            })?;

        let image_url = storage::save_scene_image(
            &self.data_root,
            &comic.user_id,
            comic.format,
            scene_id,
            true,
            &image_b64,
        )
        .await
        .map_err(|e| PipelineError::SceneRender {
            scene_id: scene_id.to_string(),
            reason: format!("image save: {e}"),
        })?;

        database::record_scene_retry(&self.db, scene_id, new_description, &image_url, &final_prompt)
            .await?;
        info!(scene_id, "scene retried");
        database::get_scene(&self.db, scene_id).await
    }
}
