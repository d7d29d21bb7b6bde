use thiserror::Error;

/// Errors surfaced by the generation pipeline.
///
/// The first six variants map to distinct product-level failure modes;
/// the rest wrap infrastructure failures from the database, HTTP clients
/// and image handling.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("insufficient credits: need {required}, have {balance}")]
    InsufficientCredits { required: i64, balance: i64 },

    #[error("character {character_id} is not owned by user {user_id}")]
    UnauthorizedCharacter {
        character_id: String,
        user_id: String,
    },

    #[error("analysis returned a malformed result: {0}")]
    AnalysisFormat(String),

    #[error("scene {scene_id} failed to render: {reason}")]
    SceneRender { scene_id: String, reason: String },

    #[error("compositing failed: {0}")]
    Compositing(String),

    #[error("credit deduction failed: {0}")]
    Deduction(String),

    #[error("job cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
