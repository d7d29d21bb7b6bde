use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use std::path::Path;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{PipelineError, Result};

pub fn now_iso() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

/// Output shape of a generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComicFormat {
    SinglePanel,
    ThreePanel,
    FourPanel,
    FivePage,
}

impl ComicFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComicFormat::SinglePanel => "single-panel",
            ComicFormat::ThreePanel => "three-panel",
            ComicFormat::FourPanel => "four-panel",
            ComicFormat::FivePage => "five-page",
        }
    }

    pub fn parse(s: &str) -> Option<ComicFormat> {
        match s {
            "single-panel" => Some(ComicFormat::SinglePanel),
            "three-panel" => Some(ComicFormat::ThreePanel),
            "four-panel" => Some(ComicFormat::FourPanel),
            "five-page" => Some(ComicFormat::FivePage),
            _ => None,
        }
    }

    /// Number of scenes the analyzer must return for this format.
    pub fn scene_count(&self) -> usize {
        match self {
            ComicFormat::SinglePanel => 1,
            ComicFormat::ThreePanel => 3,
            ComicFormat::FourPanel => 4,
            ComicFormat::FivePage => 5,
        }
    }

    /// Storage folder under `users/{user_id}/`.
    pub fn storage_folder(&self) -> &'static str {
        match self {
            ComicFormat::SinglePanel => "posters",
            _ => "comics",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComicStatus {
    Processing,
    Completed,
    Failed,
}

impl ComicStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComicStatus::Processing => "processing",
            ComicStatus::Completed => "completed",
            ComicStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> ComicStatus {
        match s {
            "completed" => ComicStatus::Completed,
            "failed" => ComicStatus::Failed,
            _ => ComicStatus::Processing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SceneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SceneStatus::Pending => "pending",
            SceneStatus::Processing => "processing",
            SceneStatus::Completed => "completed",
            SceneStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> SceneStatus {
        match s {
            "processing" => SceneStatus::Processing,
            "completed" => SceneStatus::Completed,
            "failed" => SceneStatus::Failed,
            _ => SceneStatus::Pending,
        }
    }
}

/// A previously generated avatar. Read-only to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub avatar_url: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comic {
    pub id: String,
    pub user_id: String,
    pub story: String,
    pub style: String,
    pub format: ComicFormat,
    pub layout_mode: String,
    pub status: ComicStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    pub comic_id: String,
    pub idx: i64,
    pub content: String,
    pub scenario: String,
    pub mood: Option<String>,
    pub quote: Option<String>,
    /// Ids of the characters referenced by this scene, in order.
    pub character_ids: Vec<String>,
    pub image_url: Option<String>,
    pub image_prompt: Option<String>,
    pub status: SceneStatus,
    pub retry_count: i64,
}

/// Scene fields known before any rendering happens.
#[derive(Debug, Clone)]
pub struct NewScene {
    pub content: String,
    pub scenario: String,
    pub mood: Option<String>,
    pub quote: Option<String>,
    pub character_ids: Vec<String>,
}

pub async fn init_db(pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS characters (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            name TEXT NOT NULL,
            avatar_url TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS comics (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            story TEXT NOT NULL,
            style TEXT NOT NULL,
            format TEXT NOT NULL,
            layout_mode TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scenes (
            id TEXT PRIMARY KEY,
            comic_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            content TEXT NOT NULL,
            scenario TEXT NOT NULL,
            mood TEXT,
            quote TEXT,
            character_ids TEXT NOT NULL DEFAULT '[]',
            image_url TEXT,
            image_prompt TEXT,
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            UNIQUE(comic_id, idx)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS credits (
            user_id TEXT PRIMARY KEY,
            balance INTEGER NOT NULL DEFAULT 0
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS credit_ledger (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            amount INTEGER NOT NULL,
            description TEXT NOT NULL,
            related_type TEXT,
            related_id TEXT,
            created_at TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn create_pool(db_path: &Path) -> Result<Pool<Sqlite>> {
    let opts = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(opts)
        .await?;

    init_db(&pool).await?;
    Ok(pool)
}

fn row_to_scene(row: &sqlx::sqlite::SqliteRow) -> Result<Scene> {
    let status: String = row.try_get("status")?;
    let character_ids_json: String = row.try_get("character_ids")?;
    Ok(Scene {
        id: row.try_get("id")?,
        comic_id: row.try_get("comic_id")?,
        idx: row.try_get("idx")?,
        content: row.try_get("content")?,
        scenario: row.try_get("scenario")?,
        mood: row.try_get("mood")?,
        quote: row.try_get("quote")?,
        character_ids: serde_json::from_str(&character_ids_json).unwrap_or_default(),
        image_url: row.try_get("image_url")?,
        image_prompt: row.try_get("image_prompt")?,
        status: SceneStatus::parse(&status),
        retry_count: row.try_get("retry_count")?,
    })
}

fn row_to_comic(row: &sqlx::sqlite::SqliteRow) -> Result<Comic> {
    let format: String = row.try_get("format")?;
    let status: String = row.try_get("status")?;
    Ok(Comic {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        story: row.try_get("story")?,
        style: row.try_get("style")?,
        format: ComicFormat::parse(&format).ok_or_else(|| {
            PipelineError::Db(sqlx::Error::Decode(
                format!("unknown comic format: {format}").into(),
            ))
        })?,
        layout_mode: row.try_get("layout_mode")?,
        status: ComicStatus::parse(&status),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn insert_character(
    pool: &Pool<Sqlite>,
    user_id: &str,
    name: &str,
    avatar_url: &str,
) -> Result<Character> {
    let character = Character {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        name: name.to_string(),
        avatar_url: avatar_url.to_string(),
        created_at: now_iso(),
    };

    sqlx::query(
        r#"INSERT INTO characters (id, user_id, name, avatar_url, created_at) VALUES (?1, ?2, ?3, ?4, ?5)"#,
    )
    .bind(&character.id)
    .bind(&character.user_id)
    .bind(&character.name)
    .bind(&character.avatar_url)
    .bind(&character.created_at)
    .execute(pool)
    .await?;

    Ok(character)
}

/// Fetch characters by id, preserving the order of `ids`.
///
/// A missing id yields `NotFound` rather than a shorter list.
pub async fn get_characters(pool: &Pool<Sqlite>, ids: &[String]) -> Result<Vec<Character>> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let row = sqlx::query(
            r#"SELECT id, user_id, name, avatar_url, created_at FROM characters WHERE id = ?1"#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("character {id}")))?;

        out.push(Character {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            name: row.try_get("name")?,
            avatar_url: row.try_get("avatar_url")?,
            created_at: row.try_get("created_at")?,
        });
    }
    Ok(out)
}

/// Insert the comic and all of its scenes (status `pending`) in one
/// transaction. Returns the persisted scene rows in order.
pub async fn create_comic_with_scenes(
    pool: &Pool<Sqlite>,
    user_id: &str,
    story: &str,
    style: &str,
    format: ComicFormat,
    layout_mode: &str,
    drafts: &[NewScene],
) -> Result<(Comic, Vec<Scene>)> {
    let now = now_iso();
    let comic = Comic {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        story: story.to_string(),
        style: style.to_string(),
        format,
        layout_mode: layout_mode.to_string(),
        status: ComicStatus::Processing,
        created_at: now.clone(),
        updated_at: now,
    };

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO comics (id, user_id, story, style, format, layout_mode, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(&comic.id)
    .bind(&comic.user_id)
    .bind(&comic.story)
    .bind(&comic.style)
    .bind(comic.format.as_str())
    .bind(&comic.layout_mode)
    .bind(comic.status.as_str())
    .bind(&comic.created_at)
    .bind(&comic.updated_at)
    .execute(&mut *tx)
    .await?;

    let mut scenes = Vec::with_capacity(drafts.len());
    for (idx, draft) in drafts.iter().enumerate() {
        let scene = Scene {
            id: Uuid::new_v4().to_string(),
            comic_id: comic.id.clone(),
            idx: idx as i64,
            content: draft.content.clone(),
            scenario: draft.scenario.clone(),
            mood: draft.mood.clone(),
            quote: draft.quote.clone(),
            character_ids: draft.character_ids.clone(),
            image_url: None,
            image_prompt: None,
            status: SceneStatus::Pending,
            retry_count: 0,
        };

        let character_ids_json = serde_json::to_string(&scene.character_ids).unwrap_or_default();
        sqlx::query(
            r#"
            INSERT INTO scenes (id, comic_id, idx, content, scenario, mood, quote, character_ids, status, retry_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)
            "#,
        )
        .bind(&scene.id)
        .bind(&scene.comic_id)
        .bind(scene.idx)
        .bind(&scene.content)
        .bind(&scene.scenario)
        .bind(&scene.mood)
        .bind(&scene.quote)
        .bind(&character_ids_json)
        .bind(scene.status.as_str())
        .execute(&mut *tx)
        .await?;

        scenes.push(scene);
    }

    tx.commit().await?;
    Ok((comic, scenes))
}

pub async fn get_comic(pool: &Pool<Sqlite>, id: &str) -> Result<Comic> {
    let row = sqlx::query(
        r#"SELECT id, user_id, story, style, format, layout_mode, status, created_at, updated_at
           FROM comics WHERE id = ?1"#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| PipelineError::NotFound(format!("comic {id}")))?;

    row_to_comic(&row)
}

pub async fn set_comic_status(pool: &Pool<Sqlite>, id: &str, status: ComicStatus) -> Result<()> {
    sqlx::query(r#"UPDATE comics SET status = ?1, updated_at = ?2 WHERE id = ?3"#)
        .bind(status.as_str())
        .bind(now_iso())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_scene(pool: &Pool<Sqlite>, id: &str) -> Result<Scene> {
    let row = sqlx::query(
        r#"SELECT id, comic_id, idx, content, scenario, mood, quote, character_ids, image_url, image_prompt, status, retry_count
           FROM scenes WHERE id = ?1"#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| PipelineError::NotFound(format!("scene {id}")))?;

    row_to_scene(&row)
}

pub async fn get_scenes_for_comic(pool: &Pool<Sqlite>, comic_id: &str) -> Result<Vec<Scene>> {
    let rows = sqlx::query(
        r#"SELECT id, comic_id, idx, content, scenario, mood, quote, character_ids, image_url, image_prompt, status, retry_count
           FROM scenes WHERE comic_id = ?1 ORDER BY idx ASC"#,
    )
    .bind(comic_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_scene).collect()
}

pub async fn mark_scene_processing(pool: &Pool<Sqlite>, id: &str) -> Result<()> {
    sqlx::query(r#"UPDATE scenes SET status = 'processing' WHERE id = ?1"#)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Record a successful render: image URL, the prompt that produced it,
/// status `completed`.
pub async fn complete_scene(
    pool: &Pool<Sqlite>,
    id: &str,
    image_url: &str,
    image_prompt: &str,
) -> Result<()> {
    sqlx::query(
        r#"UPDATE scenes SET status = 'completed', image_url = ?1, image_prompt = ?2 WHERE id = ?3"#,
    )
    .bind(image_url)
    .bind(image_prompt)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark a scene failed and bump its retry counter.
pub async fn fail_scene(pool: &Pool<Sqlite>, id: &str) -> Result<()> {
    sqlx::query(
        r#"UPDATE scenes SET status = 'failed', retry_count = retry_count + 1 WHERE id = ?1"#,
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Persist the outcome of a single-scene retry: a fresh image under a new
/// URL, the updated scenario, and a bumped retry counter.
pub async fn record_scene_retry(
    pool: &Pool<Sqlite>,
    id: &str,
    scenario: &str,
    image_url: &str,
    image_prompt: &str,
) -> Result<()> {
    sqlx::query(
        r#"UPDATE scenes
           SET scenario = ?1, image_url = ?2, image_prompt = ?3,
               status = 'completed', retry_count = retry_count + 1
           WHERE id = ?4"#,
    )
    .bind(scenario)
    .bind(image_url)
    .bind(image_prompt)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_pool() -> Pool<Sqlite> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_db(&pool).await.unwrap();
        pool
    }

    fn drafts(n: usize) -> Vec<NewScene> {
        (0..n)
            .map(|i| NewScene {
                content: format!("scene {i}"),
                scenario: format!("<A> does thing {i}"),
                mood: Some("calm".into()),
                quote: None,
                character_ids: vec!["c1".into()],
            })
            .collect()
    }

    #[tokio::test]
    async fn comic_and_scenes_created_in_order() {
        let pool = memory_pool().await;
        let (comic, scenes) = create_comic_with_scenes(
            &pool,
            "u1",
            "a story",
            "watercolor",
            ComicFormat::FourPanel,
            "grid",
            &drafts(4),
        )
        .await
        .unwrap();

        assert_eq!(comic.status, ComicStatus::Processing);
        assert_eq!(scenes.len(), 4);

        let stored = get_scenes_for_comic(&pool, &comic.id).await.unwrap();
        let indices: Vec<i64> = stored.iter().map(|s| s.idx).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert!(stored.iter().all(|s| s.status == SceneStatus::Pending));
        assert!(stored.iter().all(|s| s.image_url.is_none()));
    }

    #[tokio::test]
    async fn fail_scene_bumps_retry_count() {
        let pool = memory_pool().await;
        let (_, scenes) = create_comic_with_scenes(
            &pool,
            "u1",
            "s",
            "ink",
            ComicFormat::SinglePanel,
            "single",
            &drafts(1),
        )
        .await
        .unwrap();

        fail_scene(&pool, &scenes[0].id).await.unwrap();
        fail_scene(&pool, &scenes[0].id).await.unwrap();

        let scene = get_scene(&pool, &scenes[0].id).await.unwrap();
        assert_eq!(scene.status, SceneStatus::Failed);
        assert_eq!(scene.retry_count, 2);
    }

    #[tokio::test]
    async fn corrupt_format_column_is_not_a_missing_row() {
        let pool = memory_pool().await;
        sqlx::query(
            r#"
            INSERT INTO comics (id, user_id, story, style, format, layout_mode, status, created_at, updated_at)
            VALUES ('c1', 'u1', 's', 'ink', 'octagonal', 'grid', 'processing', 't', 't')
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        let err = get_comic(&pool, "c1").await.unwrap_err();
        assert!(matches!(err, PipelineError::Db(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn character_order_is_preserved() {
        let pool = memory_pool().await;
        let b = insert_character(&pool, "u1", "Bella", "data:image/png;base64,x").await.unwrap();
        let a = insert_character(&pool, "u1", "Axel", "data:image/png;base64,y").await.unwrap();

        let got = get_characters(&pool, &[a.id.clone(), b.id.clone()]).await.unwrap();
        assert_eq!(got[0].name, "Axel");
        assert_eq!(got[1].name, "Bella");
    }
}
