mod analyzer;
mod compositor;
mod credits;
mod database;
mod error;
mod pipeline;
mod prompt;
mod render;
mod server;
mod settings;
mod storage;
mod utils;

use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::analyzer::GeminiAnalyzer;
use crate::database::create_pool;
use crate::pipeline::ComicPipeline;
use crate::render::RenderServiceClient;
use crate::server::{router, AppState};
use crate::settings::{load_settings_from_dir, save_settings_to_dir, settings_path};
use crate::utils::{db_path, ensure_data_dir};

#[tokio::main]
async fn main() -> Result<()> {
    let data_dir = ensure_data_dir()?;

    let file_appender = tracing_appender::rolling::daily(data_dir.join("logs"), "inktale.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();

    let settings = load_settings_from_dir(&data_dir);
    if !settings_path(&data_dir).exists() {
        // Seed a settings file so operators have something to edit.
        save_settings_to_dir(&data_dir, &settings)?;
    }
    let pool = create_pool(&db_path(&data_dir)).await?;
    info!(data_dir = %data_dir.display(), "starting");

    let http = reqwest::Client::new();

    let analyzer = GeminiAnalyzer::new(
        http.clone(),
        settings.gemini_api_key.clone(),
        settings.gemini_text_model.clone(),
    );

    let render_base = settings
        .render_base_url
        .clone()
        .unwrap_or_else(|| "http://127.0.0.1:9901".to_string());
    let synthesizer: Arc<dyn render::ImageSynthesizer> = Arc::new(RenderServiceClient::new(
        http.clone(),
        render_base,
        settings.render_api_key.clone(),
        Duration::from_millis(settings.render_poll_interval_ms),
        Duration::from_secs(settings.render_poll_deadline_secs),
    ));

    let pipeline = ComicPipeline::new(
        pool.clone(),
        http,
        Arc::new(analyzer),
        synthesizer.clone(),
        settings.clone(),
        data_dir.clone(),
    );

    let state = AppState {
        db: pool,
        pipeline: Arc::new(pipeline),
        synthesizer,
        jobs: Arc::new(DashMap::new()),
    };

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!(addr = %settings.bind_addr, "listening");
    axum::serve(listener, router(state)).await?;

    Ok(())
}
