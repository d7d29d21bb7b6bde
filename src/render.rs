use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How the render service should treat the submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Plain text-to-image generation (reference optional).
    Generate,
    /// Edit-with-reference: the reference image is the starting point.
    Edit,
}

impl RenderMode {
    fn as_str(&self) -> &'static str {
        match self {
            RenderMode::Generate => "generate",
            RenderMode::Edit => "edit",
        }
    }
}

/// Submits prompts to an external image model and waits for the result.
/// Errors are plain strings; the orchestrator attaches scene context.
#[async_trait]
pub trait ImageSynthesizer: Send + Sync {
    /// Submit one render and poll to completion. Returns base64 image
    /// data. Interim 0-100 progress is forwarded to `on_progress`.
    async fn render(
        &self,
        prompt: &str,
        reference_image: Option<&str>,
        mode: RenderMode,
        on_progress: &mut (dyn FnMut(u32) + Send),
    ) -> Result<String, String>;

    /// Stateless multi-input composition: one call, several raw images,
    /// no job/poll cycle.
    async fn compose(&self, prompt: &str, images: &[String]) -> Result<String, String>;
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct JobStatus {
    status: String,
    progress: Option<u32>,
    image_base64: Option<String>,
    error: Option<String>,
}

/// Exponential backoff between polls, capped at 10 seconds.
pub fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(Duration::from_secs(10))
}

/// HTTP client for the render service's submit/poll API.
pub struct RenderServiceClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    poll_interval: Duration,
    poll_deadline: Duration,
}

impl RenderServiceClient {
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        api_key: Option<String>,
        poll_interval: Duration,
        poll_deadline: Duration,
    ) -> Self {
        RenderServiceClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            poll_interval,
            poll_deadline,
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("X-API-Key", key),
            None => req,
        }
    }

    async fn submit(
        &self,
        prompt: &str,
        reference_image: Option<&str>,
        mode: RenderMode,
    ) -> Result<String, String> {
        let mut body = serde_json::json!({
            "prompt": prompt,
            "mode": mode.as_str(),
        });
        if let Some(reference) = reference_image {
            body["reference_image"] = serde_json::Value::String(reference.to_string());
        }

        let url = format!("{}/v1/renders", self.base_url);
        let resp = self
            .authed(self.client.post(&url).json(&body))
            .send()
            .await
            .map_err(|e| format!("render submit failed: {e}"))?;

        if !resp.status().is_success() {
            return Err(format!("render submit: HTTP {}", resp.status()));
        }

        let submitted: SubmitResponse = resp
            .json()
            .await
            .map_err(|e| format!("render submit parse: {e}"))?;
        info!(job_id = %submitted.job_id, "render job submitted");
        Ok(submitted.job_id)
    }

    async fn poll_once(&self, job_id: &str) -> Result<JobStatus, String> {
        let url = format!("{}/v1/renders/{}", self.base_url, job_id);
        let resp = self
            .authed(self.client.get(&url))
            .send()
            .await
            .map_err(|e| format!("render poll failed: {e}"))?;

        if !resp.status().is_success() {
            return Err(format!("render poll: HTTP {}", resp.status()));
        }

        resp.json()
            .await
            .map_err(|e| format!("render poll parse: {e}"))
    }
}

#[async_trait]
impl ImageSynthesizer for RenderServiceClient {
    async fn render(
        &self,
        prompt: &str,
        reference_image: Option<&str>,
        mode: RenderMode,
        on_progress: &mut (dyn FnMut(u32) + Send),
    ) -> Result<String, String> {
        let job_id = self.submit(prompt, reference_image, mode).await?;

        let started = Instant::now();
        let mut wait = self.poll_interval;

        loop {
            if started.elapsed() > self.poll_deadline {
                warn!(job_id = %job_id, "render job exceeded poll deadline");
                return Err(format!(
                    "render timed out after {}s",
                    self.poll_deadline.as_secs()
                ));
            }

            tokio::time::sleep(wait).await;
            wait = next_backoff(wait);

            let status = self.poll_once(&job_id).await?;
            if let Some(progress) = status.progress {
                debug!(job_id = %job_id, progress, "render progress");
                on_progress(progress.min(100));
            }

            match status.status.as_str() {
                "completed" => {
                    on_progress(100);
                    return status
                        .image_base64
                        .ok_or_else(|| "render completed without image data".to_string());
                }
                "failed" => {
                    return Err(status
                        .error
                        .unwrap_or_else(|| "render job failed".to_string()));
                }
                // queued / running: keep polling
                _ => {}
            }
        }
    }

    async fn compose(&self, prompt: &str, images: &[String]) -> Result<String, String> {
        let body = serde_json::json!({
            "prompt": prompt,
            "images": images,
        });

        let url = format!("{}/v1/compose", self.base_url);
        let resp = self
            .authed(self.client.post(&url).json(&body))
            .send()
            .await
            .map_err(|e| format!("compose request failed: {e}"))?;

        if !resp.status().is_success() {
            return Err(format!("compose: HTTP {}", resp.status()));
        }

        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| format!("compose parse: {e}"))?;

        value
            .get("image_base64")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| "compose: no image in response".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut wait = Duration::from_secs(1);
        wait = next_backoff(wait);
        assert_eq!(wait, Duration::from_secs(2));
        wait = next_backoff(wait);
        assert_eq!(wait, Duration::from_secs(4));
        wait = next_backoff(next_backoff(wait));
        assert_eq!(wait, Duration::from_secs(10));
        assert_eq!(next_backoff(wait), Duration::from_secs(10));
    }

    #[test]
    fn job_status_parses_partial_payloads() {
        let running: JobStatus =
            serde_json::from_str(r#"{"status":"running","progress":42}"#).unwrap();
        assert_eq!(running.status, "running");
        assert_eq!(running.progress, Some(42));
        assert!(running.image_base64.is_none());

        let done: JobStatus =
            serde_json::from_str(r#"{"status":"completed","image_base64":"aGk="}"#).unwrap();
        assert_eq!(done.image_base64.as_deref(), Some("aGk="));

        let failed: JobStatus =
            serde_json::from_str(r#"{"status":"failed","error":"gpu on fire"}"#).unwrap();
        assert_eq!(failed.error.as_deref(), Some("gpu on fire"));
    }

    #[test]
    fn mode_serializes_to_wire_names() {
        assert_eq!(RenderMode::Generate.as_str(), "generate");
        assert_eq!(RenderMode::Edit.as_str(), "edit");
    }
}
