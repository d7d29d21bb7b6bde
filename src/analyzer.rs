use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::database::Character;
use crate::error::{PipelineError, Result};

/// One scene produced by story analysis, with character references
/// already resolved to ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneDraft {
    pub order: usize,
    pub description: String,
    pub mood: Option<String>,
    pub quote: Option<String>,
    pub character_ids: Vec<String>,
}

/// Turns free text plus a character roster into an ordered list of
/// scene descriptions. Injected into the pipeline so tests can supply
/// a scripted implementation.
#[async_trait]
pub trait StoryAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        story: &str,
        characters: &[Character],
        scene_count: usize,
    ) -> Result<Vec<SceneDraft>>;
}

/// Maps a `<Name>` token to a character id. Exact matching is fragile
/// (case, punctuation), so the strategy is pluggable.
pub trait CharacterResolver: Send + Sync {
    fn resolve(&self, token: &str, roster: &[Character]) -> Option<String>;
}

/// Default strategy: the token must equal the character's name exactly.
pub struct ExactNameResolver;

impl CharacterResolver for ExactNameResolver {
    fn resolve(&self, token: &str, roster: &[Character]) -> Option<String> {
        roster.iter().find(|c| c.name == token).map(|c| c.id.clone())
    }
}

/// Extract `<Name>` tokens from a scene description, in order of first
/// appearance, deduplicated.
pub fn extract_name_tokens(description: &str) -> Vec<String> {
    // Unwrap is fine: the pattern is a compile-time constant.
    let re = Regex::new(r"<([^<>]+)>").unwrap();
    let mut seen = Vec::new();
    for cap in re.captures_iter(description) {
        let name = cap[1].to_string();
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}

/// Resolve tokens against the roster. Unmatched tokens are dropped
/// silently, not errored.
pub fn resolve_character_ids(
    description: &str,
    roster: &[Character],
    resolver: &dyn CharacterResolver,
) -> Vec<String> {
    let mut ids = Vec::new();
    for token in extract_name_tokens(description) {
        match resolver.resolve(&token, roster) {
            Some(id) => {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            None => debug!(token, "dropping unresolved character token"),
        }
    }
    ids
}

/// Raw scene shape as returned by the model's function call.
#[derive(Debug, Deserialize)]
struct RawScene {
    description: String,
    mood: Option<String>,
    quote: Option<String>,
}

/// Validate the function-call payload: exactly `expected` scenes, each
/// with a non-empty description. A mismatched count is a hard failure;
/// never coerce or pad.
pub fn parse_scene_args(args: &serde_json::Value, expected: usize) -> Result<Vec<(String, Option<String>, Option<String>)>> {
    let scenes = args
        .get("scenes")
        .and_then(|s| s.as_array())
        .ok_or_else(|| PipelineError::AnalysisFormat("missing scenes array".into()))?;

    if scenes.len() != expected {
        return Err(PipelineError::AnalysisFormat(format!(
            "expected {expected} scenes, model returned {}",
            scenes.len()
        )));
    }

    let mut out = Vec::with_capacity(expected);
    for (i, scene) in scenes.iter().enumerate() {
        let raw: RawScene = serde_json::from_value(scene.clone())
            .map_err(|e| PipelineError::AnalysisFormat(format!("scene {i}: {e}")))?;
        if raw.description.trim().is_empty() {
            return Err(PipelineError::AnalysisFormat(format!(
                "scene {i}: empty description"
            )));
        }
        out.push((raw.description, raw.mood, raw.quote));
    }
    Ok(out)
}

fn analysis_prompt(story: &str, characters: &[Character], scene_count: usize) -> String {
    let roster = characters
        .iter()
        .map(|c| c.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"You are a comic storyboarder. Split the journal entry below into exactly {scene_count} scenes.

Guidelines:
- Keep tone light and hopeful; keep it PG.
- Only use characters from this roster: {roster}. Wrap every character mention in angle brackets with the exact roster name, e.g. <{example}>.
- Each scene needs one concise visual description, a one-word mood, and optionally a short quote (≤ 12 words).
- Maintain continuity across scenes; do not invent events the entry does not imply.

Journal entry:
{story}
"#,
        example = characters.first().map(|c| c.name.as_str()).unwrap_or("Name"),
    )
}

/// Gemini-backed analyzer using forced function calling so the reply is
/// a fixed-shape structured object rather than free text.
pub struct GeminiAnalyzer {
    client: reqwest::Client,
    api_key: Option<String>,
    model_id: String,
    resolver: Box<dyn CharacterResolver>,
}

impl GeminiAnalyzer {
    pub fn new(client: reqwest::Client, api_key: Option<String>, model_id: Option<String>) -> Self {
        GeminiAnalyzer {
            client,
            api_key,
            model_id: model_id.unwrap_or_else(|| "gemini-2.0-flash".to_string()),
            resolver: Box::new(ExactNameResolver),
        }
    }

    pub fn with_resolver(mut self, resolver: Box<dyn CharacterResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    fn tool_declaration(scene_count: usize) -> serde_json::Value {
        serde_json::json!({
            "functionDeclarations": [{
                "name": "create_comic_scenes",
                "description": format!("Record exactly {scene_count} comic scenes for the storyboard."),
                "parameters": {
                    "type": "object",
                    "properties": {
                        "scenes": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "description": { "type": "string" },
                                    "mood": { "type": "string" },
                                    "quote": { "type": "string" }
                                },
                                "required": ["description", "mood"]
                            }
                        }
                    },
                    "required": ["scenes"]
                }
            }]
        })
    }

    /// Pull the first functionCall args out of a generateContent reply.
    fn function_call_args(value: &serde_json::Value) -> Option<serde_json::Value> {
        let candidates = value.get("candidates")?.as_array()?;
        for cand in candidates {
            let parts = cand.get("content")?.get("parts")?.as_array()?;
            for part in parts {
                if let Some(call) = part.get("functionCall") {
                    if call.get("name").and_then(|n| n.as_str()) == Some("create_comic_scenes") {
                        return call.get("args").cloned();
                    }
                }
            }
        }
        None
    }
}

#[async_trait]
impl StoryAnalyzer for GeminiAnalyzer {
    async fn analyze(
        &self,
        story: &str,
        characters: &[Character],
        scene_count: usize,
    ) -> Result<Vec<SceneDraft>> {
        let api_key = self
            .api_key
            .clone()
            .or_else(|| std::env::var("GEMINI_API_KEY").ok())
            .ok_or_else(|| PipelineError::Config("Gemini API key not set".into()))?;

        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.model_id
        );

        let body = serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": analysis_prompt(story, characters, scene_count) }]
            }],
            "tools": [Self::tool_declaration(scene_count)],
            "toolConfig": {
                "functionCallingConfig": { "mode": "ANY" }
            }
        });

        let resp = self
            .client
            .post(&url)
            .header("X-goog-api-key", api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(PipelineError::AnalysisFormat(format!(
                "analysis model error: HTTP {}",
                resp.status()
            )));
        }

        let value: serde_json::Value = resp.json().await?;
        let args = Self::function_call_args(&value).ok_or_else(|| {
            warn!("analysis reply contained no function call");
            PipelineError::AnalysisFormat("model did not return a function call".into())
        })?;

        let scenes = parse_scene_args(&args, scene_count)?;
        Ok(scenes
            .into_iter()
            .enumerate()
            .map(|(order, (description, mood, quote))| {
                let character_ids =
                    resolve_character_ids(&description, characters, self.resolver.as_ref());
                SceneDraft {
                    order,
                    description,
                    mood,
                    quote,
                    character_ids,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn character(id: &str, name: &str) -> Character {
        Character {
            id: id.into(),
            user_id: "u1".into(),
            name: name.into(),
            avatar_url: String::new(),
            created_at: String::new(),
        }
    }

    #[test]
    fn tokens_extracted_in_order_without_dupes() {
        let tokens = extract_name_tokens("<Mina> waves. <Theo> waves back at <Mina>.");
        assert_eq!(tokens, vec!["Mina".to_string(), "Theo".to_string()]);
    }

    #[test]
    fn unmatched_tokens_dropped_silently() {
        let roster = vec![character("c1", "Mina")];
        let ids = resolve_character_ids("<Mina> meets <Stranger>.", &roster, &ExactNameResolver);
        assert_eq!(ids, vec!["c1".to_string()]);
    }

    #[test]
    fn exact_resolver_is_case_sensitive() {
        let roster = vec![character("c1", "Mina")];
        assert!(ExactNameResolver.resolve("mina", &roster).is_none());
        assert_eq!(ExactNameResolver.resolve("Mina", &roster), Some("c1".into()));
    }

    #[test]
    fn scene_count_mismatch_is_a_hard_failure() {
        let args = serde_json::json!({
            "scenes": [
                { "description": "<A> wakes up.", "mood": "sleepy" },
                { "description": "<A> makes tea.", "mood": "calm" }
            ]
        });
        let err = parse_scene_args(&args, 4).unwrap_err();
        assert!(matches!(err, PipelineError::AnalysisFormat(_)));
    }

    #[test]
    fn valid_args_parse_with_optional_quote() {
        let args = serde_json::json!({
            "scenes": [
                { "description": "<A> wakes up.", "mood": "sleepy", "quote": "five more minutes" },
                { "description": "<A> makes tea.", "mood": "calm" }
            ]
        });
        let scenes = parse_scene_args(&args, 2).unwrap();
        assert_eq!(scenes[0].2.as_deref(), Some("five more minutes"));
        assert!(scenes[1].2.is_none());
    }

    #[test]
    fn empty_description_rejected() {
        let args = serde_json::json!({
            "scenes": [{ "description": "   ", "mood": "calm" }]
        });
        assert!(parse_scene_args(&args, 1).is_err());
    }

    #[test]
    fn function_call_args_found_in_reply() {
        let reply = serde_json::json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "ok" },
                        { "functionCall": {
                            "name": "create_comic_scenes",
                            "args": { "scenes": [] }
                        }}
                    ]
                }
            }]
        });
        let args = GeminiAnalyzer::function_call_args(&reply).unwrap();
        assert!(args.get("scenes").is_some());
    }
}
