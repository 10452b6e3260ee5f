//! Model discovery and listing.
//!
//! The backend's `/models` endpoint is the source of truth; the config's
//! alias table is layered on top so clients see the names they are expected
//! to ask for. Both the Ollama (`/api/tags`) and `OpenAI` (`/v1/models`)
//! listings are derived from the same merged set.

use chrono::{DateTime, Utc};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::translate::ollama_types::{ModelTag, TagsResponse};
use crate::translate::openai_types::{ModelObject, ModelsResponse};
use crate::upstream::UpstreamClient;

/// Fetch the backend's model ids through the resilient client.
pub async fn fetch_upstream_models(client: &UpstreamClient) -> Result<Vec<String>> {
    let response = client.get("/models").await?;
    let status = response.status().as_u16();
    if status >= 400 {
        let body = response.text().await.unwrap_or_default();
        return Err(ProxyError::upstream(
            status,
            format!("model listing failed: {}", truncate(&body, 300)),
        ));
    }

    let parsed: ModelsResponse = response
        .json()
        .await
        .map_err(|e| ProxyError::translation(format!("unparseable model listing: {e}")))?;

    Ok(parsed.data.into_iter().map(|m| m.id).collect())
}

/// Merge configured aliases with the backend's ids: aliases first (they are
/// what clients should use), then any unmapped backend id. Order is
/// deterministic so repeated listings compare equal.
#[must_use]
pub fn merged_model_names(config: &ProxyConfig, upstream_ids: &[String]) -> Vec<String> {
    let mut names: Vec<String> = config.models.keys().cloned().collect();
    names.sort();

    let mapped: Vec<&String> = config.models.values().collect();
    let mut rest: Vec<String> = upstream_ids
        .iter()
        .filter(|id| !mapped.contains(id) && !names.contains(id))
        .cloned()
        .collect();
    rest.sort();

    names.extend(rest);
    names
}

/// Shape the merged set as an Ollama `/api/tags` listing. Size and digest
/// are synthetic; Ollama clients only key on the name.
#[must_use]
pub fn to_tags_response(names: &[String], now: DateTime<Utc>) -> TagsResponse {
    TagsResponse {
        models: names
            .iter()
            .map(|name| ModelTag {
                name: name.clone(),
                modified_at: now,
                size: 0,
                digest: synthetic_digest(name),
            })
            .collect(),
    }
}

/// Shape the merged set as an `OpenAI` `/v1/models` listing.
#[must_use]
pub fn to_models_response(names: &[String], now: DateTime<Utc>) -> ModelsResponse {
    ModelsResponse {
        object: Some("list".to_string()),
        data: names
            .iter()
            .map(|name| ModelObject {
                id: name.clone(),
                object: Some("model".to_string()),
                created: Some(now.timestamp().max(0) as u64),
                owned_by: Some("proxy".to_string()),
            })
            .collect(),
    }
}

// FNV-1a over the name, presented in the digest shape Ollama clients expect.
fn synthetic_digest(name: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("sha256:{hash:016x}")
}

// Clamp to a char boundary: upstream error bodies are arbitrary UTF-8 and a
// raw byte slice would panic mid-character.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
