//! System prompt selection.
//!
//! The worker system prompt ships embedded in the binary; a session may point
//! `prompts.system_md_url` at a remote override, fetched once at startup with
//! a bounded timeout and falling back to the embedded default on any failure.

use rust_embed::RustEmbed;
use tracing::warn;

use crate::config::SessionConfig;

#[derive(RustEmbed)]
#[folder = "prompts/"]
struct EmbeddedPrompts;

const DEFAULT_SYSTEM: &str = "default_system.md";

/// The embedded default system prompt.
pub fn embedded_system_prompt() -> String {
    EmbeddedPrompts::get(DEFAULT_SYSTEM)
        .map(|file| String::from_utf8_lossy(file.data.as_ref()).into_owned())
        .unwrap_or_default()
}

/// Resolve the system prompt for this session: remote override when
/// configured and reachable, embedded default otherwise.
pub async fn select_system_prompt(config: &SessionConfig) -> String {
    let Some(url) = &config.prompts.system_md_url else {
        return embedded_system_prompt();
    };
    match fetch_remote(url, config).await {
        Ok(body) if !body.trim().is_empty() => body,
        Ok(_) => {
            warn!(url, "remote system prompt is empty, using embedded default");
            embedded_system_prompt()
        }
        Err(e) => {
            warn!(url, error = %e, "failed to fetch remote system prompt, using embedded default");
            embedded_system_prompt()
        }
    }
}

async fn fetch_remote(url: &str, config: &SessionConfig) -> anyhow::Result<String> {
    let client = reqwest::Client::builder()
        .timeout(config.prompt_fetch_timeout())
        .build()?;
    let response = client.get(url).send().await?.error_for_status()?;
    Ok(response.text().await?)
}
