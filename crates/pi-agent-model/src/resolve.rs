// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Turn a [`pi_agent_config::ModelConfig`] into the [`Model`] descriptor an
//! adapter actually streams against: default base URL and `api` tag per
//! provider, and API key resolution per spec §6 "Authentication"
//! (`get_api_key(provider)` override, falling back to the provider's
//! environment-variable convention). No model catalog ships here — the
//! catalog's pricing/context-window database is out of scope (spec §1,
//! `DESIGN.md`); callers that want it fill `Model::cost`/`context_window`/
//! `max_tokens` themselves (e.g. from `ModelConfig`, or their own table).

use pi_agent_config::{Config, ModelConfig};

use crate::types::Model;

/// The environment variable each provider's credential is conventionally
/// read from (spec §6 "Authentication"), used when neither an explicit
/// `api_key`/`api_key_env` in config nor a `get_api_key` override supplies
/// one. Grounded in the teacher's `sven-model::registry::DriverMeta::
/// default_api_key_env` table.
pub fn default_api_key_env(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("OPENAI_API_KEY"),
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "google" => Some("GEMINI_API_KEY"),
        "azure" => Some("AZURE_OPENAI_API_KEY"),
        "mistral" => Some("MISTRAL_API_KEY"),
        "xai" => Some("XAI_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "zhipu" => Some("ZHIPU_API_KEY"),
        "groq" => Some("GROQ_API_KEY"),
        "mock" => None,
        _ => None,
    }
}

/// The `api` tag a provider speaks by default (spec §4.D dispatcher key),
/// used when `ModelConfig` doesn't name one explicitly. Reasoning-capable
/// OpenAI models (o1/o3/gpt-5-family) use the `/responses` wire shape
/// instead; callers that need it select `"openai-responses"` via
/// `ModelConfig::driver_options` (`{"api": "openai-responses"}`) since the
/// catalog that would otherwise tell us a model is reasoning-only is out
/// of scope here.
fn default_api_tag(provider: &str) -> &'static str {
    match provider {
        "openai" => "openai-completions",
        "anthropic" => "anthropic-messages",
        "google" => "google-generative-ai",
        "azure" => "azure-openai-responses",
        "mistral" => "mistral-chat",
        "xai" => "xai-chat",
        "openrouter" => "openrouter-chat",
        "zhipu" => "zhipu-chat",
        "groq" => "groq-chat",
        "mock" => "mock",
        other => other,
    }
}

fn default_base_url(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("https://api.openai.com/v1"),
        "anthropic" => Some("https://api.anthropic.com"),
        "google" => Some("https://generativelanguage.googleapis.com"),
        "mistral" => Some("https://api.mistral.ai/v1"),
        "xai" => Some("https://api.x.ai/v1"),
        "openrouter" => Some("https://openrouter.ai/api/v1"),
        "zhipu" => Some("https://open.bigmodel.cn/api/paas/v4"),
        "groq" => Some("https://api.groq.com/openai/v1"),
        _ => None,
    }
}

/// Resolve the API key for `provider`: an explicit `get_api_key` override
/// wins, then `ModelConfig::api_key`, then the variable named by
/// `ModelConfig::api_key_env`, then the provider's conventional env var
/// (spec §6).
pub fn resolve_api_key(
    provider: &str,
    model_config: &ModelConfig,
    get_api_key: Option<&dyn Fn(&str) -> Option<String>>,
) -> Option<String> {
    if let Some(hook) = get_api_key {
        if let Some(key) = hook(provider) {
            return Some(key);
        }
    }
    if let Some(key) = &model_config.api_key {
        return Some(key.clone());
    }
    if let Some(var) = &model_config.api_key_env {
        if let Ok(key) = std::env::var(var) {
            return Some(key);
        }
    }
    default_api_key_env(provider).and_then(|var| std::env::var(var).ok())
}

/// Resolve a named entry out of `config` (or the top-level `config.model`
/// when `name` is `None`) into a [`Model`] descriptor ready to hand to an
/// adapter via the registry. `name` may address `config.providers` by key,
/// as documented on [`pi_agent_config::Config::providers`]. The API key
/// itself is resolved separately, per call, via [`resolve_api_key`].
pub fn resolve_model_from_config(config: &Config, name: Option<&str>) -> anyhow::Result<Model> {
    let model_config: &ModelConfig = match name {
        None => &config.model,
        Some(key) => config
            .providers
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("no provider config named '{key}'"))?,
    };

    let api_tag = model_config
        .driver_options
        .get("api")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| default_api_tag(&model_config.provider).to_string());

    let base_url = model_config
        .base_url
        .clone()
        .or_else(|| default_base_url(&model_config.provider).map(str::to_string));

    Ok(Model {
        id: model_config.name.clone(),
        name: model_config.name.clone(),
        api: api_tag,
        provider: model_config.provider.clone(),
        base_url,
        reasoning: false,
        input_modalities: vec![crate::types::InputModality::Text],
        cost: Default::default(),
        context_window: 0,
        max_tokens: model_config.max_tokens.unwrap_or(4096),
        headers: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_api_key_env_matches_spec_table() {
        assert_eq!(default_api_key_env("openai"), Some("OPENAI_API_KEY"));
        assert_eq!(default_api_key_env("anthropic"), Some("ANTHROPIC_API_KEY"));
        assert_eq!(default_api_key_env("google"), Some("GEMINI_API_KEY"));
        assert_eq!(default_api_key_env("mock"), None);
    }

    #[test]
    fn resolves_default_model_from_config() {
        let config = Config::default();
        let model = resolve_model_from_config(&config, None).unwrap();
        assert_eq!(model.provider, "openai");
        assert_eq!(model.api, "openai-completions");
        assert_eq!(model.base_url.as_deref(), Some("https://api.openai.com/v1"));
    }

    #[test]
    fn resolves_named_provider_entry() {
        let mut config = Config::default();
        config.providers.insert(
            "work_anthropic".into(),
            ModelConfig { provider: "anthropic".into(), name: "claude-opus-4-5".into(), ..Default::default() },
        );
        let model = resolve_model_from_config(&config, Some("work_anthropic")).unwrap();
        assert_eq!(model.provider, "anthropic");
        assert_eq!(model.api, "anthropic-messages");
        assert_eq!(model.id, "claude-opus-4-5");
    }

    #[test]
    fn unknown_named_provider_errors() {
        let config = Config::default();
        assert!(resolve_model_from_config(&config, Some("nope")).is_err());
    }

    #[test]
    fn explicit_api_key_hook_wins_over_env() {
        let config = Config::default();
        let hook: &dyn Fn(&str) -> Option<String> = &|_p: &str| Some("hook-key".into());
        let key = resolve_api_key("openai", &config.model, Some(hook));
        assert_eq!(key.as_deref(), Some("hook-key"));
    }

    #[test]
    fn driver_options_api_override_wins_over_default_tag() {
        let mut config = Config::default();
        config.model.driver_options = serde_json::json!({"api": "openai-responses"});
        let model = resolve_model_from_config(&config, None).unwrap();
        assert_eq!(model.api, "openai-responses");
    }
}
