// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Process-wide registry mapping an api tag (e.g. `"openai-compat"`,
//! `"anthropic"`, `"google"`) to the [`ModelAdapter`] that speaks it.
//!
//! Registration is idempotent last-writer-wins: registering the same api
//! tag twice replaces the previous adapter. Adapters registered on behalf
//! of a plugin carry a `source_id` so the whole set can be torn down
//! atomically with [`unregister_api_providers`] when the plugin unloads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::provider::ModelAdapter;

struct Entry {
    adapter: Arc<dyn ModelAdapter>,
    source_id: Option<String>,
}

fn registry() -> &'static Mutex<HashMap<String, Entry>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Entry>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register `adapter` under its own `api()` tag, replacing any adapter
/// previously registered under that tag. `source_id` identifies the
/// plugin/caller that registered it, for later bulk removal; pass `None`
/// for adapters that live for the process lifetime.
pub fn register_api_provider(adapter: Arc<dyn ModelAdapter>, source_id: Option<String>) {
    let api = adapter.api().to_string();
    registry().lock().expect("registry mutex poisoned").insert(
        api,
        Entry {
            adapter,
            source_id,
        },
    );
}

/// Look up the adapter registered for `api_tag`.
pub fn get_api_provider(api_tag: &str) -> Option<Arc<dyn ModelAdapter>> {
    registry()
        .lock()
        .expect("registry mutex poisoned")
        .get(api_tag)
        .map(|e| e.adapter.clone())
}

/// Remove every adapter registered with the given `source_id`.
pub fn unregister_api_providers(source_id: &str) {
    registry()
        .lock()
        .expect("registry mutex poisoned")
        .retain(|_, e| e.source_id.as_deref() != Some(source_id));
}

/// Remove every registered adapter. Primarily useful to reset state
/// between tests.
pub fn clear_api_providers() {
    registry().lock().expect("registry mutex poisoned").clear();
}

/// List the api tags currently registered.
pub fn registered_apis() -> Vec<String> {
    registry()
        .lock()
        .expect("registry mutex poisoned")
        .keys()
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AssistantMessageEvent;
    use crate::provider::{new_assistant_message_stream, AssistantMessageEventStream};
    use crate::types::{CompletionOptions, Context, Model};
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct StubAdapter(&'static str);

    #[async_trait]
    impl ModelAdapter for StubAdapter {
        fn api(&self) -> &str {
            self.0
        }

        async fn stream(
            &self,
            _model: &Model,
            _context: &Context,
            _options: &CompletionOptions,
            _cancel: CancellationToken,
        ) -> anyhow::Result<AssistantMessageEventStream> {
            let stream = new_assistant_message_stream(|_| None);
            stream.push(AssistantMessageEvent::Done);
            Ok(stream)
        }
    }

    #[test]
    fn register_then_lookup_roundtrips() {
        clear_api_providers();
        register_api_provider(Arc::new(StubAdapter("test-api-a")), None);
        assert!(get_api_provider("test-api-a").is_some());
        assert!(get_api_provider("test-api-nonexistent").is_none());
    }

    #[test]
    fn registering_same_tag_twice_replaces_last_writer_wins() {
        clear_api_providers();
        register_api_provider(Arc::new(StubAdapter("test-api-b")), None);
        register_api_provider(Arc::new(StubAdapter("test-api-b")), Some("plugin-1".into()));
        assert!(registered_apis().iter().filter(|a| *a == "test-api-b").count() == 1);
    }

    #[test]
    fn unregister_api_providers_removes_only_matching_source() {
        clear_api_providers();
        register_api_provider(Arc::new(StubAdapter("test-api-c")), Some("plugin-x".into()));
        register_api_provider(Arc::new(StubAdapter("test-api-d")), Some("plugin-y".into()));
        unregister_api_providers("plugin-x");
        assert!(get_api_provider("test-api-c").is_none());
        assert!(get_api_provider("test-api-d").is_some());
    }

    #[test]
    fn clear_api_providers_empties_the_registry() {
        clear_api_providers();
        register_api_provider(Arc::new(StubAdapter("test-api-e")), None);
        clear_api_providers();
        assert!(registered_apis().is_empty());
    }
}
