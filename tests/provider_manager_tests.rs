use async_trait::async_trait;
use devflow::provider::{
    ChatStream, Provider, ProviderError, ProviderHealth, ProviderType, UnifiedChatRequest,
    UnifiedChatResponse, UnifiedModel,
};
use devflow::provider_manager::{ProviderManager, SelectionStrategy};
use devflow::rate_limiter::RateLimitConfig;
use devflow::state_store::{MemoryStore, StateStore};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

struct MockProvider {
    name: String,
    provider_type: ProviderType,
    available: AtomicBool,
    latency_ms: u64,
    fail_listing: bool,
    chat_calls: AtomicUsize,
}

impl MockProvider {
    fn new(provider_type: ProviderType, available: bool, latency_ms: u64) -> Self {
        Self {
            name: provider_type.as_str().to_string(),
            provider_type,
            available: AtomicBool::new(available),
            latency_ms,
            fail_listing: false,
            chat_calls: AtomicUsize::new(0),
        }
    }

    fn with_broken_listing(mut self) -> Self {
        self.fail_listing = true;
        self
    }

    fn chat_calls(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn list_models(&self) -> Result<Vec<UnifiedModel>, ProviderError> {
        if self.fail_listing {
            return Err(ProviderError::Api("listing broken".to_string()));
        }
        Ok(vec![devflow::provider::infer_model(
            &format!("llama3-{}", self.name),
            self.provider_type,
        )])
    }

    async fn chat(&self, _request: &UnifiedChatRequest) -> Result<UnifiedChatResponse, ProviderError> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        Ok(UnifiedChatResponse::text(format!("reply from {}", self.name)))
    }

    async fn stream_chat(&self, _request: &UnifiedChatRequest) -> Result<ChatStream, ProviderError> {
        let chunks = vec![Ok("re".to_string()), Ok("ply".to_string())];
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(vec![0.25, 0.5, 0.75])
    }

    async fn check_health(&self) -> ProviderHealth {
        if self.is_available() {
            ProviderHealth::healthy(self.latency_ms)
        } else {
            ProviderHealth::unhealthy(self.latency_ms, "connection refused")
        }
    }
}

fn manager_with(providers: Vec<Arc<MockProvider>>) -> ProviderManager {
    let manager = ProviderManager::new();
    for provider in providers {
        manager.register_provider(provider);
    }
    manager
}

#[tokio::test]
async fn preferred_strategy_falls_back_when_active_unhealthy() {
    // S6: active P1 unhealthy, P2 healthy, strategy = preferred.
    let p1 = Arc::new(MockProvider::new(ProviderType::Ollama, false, 10));
    let p2 = Arc::new(MockProvider::new(ProviderType::LmStudio, true, 20));
    let manager = manager_with(vec![p1.clone(), p2.clone()]);
    manager.set_selection_strategy(SelectionStrategy::Preferred);
    assert!(manager.set_active_provider(ProviderType::Ollama));

    let response = manager
        .chat(&UnifiedChatRequest::new("m").with_user_message("hi"))
        .await
        .unwrap();
    assert_eq!(response.content.as_deref(), Some("reply from lmstudio"));
    assert_eq!(p1.chat_calls(), 0);
    assert_eq!(p2.chat_calls(), 1);
}

#[tokio::test]
async fn chat_prefers_available_active_provider() {
    let p1 = Arc::new(MockProvider::new(ProviderType::Ollama, true, 10));
    let p2 = Arc::new(MockProvider::new(ProviderType::LmStudio, true, 1));
    let manager = manager_with(vec![p1.clone(), p2.clone()]);
    manager.set_active_provider(ProviderType::LmStudio);

    manager
        .chat(&UnifiedChatRequest::new("m").with_user_message("hi"))
        .await
        .unwrap();
    assert_eq!(p2.chat_calls(), 1);
    assert_eq!(p1.chat_calls(), 0);
}

#[tokio::test]
async fn first_available_respects_insertion_order_and_enabled_flags() {
    let p1 = Arc::new(MockProvider::new(ProviderType::Ollama, true, 10));
    let p2 = Arc::new(MockProvider::new(ProviderType::LmStudio, true, 1));
    let manager = manager_with(vec![p1.clone(), p2.clone()]);

    let best = manager.get_best_available_provider().await.unwrap();
    assert_eq!(best.provider_type(), ProviderType::Ollama);

    manager.set_provider_enabled(ProviderType::Ollama, false);
    let best = manager.get_best_available_provider().await.unwrap();
    assert_eq!(best.provider_type(), ProviderType::LmStudio);
}

#[tokio::test]
async fn lowest_latency_picks_fastest_healthy() {
    let slow = Arc::new(MockProvider::new(ProviderType::Ollama, true, 90));
    let fast = Arc::new(MockProvider::new(ProviderType::LmStudio, true, 5));
    let fastest_but_down = Arc::new(MockProvider::new(ProviderType::OpenAi, false, 1));
    let manager = manager_with(vec![slow, fast, fastest_but_down]);
    manager.set_selection_strategy(SelectionStrategy::LowestLatency);

    let best = manager.get_best_available_provider().await.unwrap();
    assert_eq!(best.provider_type(), ProviderType::LmStudio);
}

#[tokio::test]
async fn round_robin_rotates_available_providers() {
    let p1 = Arc::new(MockProvider::new(ProviderType::Ollama, true, 10));
    let p2 = Arc::new(MockProvider::new(ProviderType::LmStudio, true, 10));
    let manager = manager_with(vec![p1, p2]);
    manager.set_selection_strategy(SelectionStrategy::RoundRobin);

    let first = manager.get_best_available_provider().await.unwrap().provider_type();
    let second = manager.get_best_available_provider().await.unwrap().provider_type();
    let third = manager.get_best_available_provider().await.unwrap().provider_type();
    assert_ne!(first, second);
    assert_eq!(first, third);
}

#[tokio::test]
async fn chat_without_any_provider_errors() {
    let manager = ProviderManager::new();
    let err = manager
        .chat(&UnifiedChatRequest::new("m").with_user_message("hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::NoProvidersAvailable));

    // Registered but unhealthy providers are not selectable either.
    let down = Arc::new(MockProvider::new(ProviderType::Ollama, false, 10));
    let manager = manager_with(vec![down]);
    let err = manager
        .chat(&UnifiedChatRequest::new("m").with_user_message("hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::NoProvidersAvailable));
}

#[tokio::test]
async fn stream_chat_requires_active_provider() {
    let p1 = Arc::new(MockProvider::new(ProviderType::Ollama, true, 10));
    let manager = manager_with(vec![p1]);

    let err = match manager
        .stream_chat(&UnifiedChatRequest::new("m").streaming())
        .await
    {
        Err(e) => e,
        Ok(_) => panic!("expected an error"),
    };
    assert!(matches!(err, ProviderError::NoActiveProvider));

    manager.set_active_provider(ProviderType::Ollama);
    let mut stream = manager
        .stream_chat(&UnifiedChatRequest::new("m").streaming())
        .await
        .unwrap();
    let mut collected = String::new();
    while let Some(delta) = stream.next().await {
        collected.push_str(&delta.unwrap());
    }
    assert_eq!(collected, "reply");
}

#[tokio::test]
async fn embed_routes_through_selection() {
    let p1 = Arc::new(MockProvider::new(ProviderType::Ollama, true, 10));
    let manager = manager_with(vec![p1]);
    let vector = manager.embed("hello").await.unwrap();
    assert_eq!(vector, vec![0.25, 0.5, 0.75]);
}

#[tokio::test]
async fn model_listing_swallows_per_provider_failures() {
    let ok = Arc::new(MockProvider::new(ProviderType::Ollama, true, 10));
    let broken = Arc::new(MockProvider::new(ProviderType::LmStudio, true, 10).with_broken_listing());
    let manager = manager_with(vec![ok, broken]);

    let models = manager.list_all_models().await;
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].provider, ProviderType::Ollama);
}

#[tokio::test]
async fn available_model_listing_skips_down_providers() {
    let up = Arc::new(MockProvider::new(ProviderType::Ollama, true, 10));
    let down = Arc::new(MockProvider::new(ProviderType::LmStudio, false, 10));
    let manager = manager_with(vec![up, down]);
    let models = manager.list_available_models().await;
    assert_eq!(models.len(), 1);
}

#[tokio::test]
async fn check_all_health_reports_every_provider() {
    let up = Arc::new(MockProvider::new(ProviderType::Ollama, true, 7));
    let down = Arc::new(MockProvider::new(ProviderType::LmStudio, false, 3));
    let manager = manager_with(vec![up, down]);

    let report = manager.check_all_health().await;
    assert_eq!(report.len(), 2);
    assert!(report[&ProviderType::Ollama].healthy);
    assert!(!report[&ProviderType::LmStudio].healthy);
    assert_eq!(report[&ProviderType::LmStudio].error.as_deref(), Some("connection refused"));
}

#[tokio::test]
async fn state_persists_and_reloads() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());

    {
        let manager = ProviderManager::new().with_state_store(store.clone());
        manager.initialize();
        manager.set_selection_strategy(SelectionStrategy::Preferred);
        manager.set_active_provider(ProviderType::LmStudio);
        manager.set_provider_enabled(ProviderType::Ollama, false);
    }

    let reloaded = ProviderManager::new().with_state_store(store.clone());
    reloaded.initialize();
    assert_eq!(reloaded.selection_strategy(), SelectionStrategy::Preferred);
    assert_eq!(
        reloaded.get_active_provider().unwrap().provider_type(),
        ProviderType::LmStudio
    );
    assert!(!reloaded.is_provider_enabled(ProviderType::Ollama));
    assert!(reloaded.is_provider_enabled(ProviderType::LmStudio));

    // The document has the expected shape.
    let document = store.load("provider_manager").unwrap().unwrap();
    assert_eq!(document["selection_strategy"], "preferred");
    assert_eq!(document["active_provider"], "lmstudio");
    assert_eq!(document["provider_configs"]["ollama"], false);
}

#[tokio::test]
async fn rate_limiter_is_shared_across_calls() {
    let p1 = Arc::new(MockProvider::new(ProviderType::Ollama, true, 10));
    let manager = manager_with(vec![p1])
        .with_rate_limit_config(RateLimitConfig::new(100, 60, 10, 100, true).unwrap());

    manager.chat(&UnifiedChatRequest::new("m").with_user_message("a")).await.unwrap();
    manager.embed("b").await.unwrap();
    let stats = manager.rate_limit_stats();
    assert_eq!(stats.total_requests, 2);

    manager.reset_rate_limiter();
    assert_eq!(manager.rate_limit_stats().total_requests, 0);
}

#[tokio::test]
async fn rate_limit_config_round_trips_through_manager() {
    let manager = ProviderManager::new();
    let config = RateLimitConfig::new(5, 30, 250, 4000, true).unwrap();
    manager.update_rate_limit_config(config.clone()).unwrap();
    assert_eq!(manager.rate_limit_config(), config);

    let invalid = RateLimitConfig {
        base_delay_ms: 0,
        ..RateLimitConfig::default()
    };
    assert!(manager.update_rate_limit_config(invalid).is_err());
    // The previous config is untouched.
    assert_eq!(manager.rate_limit_config(), config);
}
