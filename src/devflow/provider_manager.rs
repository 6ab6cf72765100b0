//! Unified façade over registered LLM providers.
//!
//! The [`ProviderManager`] owns a keyed registry of [`Provider`]s, selects
//! one per call through a pluggable [`SelectionStrategy`], and gates every
//! outbound call through a single sliding-window
//! [`RateLimiter`](crate::RateLimiter). Its registry state (active provider,
//! strategy, per-provider enabled flags) persists as one named document
//! through an injected [`StateStore`].
//!
//! # Example
//!
//! ```rust,no_run
//! use devflow::provider::UnifiedChatRequest;
//! use devflow::provider_manager::ProviderManager;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = ProviderManager::new();
//!     manager.initialize();
//!
//!     let request = UnifiedChatRequest::new("llama3").with_user_message("Hello!");
//!     let response = manager.chat(&request).await?;
//!     println!("{}", response.content.unwrap_or_default());
//!     Ok(())
//! }
//! ```

use crate::devflow::provider::{
    ChatStream, Provider, ProviderError, ProviderHealth, ProviderType, UnifiedChatRequest,
    UnifiedChatResponse, UnifiedModel,
};
use crate::devflow::providers::{LmStudioProvider, OllamaProvider};
use crate::devflow::rate_limiter::{
    RateLimitConfig, RateLimitError, RateLimitStats, RateLimiter,
};
use crate::devflow::state_store::StateStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Name of the persisted state document.
const STATE_DOCUMENT: &str = "provider_manager";

/// How [`get_best_available_provider`](ProviderManager::get_best_available_provider)
/// picks a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// First enabled provider whose latest health check was healthy.
    FirstAvailable,
    /// Health-check every enabled provider and take the fastest healthy one.
    LowestLatency,
    /// The active provider when healthy, else fall back to first-available.
    Preferred,
    /// Rotate through the enabled, available providers in insertion order.
    RoundRobin,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::FirstAvailable => "first_available",
            SelectionStrategy::LowestLatency => "lowest_latency",
            SelectionStrategy::Preferred => "preferred",
            SelectionStrategy::RoundRobin => "round_robin",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "first_available" => Some(SelectionStrategy::FirstAvailable),
            "lowest_latency" => Some(SelectionStrategy::LowestLatency),
            "preferred" => Some(SelectionStrategy::Preferred),
            "round_robin" => Some(SelectionStrategy::RoundRobin),
            _ => None,
        }
    }
}

/// The persisted slice of manager state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedState {
    active_provider: Option<String>,
    selection_strategy: String,
    provider_configs: HashMap<String, bool>,
}

struct Registry {
    providers: HashMap<ProviderType, Arc<dyn Provider>>,
    /// Insertion order; drives first-available and round-robin selection.
    order: Vec<ProviderType>,
}

/// Unified manager over all registered providers.
///
/// All operations are safe under concurrent callers. Registry locks are
/// short-lived and never held across an await; the rate limiter serializes
/// only its own admission decision.
pub struct ProviderManager {
    registry: RwLock<Registry>,
    enabled: RwLock<HashMap<ProviderType, bool>>,
    active: RwLock<Option<ProviderType>>,
    strategy: RwLock<SelectionStrategy>,
    rate_limiter: RateLimiter,
    store: Option<Arc<dyn StateStore>>,
    initialized: AtomicBool,
    round_robin_cursor: AtomicUsize,
}

impl Default for ProviderManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderManager {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry {
                providers: HashMap::new(),
                order: Vec::new(),
            }),
            enabled: RwLock::new(HashMap::new()),
            active: RwLock::new(None),
            strategy: RwLock::new(SelectionStrategy::FirstAvailable),
            rate_limiter: RateLimiter::new(RateLimitConfig::default()),
            store: None,
            initialized: AtomicBool::new(false),
            round_robin_cursor: AtomicUsize::new(0),
        }
    }

    /// Attach a persistence store (builder pattern). State is reloaded on
    /// [`initialize`](ProviderManager::initialize) and saved on every
    /// configuration change.
    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the default rate-limit configuration (builder pattern).
    ///
    /// An invalid config is rejected and logged; the default stays in place.
    pub fn with_rate_limit_config(self, config: RateLimitConfig) -> Self {
        if let Err(e) = self.rate_limiter.update_config(config) {
            log::warn!("ignoring invalid rate limit config: {}", e);
        }
        self
    }

    /// Register the built-in local providers and reload persisted state.
    ///
    /// Idempotent: repeated calls return immediately.
    pub fn initialize(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        self.register_provider(Arc::new(OllamaProvider::new()));
        self.register_provider(Arc::new(LmStudioProvider::new()));
        self.load_state();
        log::info!(
            "provider manager initialized with {} providers",
            self.registry.read().unwrap().order.len()
        );
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Register a provider, replacing any previous provider of the same
    /// type. New registrations are enabled by default.
    pub fn register_provider(&self, provider: Arc<dyn Provider>) {
        let provider_type = provider.provider_type();
        let mut registry = self.registry.write().unwrap();
        if registry.providers.insert(provider_type, provider).is_none() {
            registry.order.push(provider_type);
        }
        drop(registry);
        self.enabled
            .write()
            .unwrap()
            .entry(provider_type)
            .or_insert(true);
    }

    /// Remove a provider. Clears the active pointer when it referenced the
    /// removed provider.
    pub fn unregister_provider(&self, provider_type: ProviderType) -> Option<Arc<dyn Provider>> {
        let mut registry = self.registry.write().unwrap();
        let removed = registry.providers.remove(&provider_type);
        registry.order.retain(|t| *t != provider_type);
        drop(registry);
        self.enabled.write().unwrap().remove(&provider_type);
        let mut active = self.active.write().unwrap();
        if *active == Some(provider_type) {
            *active = None;
        }
        removed
    }

    pub fn get_provider(&self, provider_type: ProviderType) -> Option<Arc<dyn Provider>> {
        self.registry.read().unwrap().providers.get(&provider_type).cloned()
    }

    /// All providers in insertion order.
    pub fn get_all_providers(&self) -> Vec<Arc<dyn Provider>> {
        let registry = self.registry.read().unwrap();
        registry
            .order
            .iter()
            .filter_map(|t| registry.providers.get(t).cloned())
            .collect()
    }

    /// Providers whose latest health check was healthy.
    pub fn get_available_providers(&self) -> Vec<Arc<dyn Provider>> {
        self.get_all_providers()
            .into_iter()
            .filter(|p| p.is_available())
            .collect()
    }

    pub fn get_enabled_providers(&self) -> Vec<Arc<dyn Provider>> {
        let enabled = self.enabled.read().unwrap();
        self.get_all_providers()
            .into_iter()
            .filter(|p| enabled.get(&p.provider_type()).copied().unwrap_or(false))
            .collect()
    }

    pub fn is_provider_enabled(&self, provider_type: ProviderType) -> bool {
        self.enabled
            .read()
            .unwrap()
            .get(&provider_type)
            .copied()
            .unwrap_or(false)
    }

    pub fn set_provider_enabled(&self, provider_type: ProviderType, enabled: bool) {
        self.enabled.write().unwrap().insert(provider_type, enabled);
        self.persist();
    }

    /// Point the manager at a provider. Returns `false` when the type is not
    /// registered; the previous active pointer is kept in that case.
    pub fn set_active_provider(&self, provider_type: ProviderType) -> bool {
        if self.get_provider(provider_type).is_none() {
            return false;
        }
        *self.active.write().unwrap() = Some(provider_type);
        self.persist();
        true
    }

    pub fn get_active_provider(&self) -> Option<Arc<dyn Provider>> {
        let active = (*self.active.read().unwrap())?;
        self.get_provider(active)
    }

    pub fn set_selection_strategy(&self, strategy: SelectionStrategy) {
        *self.strategy.write().unwrap() = strategy;
        self.persist();
    }

    pub fn selection_strategy(&self) -> SelectionStrategy {
        *self.strategy.read().unwrap()
    }

    /// Apply the configured selection strategy over the enabled providers.
    pub async fn get_best_available_provider(&self) -> Option<Arc<dyn Provider>> {
        let strategy = self.selection_strategy();
        match strategy {
            SelectionStrategy::FirstAvailable => self.first_available(),
            SelectionStrategy::LowestLatency => {
                let candidates = self.get_enabled_providers();
                let checks = candidates.iter().map(|p| p.check_health());
                let healths = futures_util::future::join_all(checks).await;
                candidates
                    .iter()
                    .zip(healths)
                    .filter(|(_, h)| h.healthy)
                    .min_by_key(|(_, h)| h.latency_ms)
                    .map(|(p, _)| p.clone())
            }
            SelectionStrategy::Preferred => {
                let active = self.get_active_provider();
                match active {
                    Some(p)
                        if p.is_available() && self.is_provider_enabled(p.provider_type()) =>
                    {
                        Some(p)
                    }
                    _ => self.first_available(),
                }
            }
            SelectionStrategy::RoundRobin => {
                let candidates: Vec<_> = self
                    .get_enabled_providers()
                    .into_iter()
                    .filter(|p| p.is_available())
                    .collect();
                if candidates.is_empty() {
                    return None;
                }
                let index = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed);
                Some(candidates[index % candidates.len()].clone())
            }
        }
    }

    fn first_available(&self) -> Option<Arc<dyn Provider>> {
        self.get_enabled_providers()
            .into_iter()
            .find(|p| p.is_available())
    }

    /// Provider used for non-streaming calls: the active provider when it is
    /// enabled and available, else whatever the strategy selects.
    async fn select_for_request(&self) -> Result<Arc<dyn Provider>, ProviderError> {
        if let Some(active) = self.get_active_provider() {
            if active.is_available() && self.is_provider_enabled(active.provider_type()) {
                return Ok(active);
            }
        }
        self.get_best_available_provider()
            .await
            .ok_or(ProviderError::NoProvidersAvailable)
    }

    /// Rate-limited chat completion through the selected provider.
    pub async fn chat(&self, request: &UnifiedChatRequest) -> Result<UnifiedChatResponse, ProviderError> {
        self.rate_limiter.acquire().await;
        let provider = self.select_for_request().await?;
        log::debug!("routing chat request to {}", provider.name());
        provider.chat(request).await
    }

    /// Rate-limited streaming chat. Requires an active provider; the permit
    /// is acquired before the stream opens, backpressure within the stream is
    /// the provider's concern.
    pub async fn stream_chat(&self, request: &UnifiedChatRequest) -> Result<ChatStream, ProviderError> {
        self.rate_limiter.acquire().await;
        let provider = self
            .get_active_provider()
            .filter(|p| self.is_provider_enabled(p.provider_type()))
            .ok_or(ProviderError::NoActiveProvider)?;
        log::debug!("routing stream request to {}", provider.name());
        provider.stream_chat(request).await
    }

    /// Rate-limited embedding through the selected provider.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.rate_limiter.acquire().await;
        let provider = self.select_for_request().await?;
        provider.embed(text).await
    }

    /// Flatten model listings across every registered provider. Per-provider
    /// listing failures are logged and skipped.
    pub async fn list_all_models(&self) -> Vec<UnifiedModel> {
        let mut models = Vec::new();
        for provider in self.get_all_providers() {
            match provider.list_models().await {
                Ok(mut listed) => models.append(&mut listed),
                Err(e) => log::warn!("listing models from {} failed: {}", provider.name(), e),
            }
        }
        models
    }

    /// Like [`list_all_models`](ProviderManager::list_all_models) but only
    /// over providers whose latest health check was healthy.
    pub async fn list_available_models(&self) -> Vec<UnifiedModel> {
        let mut models = Vec::new();
        for provider in self.get_available_providers() {
            match provider.list_models().await {
                Ok(mut listed) => models.append(&mut listed),
                Err(e) => log::warn!("listing models from {} failed: {}", provider.name(), e),
            }
        }
        models
    }

    /// Health-check every registered provider concurrently.
    pub async fn check_all_health(&self) -> HashMap<ProviderType, ProviderHealth> {
        let providers = self.get_all_providers();
        let checks = providers.iter().map(|p| p.check_health());
        let healths = futures_util::future::join_all(checks).await;
        providers
            .iter()
            .map(|p| p.provider_type())
            .zip(healths)
            .collect()
    }

    pub fn update_rate_limit_config(&self, config: RateLimitConfig) -> Result<(), RateLimitError> {
        self.rate_limiter.update_config(config)
    }

    pub fn rate_limit_stats(&self) -> RateLimitStats {
        self.rate_limiter.stats()
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        self.rate_limiter.config()
    }

    pub fn reset_rate_limiter(&self) {
        self.rate_limiter.reset();
    }

    fn persist(&self) {
        let Some(store) = &self.store else { return };
        let state = PersistedState {
            active_provider: self.active.read().unwrap().map(|t| t.as_str().to_string()),
            selection_strategy: self.selection_strategy().as_str().to_string(),
            provider_configs: self
                .enabled
                .read()
                .unwrap()
                .iter()
                .map(|(t, enabled)| (t.as_str().to_string(), *enabled))
                .collect(),
        };
        match serde_json::to_value(&state) {
            Ok(document) => {
                if let Err(e) = store.save(STATE_DOCUMENT, &document) {
                    log::warn!("persisting provider state failed: {}", e);
                }
            }
            Err(e) => log::warn!("serializing provider state failed: {}", e),
        }
    }

    fn load_state(&self) {
        let Some(store) = &self.store else { return };
        let document = match store.load(STATE_DOCUMENT) {
            Ok(Some(document)) => document,
            Ok(None) => return,
            Err(e) => {
                log::warn!("loading provider state failed: {}", e);
                return;
            }
        };
        let state: PersistedState = match serde_json::from_value(document) {
            Ok(state) => state,
            Err(e) => {
                log::warn!("parsing provider state failed: {}", e);
                return;
            }
        };
        if let Some(strategy) = SelectionStrategy::from_name(&state.selection_strategy) {
            *self.strategy.write().unwrap() = strategy;
        }
        {
            let mut enabled = self.enabled.write().unwrap();
            for (name, flag) in &state.provider_configs {
                if let Some(provider_type) = ProviderType::from_name(name) {
                    enabled.insert(provider_type, *flag);
                }
            }
        }
        if let Some(active) = state
            .active_provider
            .as_deref()
            .and_then(ProviderType::from_name)
        {
            // Only restore a pointer to a provider that is actually registered.
            if self.get_provider(active).is_some() {
                *self.active.write().unwrap() = Some(active);
            }
        }
    }
}
