//! Client-side cache of a user's model configuration for the active provider.
//!
//! State only changes through [`AiModelAction`]s applied by [`reduce`]. The
//! async operations on [`AiModelStore`] write through the repository and then
//! reload the list for the active provider.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::models::{AiModel, AiModelConfigUpdate, NewAiModel};
use crate::repository::AiInfraRepository;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiModelState {
    pub active_provider: Option<String>,
    pub model_list: Vec<AiModel>,
    /// Models with a write in flight, in the order they started.
    pub model_loading_ids: Vec<String>,
    pub list_initialized: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AiModelAction {
    SetActiveProvider { provider: Option<String> },
    SetModelList { models: Vec<AiModel> },
    ToggleLoading { id: String, loading: bool },
}

impl AiModelState {
    pub fn apply(&self, action: AiModelAction) -> Self {
        match action {
            AiModelAction::SetActiveProvider { provider } => {
                if provider == self.active_provider {
                    return self.clone();
                }
                // the cached list belongs to the previous provider
                Self {
                    active_provider: provider,
                    model_list: Vec::new(),
                    model_loading_ids: self.model_loading_ids.clone(),
                    list_initialized: false,
                }
            }
            AiModelAction::SetModelList { models } => {
                if self.list_initialized && models == self.model_list {
                    return self.clone();
                }
                Self {
                    model_list: models,
                    list_initialized: true,
                    ..self.clone()
                }
            }
            AiModelAction::ToggleLoading { id, loading } => {
                let mut ids = self.model_loading_ids.clone();
                if loading {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                } else {
                    ids.retain(|existing| existing != &id);
                }
                Self {
                    model_loading_ids: ids,
                    ..self.clone()
                }
            }
        }
    }

    pub fn is_loading(&self, id: &str) -> bool {
        self.model_loading_ids.iter().any(|existing| existing == id)
    }
}

pub fn reduce(state: &AiModelState, action: AiModelAction) -> AiModelState {
    state.apply(action)
}

pub struct AiModelStore {
    repo: AiInfraRepository,
    state: RwLock<AiModelState>,
}

impl AiModelStore {
    pub fn new(repo: AiInfraRepository) -> Self {
        Self::with_state(repo, AiModelState::default())
    }

    pub fn with_state(repo: AiInfraRepository, state: AiModelState) -> Self {
        Self {
            repo,
            state: RwLock::new(state),
        }
    }

    pub async fn snapshot(&self) -> AiModelState {
        self.state.read().await.clone()
    }

    /// Apply an action. Returns whether the state changed.
    pub async fn dispatch(&self, action: AiModelAction) -> bool {
        let mut state = self.state.write().await;
        let next = state.apply(action);
        if next == *state {
            return false;
        }
        *state = next;
        true
    }

    async fn active_provider(&self) -> Option<String> {
        self.state.read().await.active_provider.clone()
    }

    pub async fn set_active_provider(&self, provider: Option<&str>) -> bool {
        self.dispatch(AiModelAction::SetActiveProvider {
            provider: provider.map(str::to_string),
        })
        .await
    }

    /// Load the model list for `provider_id` into the store.
    /// Returns whether the cached list changed.
    pub async fn fetch_model_list(&self, provider_id: &str) -> Result<bool> {
        let models = self.repo.list_models(provider_id).await?;
        Ok(self.dispatch(AiModelAction::SetModelList { models }).await)
    }

    /// Reload the list for the active provider. A result that arrives after the
    /// active provider changed is dropped.
    pub async fn refresh_model_list(&self) -> Result<()> {
        let Some(provider) = self.active_provider().await else {
            return Ok(());
        };
        let models = self.repo.list_models(&provider).await?;

        let mut state = self.state.write().await;
        if state.active_provider.as_deref() != Some(provider.as_str()) {
            debug!(provider = %provider, "discarding model list for inactive provider");
            return Ok(());
        }
        let next = state.apply(AiModelAction::SetModelList { models });
        *state = next;
        Ok(())
    }

    /// Enable or disable one model of the active provider. The model stays in
    /// `model_loading_ids` if the write fails.
    pub async fn toggle_model_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let Some(provider) = self.active_provider().await else {
            return Ok(());
        };

        self.dispatch(AiModelAction::ToggleLoading {
            id: id.to_string(),
            loading: true,
        })
        .await;

        self.repo
            .toggle_model_enabled(id, &provider, enabled)
            .await?;
        self.refresh_model_list().await?;

        self.dispatch(AiModelAction::ToggleLoading {
            id: id.to_string(),
            loading: false,
        })
        .await;
        Ok(())
    }

    pub async fn batch_toggle(&self, ids: &[String], enabled: bool) -> Result<()> {
        let Some(provider) = self.active_provider().await else {
            return Ok(());
        };
        self.repo.batch_toggle_models(&provider, ids, enabled).await?;
        self.refresh_model_list().await
    }

    pub async fn batch_update(&self, models: &[NewAiModel]) -> Result<()> {
        let Some(provider) = self.active_provider().await else {
            return Ok(());
        };
        self.repo.batch_update_models(&provider, models).await?;
        self.refresh_model_list().await
    }

    pub async fn create_model(&self, model: NewAiModel) -> Result<()> {
        let Some(provider) = self.active_provider().await else {
            return Ok(());
        };
        self.repo.create_model(&provider, model).await?;
        self.refresh_model_list().await
    }

    pub async fn remove_model(&self, id: &str, provider_id: &str) -> Result<()> {
        self.repo.delete_model(id, provider_id).await?;
        self.refresh_model_list().await
    }

    pub async fn clear_models(&self, provider_id: &str) -> Result<()> {
        self.repo.clear_models_by_provider(provider_id).await?;
        self.refresh_model_list().await
    }

    pub async fn clear_remote_models(&self, provider_id: &str) -> Result<()> {
        self.repo.clear_remote_models(provider_id).await?;
        self.refresh_model_list().await
    }

    pub async fn update_config(
        &self,
        id: &str,
        provider_id: &str,
        patch: AiModelConfigUpdate,
    ) -> Result<()> {
        self.repo.update_model_config(id, provider_id, patch).await?;
        self.refresh_model_list().await
    }

    pub async fn update_sort(&self, provider_id: &str, order: &[(String, i64)]) -> Result<()> {
        self.repo.update_models_sort(provider_id, order).await?;
        self.refresh_model_list().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelSource;
    use crate::repository::test_helpers;
    use serde_json::json;

    fn model(id: &str, enabled: bool) -> AiModel {
        AiModel {
            id: id.to_string(),
            provider_id: "openai".to_string(),
            display_name: None,
            model_type: "chat".to_string(),
            enabled,
            sort: None,
            source: ModelSource::Builtin,
            abilities: json!({}),
            config: None,
            context_window_tokens: None,
        }
    }

    async fn store_with_models(ids: &[&str]) -> (AiModelStore, crate::repository::UserScope) {
        let scope = test_helpers::test_scope().await;
        let repo = scope.ai_infra();
        for id in ids {
            repo.create_model("openai", NewAiModel::new(*id)).await.unwrap();
        }
        let store = AiModelStore::new(repo);
        store.set_active_provider(Some("openai")).await;
        (store, scope)
    }

    // ── reducer ──

    #[test]
    fn toggle_loading_adds_and_removes() {
        let state = AiModelState::default();
        let state = reduce(
            &state,
            AiModelAction::ToggleLoading { id: "m1".into(), loading: true },
        );
        let state = reduce(
            &state,
            AiModelAction::ToggleLoading { id: "m2".into(), loading: true },
        );
        assert_eq!(state.model_loading_ids, vec!["m1", "m2"]);

        let again = reduce(
            &state,
            AiModelAction::ToggleLoading { id: "m1".into(), loading: true },
        );
        assert_eq!(again, state);

        let state = reduce(
            &state,
            AiModelAction::ToggleLoading { id: "m1".into(), loading: false },
        );
        assert_eq!(state.model_loading_ids, vec!["m2"]);
        assert!(state.is_loading("m2"));
        assert!(!state.is_loading("m1"));
    }

    #[test]
    fn identical_list_on_initialized_state_is_unchanged() {
        let list = vec![model("gpt-4o", true)];
        let state = reduce(
            &AiModelState::default(),
            AiModelAction::SetModelList { models: list.clone() },
        );
        assert!(state.list_initialized);

        let same = reduce(&state, AiModelAction::SetModelList { models: list });
        assert_eq!(same, state);

        let changed = reduce(
            &state,
            AiModelAction::SetModelList { models: vec![model("gpt-4o", false)] },
        );
        assert_ne!(changed, state);
        assert!(!changed.model_list[0].enabled);
    }

    #[test]
    fn empty_list_initializes() {
        let state = reduce(
            &AiModelState::default(),
            AiModelAction::SetModelList { models: vec![] },
        );
        assert!(state.list_initialized);
        assert!(state.model_list.is_empty());
    }

    #[test]
    fn switching_provider_drops_cached_list() {
        let state = AiModelState {
            active_provider: Some("openai".into()),
            model_list: vec![model("gpt-4o", true)],
            model_loading_ids: vec![],
            list_initialized: true,
        };
        let same = reduce(
            &state,
            AiModelAction::SetActiveProvider { provider: Some("openai".into()) },
        );
        assert_eq!(same, state);

        let switched = reduce(
            &state,
            AiModelAction::SetActiveProvider { provider: Some("anthropic".into()) },
        );
        assert_eq!(switched.active_provider.as_deref(), Some("anthropic"));
        assert!(switched.model_list.is_empty());
        assert!(!switched.list_initialized);
    }

    #[test]
    fn state_and_actions_serialize() {
        let state = AiModelState::default();
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(
            value,
            json!({
                "activeProvider": null,
                "modelList": [],
                "modelLoadingIds": [],
                "listInitialized": false,
            })
        );

        let action: AiModelAction = serde_json::from_value(json!({
            "type": "toggleLoading",
            "id": "m1",
            "loading": true,
        }))
        .unwrap();
        assert_eq!(
            action,
            AiModelAction::ToggleLoading { id: "m1".into(), loading: true }
        );
    }

    // ── store ──

    #[tokio::test]
    async fn dispatch_reports_changes() {
        let scope = test_helpers::test_scope().await;
        let store = AiModelStore::new(scope.ai_infra());

        assert!(
            store
                .dispatch(AiModelAction::SetModelList { models: vec![model("a", true)] })
                .await
        );
        assert!(
            !store
                .dispatch(AiModelAction::SetModelList { models: vec![model("a", true)] })
                .await
        );
    }

    #[tokio::test]
    async fn fetch_and_refresh_load_models() {
        let (store, _scope) = store_with_models(&["gpt-4o", "gpt-4o-mini"]).await;
        assert!(store.fetch_model_list("openai").await.unwrap());
        assert!(!store.fetch_model_list("openai").await.unwrap());

        let state = store.snapshot().await;
        assert!(state.list_initialized);
        let ids: Vec<_> = state.model_list.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["gpt-4o", "gpt-4o-mini"]);
    }

    #[tokio::test]
    async fn toggle_writes_refreshes_and_clears_loading() {
        let (store, _scope) = store_with_models(&["gpt-4o"]).await;
        store.refresh_model_list().await.unwrap();
        assert!(!store.snapshot().await.model_list[0].enabled);

        store.toggle_model_enabled("gpt-4o", true).await.unwrap();

        let state = store.snapshot().await;
        assert!(state.model_list[0].enabled);
        assert!(state.model_loading_ids.is_empty());
    }

    #[tokio::test]
    async fn failed_toggle_leaves_loading_flag() {
        let (store, scope) = store_with_models(&["gpt-4o"]).await;
        sqlx::query("DROP TABLE ai_models")
            .execute(&scope.pool)
            .await
            .unwrap();

        assert!(store.toggle_model_enabled("gpt-4o", true).await.is_err());
        assert!(store.snapshot().await.is_loading("gpt-4o"));
    }

    #[tokio::test]
    async fn actions_without_active_provider_do_nothing() {
        let scope = test_helpers::test_scope().await;
        let repo = scope.ai_infra();
        repo.create_model("openai", NewAiModel::new("gpt-4o")).await.unwrap();
        let store = AiModelStore::new(repo.clone());

        store.toggle_model_enabled("gpt-4o", true).await.unwrap();
        store
            .batch_toggle(&["gpt-4o".to_string()], true)
            .await
            .unwrap();
        store
            .create_model(NewAiModel::new("gpt-5"))
            .await
            .unwrap();
        store.refresh_model_list().await.unwrap();

        let state = store.snapshot().await;
        assert!(state.model_loading_ids.is_empty());
        assert!(!state.list_initialized);

        let models = repo.list_models("openai").await.unwrap();
        assert_eq!(models.len(), 1);
        assert!(!models[0].enabled);
    }

    #[tokio::test]
    async fn batch_operations_refresh_list() {
        let (store, _scope) = store_with_models(&["a", "b"]).await;

        store
            .batch_toggle(&["a".to_string(), "b".to_string()], true)
            .await
            .unwrap();
        assert!(store.snapshot().await.model_list.iter().all(|m| m.enabled));

        let mut remote = NewAiModel::new("r");
        remote.source = ModelSource::Remote;
        store.batch_update(&[remote]).await.unwrap();
        assert_eq!(store.snapshot().await.model_list.len(), 3);

        store.clear_remote_models("openai").await.unwrap();
        assert_eq!(store.snapshot().await.model_list.len(), 2);

        store
            .update_sort("openai", &[("b".to_string(), 0), ("a".to_string(), 1)])
            .await
            .unwrap();
        let ids: Vec<_> = store
            .snapshot()
            .await
            .model_list
            .iter()
            .map(|m| m.id.clone())
            .collect();
        assert_eq!(ids, vec!["b", "a"]);

        store.remove_model("a", "openai").await.unwrap();
        assert_eq!(store.snapshot().await.model_list.len(), 1);

        store.clear_models("openai").await.unwrap();
        let state = store.snapshot().await;
        assert!(state.model_list.is_empty());
        assert!(state.list_initialized);
    }

    #[tokio::test]
    async fn update_config_is_visible_after_refresh() {
        let (store, _scope) = store_with_models(&["gpt-4o"]).await;
        store
            .update_config(
                "gpt-4o",
                "openai",
                AiModelConfigUpdate {
                    display_name: Some("GPT-4o".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let state = store.snapshot().await;
        assert_eq!(state.model_list[0].display_name.as_deref(), Some("GPT-4o"));
    }
}
