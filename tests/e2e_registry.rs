//! End-to-end tests for the provider registry, credentials and model scoring.
//!
//! Tests that read credentials from the process environment run serially.

use std::sync::Arc;

use codeforge_llm::{
    AdapterFactory, AdapterKind, AuthRequirement, CodeforgeConfig, EnvCredentialSource, GenError,
    MockAdapter, ModelDescriptor, Orchestrator, ProviderDescriptor, ProviderRegistry,
    ScoringEngine, ScoringWeights, StaticCredentialSource,
};
use serial_test::serial;

fn builtin_registry(credentials: StaticCredentialSource) -> ProviderRegistry {
    let config = CodeforgeConfig::builtin_defaults();
    let registry =
        ProviderRegistry::from_config(&config, Arc::new(credentials), AdapterFactory::new());
    registry.initialize();
    registry
}

fn provider_ids(registry: &ProviderRegistry) -> Vec<String> {
    registry
        .list_providers()
        .into_iter()
        .map(|p| p.descriptor.id)
        .collect()
}

fn custom_descriptor(name: &str) -> ProviderDescriptor {
    ProviderDescriptor {
        id: "ignored".to_string(),
        name: name.to_string(),
        kind: AdapterKind::OpenAICompatible,
        auth: AuthRequirement::None,
        base_url: Some("http://127.0.0.1:9999/v1".to_string()),
        models: vec![ModelDescriptor {
            id: "local-coder".to_string(),
            name: "Local Coder".to_string(),
            context_window: 16_000,
            best_for: vec!["code generation".to_string()],
            ..Default::default()
        }],
        ..Default::default()
    }
}

#[test]
fn test_startup_scan_uses_credentials() {
    let registry = builtin_registry(
        StaticCredentialSource::new()
            .with("anthropic", "sk-ant-real-looking-key")
            .with("openai", "your-api-key-here"),
    );

    let available: Vec<String> = registry
        .list_providers()
        .into_iter()
        .filter(|p| p.available)
        .map(|p| p.descriptor.id)
        .collect();

    // Placeholder keys count as absent; local servers need none.
    assert_eq!(available, vec!["anthropic", "ollama"]);
}

#[test]
#[serial]
fn test_env_credentials_scan() {
    std::env::set_var("GROQ_API_KEY", "gsk_live_0123456789");
    std::env::set_var("OPENAI_API_KEY", "<your key>");

    let config = CodeforgeConfig::builtin_defaults();
    let registry =
        ProviderRegistry::from_config(&config, Arc::new(EnvCredentialSource), AdapterFactory::new());
    let report = registry.initialize();

    assert!(report.registered.contains(&"groq".to_string()));
    assert!(report.skipped.iter().any(|s| s.provider_id == "openai"));

    std::env::remove_var("GROQ_API_KEY");
    std::env::remove_var("OPENAI_API_KEY");
}

#[test]
fn test_register_then_deregister_restores_providers() {
    let registry = builtin_registry(StaticCredentialSource::new());
    let before = provider_ids(&registry);

    let id = registry
        .register_provider(custom_descriptor("My Local LLM"))
        .unwrap();
    assert!(id.starts_with("custom-my-local-llm-"));
    assert_eq!(id.len(), "custom-my-local-llm-".len() + 8);
    assert!(provider_ids(&registry).contains(&id));
    assert_eq!(registry.list_models(&id).unwrap()[0].id, "local-coder");

    registry.set_provider(&id, "local-coder").unwrap();
    assert!(registry.deregister_provider(&id));
    assert_eq!(provider_ids(&registry), before);
    assert!(registry.active().is_none());
    assert!(!registry.deregister_provider(&id));
}

#[test]
fn test_register_twice_yields_distinct_ids() {
    let registry = builtin_registry(StaticCredentialSource::new());
    let a = registry.register_provider(custom_descriptor("dup")).unwrap();
    let b = registry.register_provider(custom_descriptor("dup")).unwrap();
    assert_ne!(a, b);
}

#[test]
fn test_catalog_providers_cannot_be_deregistered() {
    let registry = builtin_registry(StaticCredentialSource::new());
    assert!(!registry.deregister_provider("openai"));
    assert!(!registry.deregister_provider("does-not-exist"));
    assert!(provider_ids(&registry).contains(&"openai".to_string()));
}

#[test]
fn test_set_provider_unknown_pair_keeps_active() {
    let registry = builtin_registry(StaticCredentialSource::new());
    let before = registry.active();
    assert!(before.is_some());

    let err = registry.set_provider("ollama", "no-such-model").unwrap_err();
    assert!(matches!(err, GenError::ModelNotFound { .. }));
    assert_eq!(registry.active(), before);

    let err = registry.set_provider("no-such-provider", "x").unwrap_err();
    assert!(matches!(err, GenError::ProviderNotFound(_)));
    assert_eq!(registry.active(), before);

    let err = registry.set_provider("openai", "gpt-4o").unwrap_err();
    assert!(matches!(err, GenError::CredentialMissing(_)));
    assert_eq!(registry.active(), before);
}

#[test]
fn test_revoke_credential_drops_adapter() {
    let registry =
        builtin_registry(StaticCredentialSource::new().with("openai", "sk-live-abcdef123456"));
    registry.set_provider("openai", "gpt-4o").unwrap();
    assert!(registry.active_adapter().is_ok());

    registry.revoke_credential("openai").unwrap();
    assert!(registry.active().is_none());
    assert!(matches!(
        registry.adapter("openai", "gpt-4o"),
        Err(GenError::CredentialMissing(_))
    ));
    assert!(provider_ids(&registry).contains(&"openai".to_string()));
}

#[tokio::test]
async fn test_connection_checks_never_error() {
    let healthy = MockAdapter::new("healthy", "m");
    let failing = MockAdapter::new("failing", "m").with_failure(Some(500));
    let mock = |id: &str, auth| ProviderDescriptor {
        id: id.to_string(),
        name: id.to_string(),
        kind: AdapterKind::Mock,
        auth,
        models: vec![ModelDescriptor {
            id: "m".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    };
    let registry = ProviderRegistry::new(
        vec![
            mock("healthy", AuthRequirement::None),
            mock("failing", AuthRequirement::None),
            mock("locked", AuthRequirement::ApiKey),
        ],
        Arc::new(StaticCredentialSource::new()),
        AdapterFactory::new().with_mock(healthy.clone()).with_mock(failing),
    );
    registry.initialize();

    let results = registry.test_all_providers().await;
    assert_eq!(results.get("healthy"), Some(&true));
    assert_eq!(results.get("failing"), Some(&false));
    assert_eq!(results.get("locked"), Some(&false));
    assert!(!registry.test_connection("unknown").await);
    assert_eq!(healthy.prompts()[0], "ping");
}

#[test]
fn test_score_bounds_for_every_catalog_model() {
    let engine = ScoringEngine::default();
    let config = CodeforgeConfig::builtin_defaults();
    for provider in &config.providers {
        for model in &provider.models {
            for use_case in ["", "code", "vision large context budget function calling code"] {
                let score = engine.score(model, use_case);
                assert!(
                    (0.0..=1.0).contains(&score),
                    "{}/{} scored {} for {:?}",
                    provider.id,
                    model.id,
                    score,
                    use_case
                );
            }
        }
    }
}

#[test]
fn test_recommend_limits_and_order() {
    let engine = ScoringEngine::default();
    let config = CodeforgeConfig::builtin_defaults();

    for top_n in [1, 2, 5] {
        let picks =
            engine.recommend(&config.providers, "code generation on a budget", Some(top_n));
        assert!(picks.len() <= top_n);
        assert!(picks.iter().all(|p| p.score > 0.7));
        assert!(picks.windows(2).all(|w| w[0].score >= w[1].score));
    }
    assert!(!engine
        .recommend(&config.providers, "code generation on a budget", None)
        .is_empty());
    assert!(engine.recommend(&config.providers, "", None).is_empty());
}

#[test]
fn test_recommend_respects_configured_cutoff() {
    let config = CodeforgeConfig::builtin_defaults();
    let lenient = ScoringEngine::new(ScoringWeights {
        recommend_cutoff: 0.0,
        ..ScoringWeights::default()
    });
    let picks = lenient.recommend(&config.providers, "chat", Some(100));
    assert!(picks.iter().all(|p| p.score > 0.0));
}

#[test]
fn test_orchestrator_delegates_catalog_operations() {
    let config = CodeforgeConfig::builtin_defaults();
    let registry = ProviderRegistry::from_config(
        &config,
        Arc::new(StaticCredentialSource::new()),
        AdapterFactory::new(),
    );
    registry.initialize();
    let orchestrator = Orchestrator::from_config(&config, Arc::new(registry)).unwrap();

    let before = orchestrator.list_providers().len();
    let id = orchestrator
        .register_provider(custom_descriptor("delegated"))
        .unwrap();
    assert_eq!(orchestrator.list_providers().len(), before + 1);
    assert_eq!(orchestrator.list_models(&id).unwrap().len(), 1);
    orchestrator.set_provider(&id, "local-coder").unwrap();
    assert!(orchestrator.deregister_provider(&id));
    assert_eq!(orchestrator.list_providers().len(), before);
    assert!(matches!(
        orchestrator.list_models(&id),
        Err(GenError::ProviderNotFound(_))
    ));
    assert!(orchestrator.recommend("code", Some(3)).len() <= 3);
}
