//! End-to-end tests for the generation pipeline.
//!
//! Every provider here is a `mock`-kind catalog entry served by a scripted `MockAdapter`,
//! so the full stage machine runs without network access.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use codeforge_llm::pipeline::{extract, InMemoryArtifactStore, InMemorySimilarity};
use codeforge_llm::{
    AdapterFactory, AdapterKind, AuthRequirement, CancelToken, CodeforgeConfig, GenError,
    GenerationRequest, MockAdapter, ModelDescriptor, Orchestrator, PipelineConfig,
    PipelineStage, ProviderAdapter, ProviderDescriptor, ProviderRegistry, RetryPolicy,
    StaticCredentialSource, StreamEvent,
};

fn mock_provider(id: &str) -> ProviderDescriptor {
    ProviderDescriptor {
        id: id.to_string(),
        name: id.to_string(),
        kind: AdapterKind::Mock,
        auth: AuthRequirement::None,
        models: vec![ModelDescriptor {
            id: "coder".to_string(),
            name: "Coder".to_string(),
            context_window: 32_000,
            best_for: vec!["code generation".to_string()],
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        ..RetryPolicy::default()
    }
}

fn registry_with(mocks: &[MockAdapter]) -> Arc<ProviderRegistry> {
    let mut factory = AdapterFactory::new();
    let mut catalog = Vec::new();
    for mock in mocks {
        catalog.push(mock_provider(mock.provider_id()));
        factory = factory.with_mock(mock.clone());
    }
    let registry = ProviderRegistry::new(catalog, Arc::new(StaticCredentialSource::new()), factory);
    registry.initialize();
    Arc::new(registry)
}

fn orchestrator(mocks: &[MockAdapter], config: PipelineConfig) -> Orchestrator {
    Orchestrator::builder(registry_with(mocks))
        .config(config)
        .retry_policy(fast_retry())
        .build()
        .expect("valid pipeline config")
}

#[test]
fn test_single_block_extracted_trimmed() {
    let extraction = extract("Intro\n```rust\n   fn answer() -> u32 { 42 }   \n```\nOutro");
    assert_eq!(extraction.body, "fn answer() -> u32 { 42 }");
}

#[test]
fn test_three_blocks_concatenated_in_order() {
    let response = "First:\n```html\n<div id=\"a\"></div>\n```\nThen:\n```css\n#a { color: red; }\n```\nFinally:\n```js\ndocument.getElementById('a');\n```";
    let extraction = extract(response);
    assert_eq!(
        extraction.body,
        "<div id=\"a\"></div>\n\n#a { color: red; }\n\ndocument.getElementById('a');"
    );
    assert_eq!(extraction.block_count, 3);
}

#[tokio::test]
async fn test_generate_returns_single_block_trimmed() {
    let mock =
        MockAdapter::new("solo", "coder").with_response("Intro\n```rust\n  fn a() {}  \n```\nOutro");
    let orchestrator = orchestrator(&[mock], PipelineConfig::default());

    let outcome = orchestrator
        .generate(GenerationRequest::new("empty function"))
        .await
        .unwrap();

    assert_eq!(outcome.artifact.body, "fn a() {}");
    assert!(!outcome.artifact.metadata.extraction_fallback);
    assert!(outcome.artifact.metadata.optimizations.is_empty());
}

#[tokio::test]
async fn test_fallback_reaches_third_adapter() {
    let first = MockAdapter::new("first", "coder").with_failure(Some(503));
    let second = MockAdapter::new("second", "coder").with_failure(Some(502));
    let third = MockAdapter::new("third", "coder").with_response("```ts\nexport const ok = true;\n```");
    let orchestrator = orchestrator(
        &[first.clone(), second.clone(), third.clone()],
        PipelineConfig::default(),
    );
    assert_eq!(
        orchestrator.registry().active().map(|a| a.provider_id),
        Some("first".to_string())
    );

    let outcome = orchestrator
        .generate(GenerationRequest::new("export a flag"))
        .await
        .expect("third candidate succeeds");

    assert_eq!(outcome.artifact.metadata.provider_id, "third");
    assert_eq!(outcome.artifact.metadata.model_id, "coder");
    assert_eq!(outcome.attempts, 3);
    assert_eq!(first.call_count(), 1);
    assert_eq!(second.call_count(), 1);
    assert_eq!(third.call_count(), 1);
    // Fallback never changes the session's active pair.
    assert_eq!(
        orchestrator.registry().active().map(|a| a.provider_id),
        Some("first".to_string())
    );
}

#[tokio::test]
async fn test_auth_failure_switches_provider() {
    let first = MockAdapter::new("first", "coder").with_failure(Some(401));
    let second = MockAdapter::new("second", "coder");
    let orchestrator = orchestrator(&[first, second.clone()], PipelineConfig::default());

    let outcome = orchestrator
        .generate(GenerationRequest::new("anything"))
        .await
        .unwrap();
    assert_eq!(outcome.artifact.metadata.provider_id, "second");
    assert_eq!(second.call_count(), 1);
}

const INSECURE: &str = "```js\nconst run = (input) => eval(input);\n```";
const CLEAN: &str = "```js\nconst run = (input) => JSON.parse(input);\n```";

fn strict(budget: u32) -> PipelineConfig {
    PipelineConfig {
        acceptance_threshold: 95.0,
        regeneration_budget: budget,
        ..PipelineConfig::default()
    }
}

#[tokio::test]
async fn test_regeneration_budget_one_makes_one_extra_call() {
    let mock = MockAdapter::new("solo", "coder").with_default_response(INSECURE);
    let orchestrator = orchestrator(&[mock.clone()], strict(1));

    let outcome = orchestrator
        .generate(GenerationRequest::new("evaluate input"))
        .await
        .unwrap();

    assert_eq!(mock.call_count(), 2);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.artifact.metadata.regenerations, 1);
    assert!(outcome.is_below_threshold());
    assert_eq!(outcome.artifact.quality_score, Some(90.0));

    let prompts = mock.prompts();
    assert!(!prompts[0].contains("Issues in the previous attempt"));
    assert!(prompts[1].starts_with(&prompts[0]));
    assert!(prompts[1].contains("eval()"));
}

#[tokio::test]
async fn test_regeneration_budget_zero_returns_original() {
    let mock = MockAdapter::new("solo", "coder").with_default_response(INSECURE);
    let orchestrator = orchestrator(&[mock.clone()], strict(0));

    let outcome = orchestrator
        .generate(GenerationRequest::new("evaluate input"))
        .await
        .unwrap();

    assert_eq!(mock.call_count(), 1);
    assert!(outcome.is_below_threshold());
    assert_eq!(outcome.artifact.metadata.regenerations, 0);
    assert!(outcome.artifact.body.contains("eval(input)"));
    assert!(outcome.is_persisted());
}

#[tokio::test]
async fn test_regeneration_keeps_improved_attempt() {
    let mock = MockAdapter::new("solo", "coder")
        .with_response(INSECURE)
        .with_response(CLEAN);
    let orchestrator = orchestrator(&[mock.clone()], strict(3));

    let outcome = orchestrator
        .generate(GenerationRequest::new("parse input"))
        .await
        .unwrap();

    assert_eq!(mock.call_count(), 2);
    assert!(!outcome.is_below_threshold());
    assert_eq!(outcome.artifact.quality_score, Some(100.0));
    assert!(outcome.artifact.body.contains("JSON.parse"));
}

#[tokio::test]
async fn test_failed_regeneration_keeps_best_attempt() {
    let mock = MockAdapter::new("solo", "coder")
        .with_response(INSECURE)
        .with_failure(Some(500));
    let orchestrator = orchestrator(&[mock.clone()], strict(1));

    let outcome = orchestrator
        .generate(GenerationRequest::new("evaluate input"))
        .await
        .unwrap();

    assert!(outcome.artifact.body.contains("eval(input)"));
    assert!(outcome.is_below_threshold());
}

#[tokio::test]
async fn test_cancel_stream_stops_callbacks_and_releases_adapter() {
    let mock = MockAdapter::new("streamer", "coder")
        .with_chunk_size(1)
        .with_chunk_delay(Duration::from_millis(5))
        .with_response("0123456789");
    let store = Arc::new(InMemoryArtifactStore::new());
    let orchestrator = Orchestrator::builder(registry_with(&[mock.clone()]))
        .store(store.clone())
        .build()
        .unwrap();

    let token = CancelToken::new();
    let canceller = token.clone();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    let summary = orchestrator
        .generate_stream(GenerationRequest::new("count"), &token, move |event| {
            let mut seen = sink.lock().unwrap();
            match event {
                StreamEvent::Fragment(fragment) => seen.push(fragment.text),
                StreamEvent::End(_) => seen.push("<end>".to_string()),
            }
            if seen.len() == 3 {
                canceller.cancel();
            }
        })
        .await
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.delivered, 3);
    assert_eq!(*seen.lock().unwrap(), vec!["0", "1", "2"]);
    assert!(mock.stream_closed());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_stream_delivers_fragments_then_end() {
    let mock = MockAdapter::new("streamer", "coder")
        .with_chunk_size(4)
        .with_response("```py\nprint(1)\n```");
    let orchestrator = orchestrator(&[mock.clone()], PipelineConfig::default());

    let mut fragments = String::new();
    let mut ends = Vec::new();
    let summary = orchestrator
        .generate_stream(
            GenerationRequest::new("print"),
            &CancelToken::new(),
            |event| match event {
                StreamEvent::Fragment(f) => fragments.push_str(&f.text),
                StreamEvent::End(outcome) => ends.push(outcome),
            },
        )
        .await
        .unwrap();

    assert!(!summary.cancelled);
    assert_eq!(fragments, "```py\nprint(1)\n```");
    assert_eq!(ends.len(), 1);
    assert_eq!(ends[0].artifact.body, "print(1)");
    assert!(!ends[0].artifact.metadata.emulated_stream);
    assert!(mock.stream_closed());
}

#[tokio::test]
async fn test_stream_open_falls_back() {
    let broken = MockAdapter::new("broken", "coder").with_failure(Some(503));
    let healthy = MockAdapter::new("healthy", "coder").with_response("```js\nok();\n```");
    let orchestrator = orchestrator(&[broken, healthy], PipelineConfig::default());

    let mut producer = None;
    orchestrator
        .generate_stream(GenerationRequest::new("ok"), &CancelToken::new(), |event| {
            if let StreamEvent::End(outcome) = event {
                producer = Some(outcome.artifact.metadata.provider_id.clone());
            }
        })
        .await
        .unwrap();
    assert_eq!(producer.as_deref(), Some("healthy"));
}

#[tokio::test]
async fn test_context_feeds_prompt_and_metadata() {
    let mock = MockAdapter::new("solo", "coder").with_response("```tsx\n<Button />\n```");
    let similarity = Arc::new(InMemorySimilarity::new());
    similarity.insert("btn-1", "React primary button component");
    let orchestrator = Orchestrator::builder(registry_with(&[mock.clone()]))
        .similarity(similarity)
        .build()
        .unwrap();

    let outcome = orchestrator
        .generate(
            GenerationRequest::new("primary button component")
                .framework("react")
                .context_ref("design-system"),
        )
        .await
        .unwrap();

    assert!(mock.prompts()[0].contains("React primary button component"));
    assert_eq!(
        outcome.artifact.metadata.context_refs,
        vec!["design-system", "btn-1"]
    );
    assert_eq!(outcome.artifact.tags, vec!["tsx", "react"]);
}

#[tokio::test(start_paused = true)]
async fn test_adapter_timeout_falls_back() {
    let slow = MockAdapter::new("slow", "coder").with_latency(Duration::from_secs(30));
    let fast = MockAdapter::new("fast", "coder").with_response("```js\nfast();\n```");
    let config = PipelineConfig {
        request_timeout_secs: Some(1),
        ..PipelineConfig::default()
    };
    let orchestrator = orchestrator(&[slow.clone(), fast], config);

    let outcome = orchestrator
        .generate(GenerationRequest::new("be quick"))
        .await
        .unwrap();

    assert_eq!(outcome.artifact.metadata.provider_id, "fast");
    assert_eq!(slow.call_count(), 1);
}

#[tokio::test]
async fn test_no_active_provider_fails_before_generating() {
    let registry = ProviderRegistry::new(
        vec![ProviderDescriptor {
            auth: AuthRequirement::ApiKey,
            ..mock_provider("locked")
        }],
        Arc::new(StaticCredentialSource::new()),
        AdapterFactory::new(),
    );
    let report = registry.initialize();
    assert_eq!(report.skipped.len(), 1);

    let orchestrator = Orchestrator::builder(Arc::new(registry)).build().unwrap();
    let err = orchestrator
        .generate(GenerationRequest::new("anything"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GenError::StageFailed {
            stage: PipelineStage::Idle,
            ..
        }
    ));
}

#[tokio::test]
async fn test_wired_from_toml_config() {
    let config = CodeforgeConfig::from_toml(
        r#"
[defaults]
provider = "local"
model = "coder"

[[providers]]
id = "local"
name = "Local"
kind = "mock"
auth = "none"

[[providers.models]]
id = "coder"
name = "Coder"
context_window = 8000

[pipeline]
regeneration_budget = 0
persist_attempts = 1
"#,
    )
    .unwrap();
    config.validate().unwrap();

    let mock = MockAdapter::new("local", "coder").with_response("```rust\nfn main() {}\n```");
    let registry = ProviderRegistry::from_config(
        &config,
        Arc::new(StaticCredentialSource::new()),
        AdapterFactory::new().with_mock(mock.clone()),
    );
    registry.initialize();
    let orchestrator = Orchestrator::from_config(&config, Arc::new(registry)).unwrap();

    let outcome = orchestrator
        .generate(GenerationRequest::new("entry point"))
        .await
        .unwrap();

    assert_eq!(outcome.artifact.body, "fn main() {}");
    assert_eq!(outcome.artifact.tags, vec!["rust"]);
    assert_eq!(orchestrator.config().regeneration_budget, 0);
    assert_eq!(mock.call_count(), 1);
}
