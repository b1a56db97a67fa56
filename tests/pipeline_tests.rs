//! End-to-end pipeline tests
//!
//! Exercises the full middleware chain against the real stores:
//! - login → authenticated tool call
//! - RBAC denial and unknown-tool mapping
//! - rate limiting with retry_after
//! - composite partial success
//! - cache single-flight under concurrent identical calls

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::{Value, json};
use tokio::sync::broadcast;

use retrieval_gateway::auth::Principal;
use retrieval_gateway::auth::users::UserDirectory;
use retrieval_gateway::bootstrap::{build_core, build_dispatch};
use retrieval_gateway::config::Config;
use retrieval_gateway::dispatch::retriever::{
    HealthStatus, RetrievalQuery, Retriever, RetrieverFactory, RetrieverKind, ResultStream,
    StaticRetriever,
};
use retrieval_gateway::observe::MemoryObserver;
use retrieval_gateway::pipeline::context::RequestContext;
use retrieval_gateway::pipeline::{Pipeline, PipelineDeps};
use retrieval_gateway::protocol::{JsonRpcRequest, JsonRpcResponse, RequestId};
use retrieval_gateway::rescache::ResultCache;
use retrieval_gateway::{Error, Result};

/// Retriever that counts invocations before delegating to canned results.
struct CountingRetriever {
    inner: StaticRetriever,
    calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Retriever for CountingRetriever {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
    async fn retrieve(&self, query: RetrievalQuery) -> Result<ResultStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // A short pause widens the single-flight race window.
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        self.inner.retrieve(query).await
    }
    async fn health(&self) -> HealthStatus {
        HealthStatus::Healthy
    }
}

struct FailingRetriever;

#[async_trait::async_trait]
impl Retriever for FailingRetriever {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
    async fn retrieve(&self, _: RetrievalQuery) -> Result<ResultStream> {
        Err(Error::Retriever("backend down".to_string()))
    }
    async fn health(&self) -> HealthStatus {
        HealthStatus::Unhealthy("down".to_string())
    }
}

struct Harness {
    pipeline: Arc<Pipeline>,
    directory: Arc<dyn UserDirectory>,
    credentials: Arc<retrieval_gateway::auth::credentials::CredentialService>,
    observer: Arc<MemoryObserver>,
    vector_calls: Arc<AtomicUsize>,
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.security.signing_key = "k".repeat(32);
    config.security.internal_trust_token = "t".repeat(32);
    config
}

async fn harness(config: Config, fail_web: bool) -> Harness {
    let vector_calls = Arc::new(AtomicUsize::new(0));

    let mut factory = RetrieverFactory::new();
    if fail_web {
        factory.register(RetrieverKind::Web, Arc::new(FailingRetriever));
    } else {
        factory.register(
            RetrieverKind::Web,
            Arc::new(StaticRetriever::new(
                RetrieverKind::Web,
                vec![
                    json!({"title": "A"}),
                    json!({"title": "B"}),
                    json!({"title": "C"}),
                    json!({"title": "D"}),
                ],
            )),
        );
    }
    factory.register(
        RetrieverKind::Vector,
        Arc::new(CountingRetriever {
            inner: StaticRetriever::new(RetrieverKind::Vector, vec![json!({"id": "doc-1"})]),
            calls: Arc::clone(&vector_calls),
        }),
    );
    factory.register(
        RetrieverKind::Database,
        Arc::new(StaticRetriever::new(RetrieverKind::Database, vec![json!({"row": 1})])),
    );

    let (shutdown, _) = broadcast::channel(1);
    let core = build_core(&config, &shutdown).await.unwrap();
    let (dispatcher, authz) = build_dispatch(&config, Arc::new(factory));
    let observer = Arc::new(MemoryObserver::new());

    let flags = config.profile.stage_flags();
    let deps = Arc::new(PipelineDeps {
        credentials: Arc::clone(&core.credentials),
        authz,
        limiter: Arc::clone(&core.limiter),
        cache: flags.cache.then(|| Arc::new(ResultCache::new(Arc::clone(&core.kv)))),
        dispatcher,
        observer: observer.clone(),
        cache_ttls: config.cache.clone(),
        require_auth: config.security.require_auth,
        sensitive_fields: config.security.sensitive_fields.clone(),
    });

    Harness {
        pipeline: Arc::new(Pipeline::from_flags(flags, deps)),
        directory: core.directory,
        credentials: core.credentials,
        observer,
        vector_calls,
    }
}

fn call_request(tool: &str, arguments: Value) -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: "2.0".to_string(),
        id: RequestId::Number(1),
        method: "tools/call".to_string(),
        params: Some(json!({"name": tool, "arguments": arguments})),
    }
}

async fn login(h: &Harness, email: &str) -> String {
    let user = h.directory.register(email, "Pw12345!").await.unwrap();
    let pair = h.credentials.mint_pair(&user, None).await.unwrap();
    pair.access_token
}

async fn execute(h: &Harness, token: Option<&str>, request: &JsonRpcRequest) -> JsonRpcResponse {
    let ctx = RequestContext::new(&request.method, Some("10.0.0.1".to_string()))
        .with_bearer(token.map(str::to_string));
    h.pipeline.execute(ctx, request).await
}

fn error_kind(response: &JsonRpcResponse) -> String {
    response.error.as_ref().unwrap().data.as_ref().unwrap()["kind"]
        .as_str()
        .unwrap()
        .to_string()
}

// ── Scenarios ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_login_then_call_respects_limit() {
    let h = harness(test_config(), false).await;
    let token = login(&h, "alice@example.com").await;

    let request = call_request("search_web", json!({"query": "q", "limit": 3}));
    let response = execute(&h, Some(&token), &request).await;

    let result = response.result.expect("success");
    assert!(response.error.is_none());
    assert!(result["count"].as_u64().unwrap() <= 3);
}

#[tokio::test]
async fn missing_credential_is_authentication_error() {
    let h = harness(test_config(), false).await;
    let request = call_request("search_web", json!({"query": "q"}));

    let response = execute(&h, None, &request).await;
    let error = response.error.as_ref().unwrap();
    assert_eq!(error.code, -32040);
    assert_eq!(error_kind(&response), "AuthenticationError");
}

#[tokio::test]
async fn garbage_credential_is_authentication_error() {
    let h = harness(test_config(), false).await;
    let request = call_request("search_web", json!({"query": "q"}));

    let response = execute(&h, Some("not-a-token"), &request).await;
    assert_eq!(response.error.unwrap().code, -32040);
}

#[tokio::test]
async fn guest_role_denied_on_vector_search() {
    let h = harness(test_config(), false).await;
    let user = h.directory.register("guest@example.com", "Pw12345!").await.unwrap();
    h.directory
        .set_roles(&user.id, vec!["guest".to_string()])
        .await
        .unwrap();
    let pair = h.credentials.mint_pair(
        &h.directory.find_by_id(&user.id).await.unwrap().unwrap(),
        None,
    )
    .await
    .unwrap();

    let request = call_request("search_vectors", json!({"query": "q"}));
    let response = execute(&h, Some(&pair.access_token), &request).await;

    let error = response.error.as_ref().unwrap();
    assert_eq!(error.code, -32041);
    assert_eq!(error_kind(&response), "AuthorizationError");
    assert_eq!(
        error.data.as_ref().unwrap()["reason"].as_str().unwrap(),
        "role_insufficient"
    );
}

#[tokio::test]
async fn unknown_tool_maps_to_not_found() {
    let h = harness(test_config(), false).await;
    let token = login(&h, "alice@example.com").await;

    let request = call_request("search_everything", json!({"query": "q"}));
    let response = execute(&h, Some(&token), &request).await;
    assert_eq!(response.error.unwrap().code, -32601);
}

#[tokio::test]
async fn malformed_arguments_rejected_by_validation() {
    let h = harness(test_config(), false).await;
    let token = login(&h, "alice@example.com").await;

    // limit must be an integer
    let request = call_request("search_web", json!({"query": "q", "limit": "three"}));
    let response = execute(&h, Some(&token), &request).await;
    assert_eq!(response.error.unwrap().code, -32602);
}

#[tokio::test]
async fn rate_limit_yields_429_with_retry_after() {
    let mut config = test_config();
    config.rate.per_minute = 2;
    config.rate.per_hour = 1000;
    config.rate.burst = 2;
    let h = harness(config, false).await;
    let token = login(&h, "alice@example.com").await;

    let request = call_request("search_web", json!({"query": "q"}));
    let first = execute(&h, Some(&token), &request).await;
    let second = execute(&h, Some(&token), &request).await;
    let third = execute(&h, Some(&token), &request).await;

    assert!(first.error.is_none());
    assert!(second.error.is_none());
    let error = third.error.expect("third call limited");
    assert_eq!(error.code, -32045);
    let retry_after = error.data.unwrap()["retry_after"].as_u64().unwrap();
    assert!(retry_after >= 1 && retry_after <= 30);
}

#[tokio::test]
async fn composite_reports_partial_success() {
    let h = harness(test_config(), true).await;
    let token = login(&h, "alice@example.com").await;

    let request = call_request("search_all", json!({"query": "q"}));
    let response = execute(&h, Some(&token), &request).await;

    let result = response.result.expect("partial success is a success");
    assert_eq!(result["web"]["error"]["kind"], "RetrieverError");
    assert!(result["vector"]["count"].as_u64().unwrap() >= 1);
    assert!(result["database"]["count"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn identical_concurrent_calls_coalesce_to_one_retrieval() {
    let h = harness(test_config(), false).await;
    let token = login(&h, "alice@example.com").await;

    let request = call_request("search_vectors", json!({"query": "q", "collection": "docs"}));
    let mut handles = Vec::new();
    for _ in 0..10 {
        let h_pipeline = Arc::clone(&h.pipeline);
        let token = token.clone();
        let request = request.clone();
        handles.push(tokio::spawn(async move {
            let ctx = RequestContext::new("tools/call", Some("10.0.0.1".to_string()))
                .with_bearer(Some(token));
            h_pipeline.execute(ctx, &request).await
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        let response = handle.await.unwrap();
        results.push(response.result.expect("all ten succeed"));
    }

    assert_eq!(h.vector_calls.load(Ordering::SeqCst), 1, "single retriever invocation");
    assert!(results.windows(2).all(|w| w[0] == w[1]), "all responses equal");
}

#[tokio::test]
async fn tools_list_requires_auth_by_default_and_filters_by_role() {
    let h = harness(test_config(), false).await;

    let request = JsonRpcRequest {
        jsonrpc: "2.0".to_string(),
        id: RequestId::Number(1),
        method: "tools/list".to_string(),
        params: None,
    };

    // Default: unauthenticated listing is rejected
    let response = execute(&h, None, &request).await;
    assert_eq!(response.error.unwrap().code, -32040);

    // Authenticated user sees the retrieval tools
    let token = login(&h, "alice@example.com").await;
    let response = execute(&h, Some(&token), &request).await;
    let tools = response.result.unwrap()["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect::<Vec<_>>();
    assert!(tools.contains(&"search_web".to_string()));
    assert!(tools.contains(&"health_check".to_string()));
}

#[tokio::test]
async fn tools_list_without_auth_when_configured_public() {
    let mut config = test_config();
    config.security.require_auth = false;
    let h = harness(config, false).await;

    let request = JsonRpcRequest {
        jsonrpc: "2.0".to_string(),
        id: RequestId::Number(1),
        method: "tools/list".to_string(),
        params: None,
    };
    let response = execute(&h, None, &request).await;

    // Anonymous callers see only public tools
    let tools = response.result.unwrap()["tools"].as_array().unwrap().clone();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], "health_check");
}

#[tokio::test]
async fn health_check_is_public_even_with_auth_required() {
    let h = harness(test_config(), false).await;
    let request = JsonRpcRequest {
        jsonrpc: "2.0".to_string(),
        id: RequestId::Number(1),
        method: "health_check".to_string(),
        params: None,
    };

    let response = execute(&h, None, &request).await;
    assert!(response.error.is_none());
    assert_eq!(response.result.unwrap()["status"], "ok");
}

#[tokio::test]
async fn deadline_exceeded_maps_to_service_unavailable() {
    let h = harness(test_config(), false).await;
    let token = login(&h, "alice@example.com").await;

    // The composite's vector branch sleeps ~30ms; a 1ms deadline trips.
    let request = call_request("search_all", json!({"query": "q"}));
    let ctx = RequestContext::new("tools/call", Some("10.0.0.1".to_string()))
        .with_bearer(Some(token))
        .with_deadline(std::time::Duration::from_millis(1));
    let response = h.pipeline.execute(ctx, &request).await;
    assert_eq!(response.error.unwrap().code, -32000);
}

#[tokio::test]
async fn internally_trusted_principal_skips_authentication() {
    let h = harness(test_config(), false).await;
    // The Tool Server attaches the gateway-verified principal before the
    // pipeline runs; no bearer credential is present.
    let principal = Principal::User(retrieval_gateway::auth::UserPrincipal {
        id: "u-forwarded".to_string(),
        email: None,
        roles: vec!["user".to_string()],
    });

    let request = call_request("search_web", json!({"query": "q"}));
    let ctx = RequestContext::new("tools/call", Some("10.0.0.9".to_string()))
        .with_principal(principal);
    let response = h.pipeline.execute(ctx, &request).await;
    assert!(response.error.is_none());
}

#[tokio::test]
async fn errors_flow_through_the_observer() {
    let h = harness(test_config(), false).await;
    let request = call_request("search_web", json!({"query": "q"}));

    let _ = execute(&h, None, &request).await;
    let recorded = h.observer.events();
    assert!(
        recorded.iter().any(|e| matches!(
            e,
            retrieval_gateway::observe::Recorded::Error(kind, _) if kind == "AuthenticationError"
        )),
        "error handler emits through the observer"
    );
    // Observability closes the request span even on failure
    assert!(recorded.iter().any(|e| matches!(
        e,
        retrieval_gateway::observe::Recorded::Span(name, _) if name == "request"
    )));
}
