//! Built-in retrieval tools.
//!
//! Single-source tools wrap one retriever and stream its results; the
//! composite `search_all` fans out to every source in parallel with
//! per-branch deadlines and aggregates partial successes. `health_check`
//! is public and reports back-end status.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::warn;

use crate::authz::bindings::{ToolAccess, ToolBinding};
use crate::authz::grants::ResourceType;
use crate::pipeline::context::RequestContext;
use crate::{Error, Result};

use super::retriever::{
    HealthStatus, RetrievalQuery, Retriever, RetrieverFactory, RetrieverKind, collect_stream,
};
use super::{ArgField, ArgKind, ArgumentSchema, CachePolicy, ToolDescriptor, ToolHandler, ToolOutput};

/// Default result limit when a call does not specify one.
const DEFAULT_LIMIT: usize = 10;
/// Hard ceiling on requested result counts.
const MAX_LIMIT: usize = 100;

fn parse_query(arguments: &Value, resource_arg: Option<&str>) -> (String, usize, Option<String>) {
    let query = arguments
        .get("query")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let limit = arguments
        .get("limit")
        .and_then(Value::as_u64)
        .map_or(DEFAULT_LIMIT, |l| (l as usize).min(MAX_LIMIT));
    let resource = resource_arg
        .and_then(|arg| arguments.get(arg))
        .and_then(Value::as_str)
        .map(str::to_string);
    (query, limit, resource)
}

fn search_schema(resource_field: Option<&'static str>) -> ArgumentSchema {
    let mut fields = vec![
        ArgField {
            name: "query",
            kind: ArgKind::String,
            required: true,
        },
        ArgField {
            name: "limit",
            kind: ArgKind::Integer,
            required: false,
        },
    ];
    if let Some(name) = resource_field {
        fields.push(ArgField {
            name,
            kind: ArgKind::String,
            required: false,
        });
    }
    ArgumentSchema { fields }
}

// ── Single-source tools ───────────────────────────────────────────────────

/// `search_web` — web search, results identical for every principal.
pub struct SearchWebTool {
    descriptor: ToolDescriptor,
    retriever: Arc<dyn Retriever>,
}

impl SearchWebTool {
    /// Wrap a web retriever.
    #[must_use]
    pub fn new(retriever: Arc<dyn Retriever>) -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: "search_web",
                description: "Search the web",
                access: ToolAccess::Authenticated(ToolBinding::read(ResourceType::WebSearch)),
                resource_arg: None,
                schema: search_schema(None),
                cache: Some(CachePolicy {
                    principal_scoped: false,
                }),
            },
            retriever,
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for SearchWebTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn call(&self, _ctx: &RequestContext, arguments: Value) -> Result<ToolOutput> {
        let (query, limit, _) = parse_query(&arguments, None);
        let stream = self
            .retriever
            .retrieve(RetrievalQuery {
                query,
                limit,
                resource: None,
                options: arguments,
            })
            .await?;
        Ok(ToolOutput::Stream(stream))
    }
}

/// `search_vectors` — vector store search over a named collection.
pub struct SearchVectorsTool {
    descriptor: ToolDescriptor,
    retriever: Arc<dyn Retriever>,
}

impl SearchVectorsTool {
    /// Wrap a vector retriever.
    #[must_use]
    pub fn new(retriever: Arc<dyn Retriever>) -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: "search_vectors",
                description: "Semantic search over vector collections",
                access: ToolAccess::Authenticated(ToolBinding::read(ResourceType::VectorDb)),
                resource_arg: Some("collection"),
                schema: search_schema(Some("collection")),
                cache: Some(CachePolicy {
                    principal_scoped: false,
                }),
            },
            retriever,
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for SearchVectorsTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn call(&self, _ctx: &RequestContext, arguments: Value) -> Result<ToolOutput> {
        let (query, limit, resource) = parse_query(&arguments, Some("collection"));
        let stream = self
            .retriever
            .retrieve(RetrievalQuery {
                query,
                limit,
                resource,
                options: arguments,
            })
            .await?;
        Ok(ToolOutput::Stream(stream))
    }
}

/// `search_database` — relational search honoring row-level filters.
///
/// Results vary per principal, so the cache fingerprint is
/// principal-scoped.
pub struct SearchDatabaseTool {
    descriptor: ToolDescriptor,
    retriever: Arc<dyn Retriever>,
}

impl SearchDatabaseTool {
    /// Wrap a relational retriever.
    #[must_use]
    pub fn new(retriever: Arc<dyn Retriever>) -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: "search_database",
                description: "Search relational tables",
                access: ToolAccess::Authenticated(ToolBinding::read(ResourceType::Database)),
                resource_arg: Some("table"),
                schema: search_schema(Some("table")),
                cache: Some(CachePolicy {
                    principal_scoped: true,
                }),
            },
            retriever,
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for SearchDatabaseTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn call(&self, _ctx: &RequestContext, arguments: Value) -> Result<ToolOutput> {
        let (query, limit, resource) = parse_query(&arguments, Some("table"));
        let stream = self
            .retriever
            .retrieve(RetrievalQuery {
                query,
                limit,
                resource,
                options: arguments,
            })
            .await?;
        Ok(ToolOutput::Stream(stream))
    }
}

// ── Composite search ──────────────────────────────────────────────────────

/// `search_all` — fan out to every source in parallel.
///
/// Each branch runs under its own deadline. A failed branch contributes a
/// per-branch error to the aggregate; the composite only fails when every
/// branch does.
pub struct SearchAllTool {
    descriptor: ToolDescriptor,
    factory: Arc<RetrieverFactory>,
    branch_timeout: Duration,
}

impl SearchAllTool {
    /// Compose over a retriever factory.
    #[must_use]
    pub fn new(factory: Arc<RetrieverFactory>, branch_timeout: Duration) -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: "search_all",
                description: "Search web, vector, and relational sources in parallel",
                access: ToolAccess::Authenticated(ToolBinding::read(ResourceType::WebSearch)),
                resource_arg: None,
                schema: search_schema(None),
                // Aggregates carry per-branch failures; never cached.
                cache: None,
            },
            factory,
            branch_timeout,
        }
    }

    async fn run_branch(&self, kind: RetrieverKind, query: RetrievalQuery) -> Result<Value> {
        let retriever = self.factory.get(kind)?;
        let branch = async move {
            let stream = retriever.retrieve(query).await?;
            collect_stream(stream).await
        };
        match tokio::time::timeout(self.branch_timeout, branch).await {
            Ok(Ok(items)) => Ok(json!({"count": items.len(), "results": items})),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Retriever(format!("{kind} branch deadline exceeded"))),
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for SearchAllTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn call(&self, _ctx: &RequestContext, arguments: Value) -> Result<ToolOutput> {
        let (query, limit, _) = parse_query(&arguments, None);
        let make_query = || RetrievalQuery {
            query: query.clone(),
            limit,
            resource: None,
            options: arguments.clone(),
        };

        let (web, vector, database) = tokio::join!(
            self.run_branch(RetrieverKind::Web, make_query()),
            self.run_branch(RetrieverKind::Vector, make_query()),
            self.run_branch(RetrieverKind::Database, make_query()),
        );

        let branches = [("web", web), ("vector", vector), ("database", database)];
        let failures = branches.iter().filter(|(_, r)| r.is_err()).count();
        if failures == branches.len() {
            return Err(Error::Retriever("all branches failed".to_string()));
        }

        let mut aggregate = Map::new();
        for (name, outcome) in branches {
            let entry = match outcome {
                Ok(value) => value,
                Err(e) => {
                    warn!(branch = name, kind = e.kind(), "Composite branch failed");
                    json!({"error": {"kind": e.kind(), "message": e.public_message()}})
                }
            };
            aggregate.insert(name.to_string(), entry);
        }
        Ok(ToolOutput::Value(Value::Object(aggregate)))
    }
}

// ── Health ────────────────────────────────────────────────────────────────

/// `health_check` — public liveness tool reporting back-end status.
pub struct HealthCheckTool {
    descriptor: ToolDescriptor,
    factory: Arc<RetrieverFactory>,
}

impl HealthCheckTool {
    /// Report over a retriever factory.
    #[must_use]
    pub fn new(factory: Arc<RetrieverFactory>) -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: "health_check",
                description: "Liveness and back-end health",
                access: ToolAccess::Public,
                resource_arg: None,
                schema: ArgumentSchema::default(),
                cache: None,
            },
            factory,
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for HealthCheckTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn call(&self, _ctx: &RequestContext, _arguments: Value) -> Result<ToolOutput> {
        let mut backends = Map::new();
        for kind in self.factory.kinds() {
            let status = match self.factory.get(kind) {
                Ok(retriever) => retriever.health().await,
                Err(_) => HealthStatus::Unhealthy("not registered".to_string()),
            };
            backends.insert(kind.to_string(), Value::from(status.as_str()));
        }
        Ok(ToolOutput::Value(json!({
            "status": "ok",
            "backends": backends,
        })))
    }
}

/// Assemble the default tool set over a retriever factory.
#[must_use]
pub fn default_tools(
    factory: Arc<RetrieverFactory>,
    branch_timeout: Duration,
) -> Vec<Arc<dyn ToolHandler>> {
    let mut handlers: Vec<Arc<dyn ToolHandler>> = Vec::new();
    if let Ok(web) = factory.get(RetrieverKind::Web) {
        handlers.push(Arc::new(SearchWebTool::new(web)));
    }
    if let Ok(vector) = factory.get(RetrieverKind::Vector) {
        handlers.push(Arc::new(SearchVectorsTool::new(vector)));
    }
    if let Ok(database) = factory.get(RetrieverKind::Database) {
        handlers.push(Arc::new(SearchDatabaseTool::new(database)));
    }
    handlers.push(Arc::new(SearchAllTool::new(
        Arc::clone(&factory),
        branch_timeout,
    )));
    handlers.push(Arc::new(HealthCheckTool::new(factory)));
    handlers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::retriever::StaticRetriever;
    use crate::pipeline::context::RequestContext;

    fn ctx() -> RequestContext {
        RequestContext::new("tools/call", None)
    }

    fn factory_with(kinds: &[RetrieverKind]) -> Arc<RetrieverFactory> {
        let mut factory = RetrieverFactory::new();
        for kind in kinds {
            factory.register(
                *kind,
                Arc::new(StaticRetriever::new(
                    *kind,
                    vec![json!({"source": kind.to_string()})],
                )),
            );
        }
        Arc::new(factory)
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
        async fn retrieve(&self, _: RetrievalQuery) -> Result<super::super::retriever::ResultStream> {
            Err(Error::Retriever("backend down".to_string()))
        }
        async fn health(&self) -> HealthStatus {
            HealthStatus::Unhealthy("down".to_string())
        }
    }

    #[tokio::test]
    async fn search_web_streams_and_honors_limit() {
        let retriever = Arc::new(StaticRetriever::new(
            RetrieverKind::Web,
            vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})],
        ));
        let tool = SearchWebTool::new(retriever);

        let output = tool
            .call(&ctx(), json!({"query": "q", "limit": 2}))
            .await
            .unwrap();
        let value = output.aggregate().await.unwrap();
        assert_eq!(value["count"], 2);
    }

    #[tokio::test]
    async fn composite_aggregates_partial_success() {
        let mut factory = RetrieverFactory::new();
        factory.register(RetrieverKind::Web, Arc::new(FailingRetriever));
        factory.register(
            RetrieverKind::Vector,
            Arc::new(StaticRetriever::new(RetrieverKind::Vector, vec![json!({"v": 1})])),
        );
        factory.register(
            RetrieverKind::Database,
            Arc::new(StaticRetriever::new(RetrieverKind::Database, vec![json!({"d": 1})])),
        );
        let tool = SearchAllTool::new(Arc::new(factory), Duration::from_secs(5));

        let output = tool.call(&ctx(), json!({"query": "q"})).await.unwrap();
        let value = output.aggregate().await.unwrap();

        assert_eq!(value["web"]["error"]["kind"], "RetrieverError");
        assert_eq!(value["vector"]["count"], 1);
        assert_eq!(value["database"]["count"], 1);
    }

    #[tokio::test]
    async fn composite_fails_when_every_branch_fails() {
        let mut factory = RetrieverFactory::new();
        for kind in [RetrieverKind::Web, RetrieverKind::Vector, RetrieverKind::Database] {
            factory.register(kind, Arc::new(FailingRetriever));
        }
        let tool = SearchAllTool::new(Arc::new(factory), Duration::from_secs(5));

        let err = tool.call(&ctx(), json!({"query": "q"})).await.err().unwrap();
        assert_eq!(err.kind(), "RetrieverError");
    }

    #[tokio::test]
    async fn composite_branch_deadline_is_a_branch_failure() {
        struct SlowRetriever;

        #[async_trait::async_trait]
        impl Retriever for SlowRetriever {
            async fn connect(&self) -> Result<()> {
                Ok(())
            }
            async fn disconnect(&self) -> Result<()> {
                Ok(())
            }
            async fn retrieve(
                &self,
                _: RetrievalQuery,
            ) -> Result<super::super::retriever::ResultStream> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Err(Error::Retriever("unreachable".to_string()))
            }
            async fn health(&self) -> HealthStatus {
                HealthStatus::Healthy
            }
        }

        let mut factory = RetrieverFactory::new();
        factory.register(RetrieverKind::Web, Arc::new(SlowRetriever));
        factory.register(
            RetrieverKind::Vector,
            Arc::new(StaticRetriever::new(RetrieverKind::Vector, vec![json!({"v": 1})])),
        );
        factory.register(
            RetrieverKind::Database,
            Arc::new(StaticRetriever::new(RetrieverKind::Database, vec![])),
        );
        let tool = SearchAllTool::new(Arc::new(factory), Duration::from_millis(50));

        let output = tool.call(&ctx(), json!({"query": "q"})).await.unwrap();
        let value = output.aggregate().await.unwrap();
        assert_eq!(value["web"]["error"]["kind"], "RetrieverError");
        assert_eq!(value["vector"]["count"], 1);
    }

    #[tokio::test]
    async fn health_check_reports_backend_status() {
        let factory = factory_with(&[RetrieverKind::Web, RetrieverKind::Vector]);
        let tool = HealthCheckTool::new(factory);

        let output = tool.call(&ctx(), Value::Null).await.unwrap();
        let value = output.aggregate().await.unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["backends"]["web"], "healthy");
        assert_eq!(value["backends"]["vector"], "healthy");
    }

    #[tokio::test]
    async fn default_tools_cover_the_surface() {
        let factory = factory_with(&[
            RetrieverKind::Web,
            RetrieverKind::Vector,
            RetrieverKind::Database,
        ]);
        let handlers = default_tools(factory, Duration::from_secs(5));
        let names: Vec<&str> = handlers.iter().map(|h| h.descriptor().name).collect();
        assert!(names.contains(&"search_web"));
        assert!(names.contains(&"search_vectors"));
        assert!(names.contains(&"search_database"));
        assert!(names.contains(&"search_all"));
        assert!(names.contains(&"health_check"));
    }
}
