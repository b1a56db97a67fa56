//! Retriever capability — the back-ends the dispatcher fans out to.
//!
//! Retrievers are external collaborators: the core sees `connect`,
//! `disconnect`, `retrieve`, and `health`. Results are finite,
//! non-restartable streams. A factory keyed by kind composes them.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::{Error, Result};

/// Finite, non-restartable sequence of result items.
pub type ResultStream = BoxStream<'static, Result<Value>>;

/// Retriever families the gateway dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetrieverKind {
    /// Web search API client
    Web,
    /// Vector store client
    Vector,
    /// Relational store client
    Database,
}

impl std::fmt::Display for RetrieverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Web => "web",
            Self::Vector => "vector",
            Self::Database => "database",
        };
        f.write_str(s)
    }
}

/// A retrieval request.
#[derive(Debug, Clone)]
pub struct RetrievalQuery {
    /// Query text
    pub query: String,
    /// Maximum number of results
    pub limit: usize,
    /// Concrete resource (collection, table) when applicable
    pub resource: Option<String>,
    /// Back-end specific options
    pub options: Value,
}

/// Back-end health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Fully operational
    Healthy,
    /// Operational with reduced capability
    Degraded(String),
    /// Not serving requests
    Unhealthy(String),
}

impl HealthStatus {
    /// Stable status string for health endpoints.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded(_) => "degraded",
            Self::Unhealthy(_) => "unhealthy",
        }
    }
}

/// Trait implemented by retriever back-ends.
#[async_trait::async_trait]
pub trait Retriever: Send + Sync + 'static {
    /// Establish the back-end connection.
    async fn connect(&self) -> Result<()>;

    /// Tear the connection down.
    async fn disconnect(&self) -> Result<()>;

    /// Run a query, yielding a finite stream of result items.
    async fn retrieve(&self, query: RetrievalQuery) -> Result<ResultStream>;

    /// Report back-end health.
    async fn health(&self) -> HealthStatus;
}

/// Factory composing retrievers by kind.
#[derive(Default)]
pub struct RetrieverFactory {
    retrievers: HashMap<RetrieverKind, Arc<dyn Retriever>>,
}

impl RetrieverFactory {
    /// Create an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a retriever for a kind, replacing any previous one.
    pub fn register(&mut self, kind: RetrieverKind, retriever: Arc<dyn Retriever>) {
        self.retrievers.insert(kind, retriever);
    }

    /// Look up a retriever.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceUnavailable`] when no retriever of that kind
    /// is registered.
    pub fn get(&self, kind: RetrieverKind) -> Result<Arc<dyn Retriever>> {
        self.retrievers
            .get(&kind)
            .cloned()
            .ok_or(Error::ServiceUnavailable)
    }

    /// Registered kinds (health endpoint).
    #[must_use]
    pub fn kinds(&self) -> Vec<RetrieverKind> {
        let mut kinds: Vec<RetrieverKind> = self.retrievers.keys().copied().collect();
        kinds.sort_by_key(|k| k.to_string());
        kinds
    }
}

/// In-process retriever serving canned results.
///
/// The default wiring for development and tests; production deployments
/// register real back-end clients through the factory.
pub struct StaticRetriever {
    kind: RetrieverKind,
    results: Vec<Value>,
}

impl StaticRetriever {
    /// Create a retriever over a fixed result set.
    #[must_use]
    pub fn new(kind: RetrieverKind, results: Vec<Value>) -> Self {
        Self { kind, results }
    }
}

#[async_trait::async_trait]
impl Retriever for StaticRetriever {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn retrieve(&self, query: RetrievalQuery) -> Result<ResultStream> {
        let items: Vec<Value> = self.results.iter().take(query.limit).cloned().collect();
        let kind = self.kind;
        let stream = async_stream::try_stream! {
            for item in items {
                tracing::trace!(kind = %kind, "Yielding canned result");
                yield item;
            }
        };
        Ok(stream.boxed())
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus::Healthy
    }
}

/// Drain a finite stream into a vector.
pub async fn collect_stream(mut stream: ResultStream) -> Result<Vec<Value>> {
    let mut items = Vec::new();
    while let Some(item) = stream.next().await {
        items.push(item?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn static_retriever_honors_limit() {
        let retriever = StaticRetriever::new(
            RetrieverKind::Web,
            vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})],
        );
        let stream = retriever
            .retrieve(RetrievalQuery {
                query: "q".to_string(),
                limit: 2,
                resource: None,
                options: Value::Null,
            })
            .await
            .unwrap();

        let items = collect_stream(stream).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], json!({"n": 1}));
    }

    #[tokio::test]
    async fn factory_resolves_registered_kinds_only() {
        let mut factory = RetrieverFactory::new();
        factory.register(
            RetrieverKind::Web,
            Arc::new(StaticRetriever::new(RetrieverKind::Web, vec![])),
        );

        assert!(factory.get(RetrieverKind::Web).is_ok());
        let err = factory.get(RetrieverKind::Vector).err().unwrap();
        assert_eq!(err.kind(), "ServiceUnavailableError");
        assert_eq!(factory.kinds(), vec![RetrieverKind::Web]);
    }
}
