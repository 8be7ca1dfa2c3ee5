//! HTTP query server.
//!
//! The server is organized into separate concerns: `handle_request` is a
//! plain request → response function over the shared pipeline, and
//! [`Server::run`] owns the accept loop, spawning one task per connection.
//! Requests never see each other; a failed or timed-out query affects only
//! its own connection.
//!
//! Routes:
//! - `GET /healthz`: index size and publish version, no auth.
//! - `POST /query`: JSON body with exactly one of `query` or `like`, plus
//!   optional `category` and `top_k`; answers with the pipeline's JSON
//!   answer. Requires a Bearer token when an API key is configured.

use crate::pipeline::{PipelineError, QueryPipeline};
use crate::retrieve::RetrieveError;
use crate::types::{MetadataFilter, Query};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Accepts connections until the shutdown token fires.
pub struct Server {
    pipeline: Arc<QueryPipeline>,
    api_key: Option<String>,
}

impl Server {
    pub fn new(pipeline: Arc<QueryPipeline>, api_key: Option<String>) -> Self {
        Self { pipeline, api_key }
    }

    /// Serves until `shutdown` is cancelled. In-flight connections run on
    /// their own tasks and finish independently.
    pub async fn run(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "query server listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("query server shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    let pipeline = Arc::clone(&self.pipeline);
                    let api_key = self.api_key.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let pipeline = Arc::clone(&pipeline);
                            let api_key = api_key.clone();
                            async move { handle_request(req, pipeline, api_key.as_deref()).await }
                        });
                        let io = TokioIo::new(stream);
                        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                            warn!(?peer, error = %err, "connection error");
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct QueryBody {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    like: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    top_k: Option<usize>,
}

async fn handle_request<B>(
    req: Request<B>,
    pipeline: Arc<QueryPipeline>,
    api_key: Option<&str>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: hyper::body::Body,
    B::Error: fmt::Display,
{
    let response = if req.method() == Method::GET && req.uri().path() == "/healthz" {
        health_response(&pipeline)
    } else if req.method() == Method::POST && req.uri().path() == "/query" {
        query_response(req, pipeline, api_key).await
    } else {
        json_error(StatusCode::NOT_FOUND, "no such route")
    };
    Ok(response)
}

fn health_response(pipeline: &QueryPipeline) -> Response<Full<Bytes>> {
    let index = pipeline.retriever().index();
    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "status": "ok",
            "chunks": index.len(),
            "version": index.version(),
        }),
    )
}

async fn query_response<B>(
    req: Request<B>,
    pipeline: Arc<QueryPipeline>,
    api_key: Option<&str>,
) -> Response<Full<Bytes>>
where
    B: hyper::body::Body,
    B::Error: fmt::Display,
{
    if let Some(expected) = api_key {
        if !bearer_matches(req.headers(), expected) {
            return json_error(StatusCode::UNAUTHORIZED, "missing or invalid bearer token");
        }
    }

    let raw = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            return json_error(StatusCode::BAD_REQUEST, &format!("unreadable body: {err}"))
        }
    };
    let body: QueryBody = match serde_json::from_slice(&raw) {
        Ok(parsed) => parsed,
        Err(err) => {
            return json_error(StatusCode::BAD_REQUEST, &format!("malformed request: {err}"))
        }
    };
    if body.top_k == Some(0) {
        return json_error(StatusCode::BAD_REQUEST, "top_k must be greater than zero");
    }

    let text = match (body.query, body.like) {
        (Some(query), None) => query,
        (None, Some(doc_id)) => match pipeline.retriever().query_text_for_document(&doc_id) {
            Ok(text) => text,
            Err(RetrieveError::UnknownDocument(id)) => {
                return json_error(
                    StatusCode::NOT_FOUND,
                    &format!("document {id} is not indexed"),
                )
            }
            Err(err) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
        },
        _ => {
            return json_error(
                StatusCode::BAD_REQUEST,
                "provide exactly one of query or like",
            )
        }
    };

    let mut query = Query::new(text);
    if let Some(category) = body.category {
        query = query.with_filter(MetadataFilter::new().with("category", category));
    }
    if let Some(top_k) = body.top_k {
        query = query.with_top_k(top_k);
    }

    match pipeline.answer(query).await {
        Ok(answer) => json_response(StatusCode::OK, &answer),
        Err(err) => {
            let status = match &err {
                PipelineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            };
            warn!(error = %err, "query failed");
            json_error(status, &err.to_string())
        }
    }
}

fn bearer_matches(headers: &hyper::HeaderMap, expected: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token == expected)
        .unwrap_or(false)
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let payload = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(Full::from(payload));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

fn json_error(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &serde_json::json!({ "error": message }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::index::VectorIndex;
    use crate::provider::{
        EmbedResult, Embedder, GenerateResult, GenerationRequest, Generator,
    };
    use crate::types::Chunk;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct StaticEmbedder;

    #[async_trait]
    impl Embedder for StaticEmbedder {
        async fn embed(&self, _text: &str) -> EmbedResult<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
    }

    struct EchoGenerator;

    #[async_trait]
    impl Generator for EchoGenerator {
        async fn generate(&self, _request: &GenerationRequest) -> GenerateResult<String> {
            Ok("From the collection [1].".to_string())
        }
    }

    fn seeded_index() -> Arc<VectorIndex> {
        let index = Arc::new(VectorIndex::new(2).with_chunking(64, 8));
        let mut metadata = HashMap::new();
        metadata.insert("category".to_string(), "soup".to_string());
        index
            .insert(vec![(
                Chunk {
                    id: "minestrone#0".to_string(),
                    doc_id: "minestrone".to_string(),
                    ordinal: 0,
                    text: "Simmer beans and vegetables.".to_string(),
                    prev: None,
                    next: None,
                    metadata,
                },
                vec![1.0, 0.0],
            )])
            .unwrap();
        index
    }

    fn test_pipeline() -> Arc<QueryPipeline> {
        let mut config = Config::default();
        config.embedding.dimension = 2;
        config.retrieval.rerank_weight = 0.0;
        config.retry.base_delay_ms = 1;
        Arc::new(QueryPipeline::new(
            &config,
            Arc::new(StaticEmbedder),
            Arc::new(EchoGenerator),
            seeded_index(),
        ))
    }

    fn post_query(body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri("/query")
            .body(Full::<Bytes>::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_healthz_reports_index_state() {
        let request = Request::builder()
            .method(Method::GET)
            .uri("/healthz")
            .body(Full::<Bytes>::from(Bytes::new()))
            .unwrap();
        let response = handle_request(request, test_pipeline(), None).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["chunks"], 1);
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let request = Request::builder()
            .method(Method::GET)
            .uri("/metrics")
            .body(Full::<Bytes>::from(Bytes::new()))
            .unwrap();
        let response = handle_request(request, test_pipeline(), None).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_query_answers_with_citations() {
        let response = handle_request(
            post_query(r#"{"query":"bean soup"}"#),
            test_pipeline(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["grounded"], true);
        assert_eq!(json["citations"][0], "minestrone#0");
    }

    #[tokio::test]
    async fn test_query_without_token_is_unauthorized_when_key_is_set() {
        let response = handle_request(
            post_query(r#"{"query":"bean soup"}"#),
            test_pipeline(),
            Some("s3cret"),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_query_with_bearer_token_is_accepted() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/query")
            .header(header::AUTHORIZATION, "Bearer s3cret")
            .body(Full::<Bytes>::from(r#"{"query":"bean soup"}"#.to_string()))
            .unwrap();
        let response = handle_request(request, test_pipeline(), Some("s3cret"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_query_and_like_together_are_rejected() {
        let response = handle_request(
            post_query(r#"{"query":"a","like":"minestrone"}"#),
            test_pipeline(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_like_unknown_document_is_not_found() {
        let response = handle_request(
            post_query(r#"{"like":"no-such-recipe"}"#),
            test_pipeline(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_like_uses_the_document_text_as_query() {
        let response = handle_request(
            post_query(r#"{"like":"minestrone"}"#),
            test_pipeline(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["context"][0], "minestrone#0");
    }

    #[tokio::test]
    async fn test_malformed_body_is_a_bad_request() {
        let response = handle_request(post_query("not json"), test_pipeline(), None)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_zero_top_k_is_rejected() {
        let response = handle_request(
            post_query(r#"{"query":"bean soup","top_k":0}"#),
            test_pipeline(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"], "top_k must be greater than zero");
    }

    #[tokio::test]
    async fn test_filtered_category_that_matches_nothing_is_ungrounded() {
        let response = handle_request(
            post_query(r#"{"query":"bean soup","category":"dessert"}"#),
            test_pipeline(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["grounded"], false);
    }

    #[tokio::test]
    async fn test_run_serves_and_stops_on_cancellation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new(test_pipeline(), None);
        let shutdown = CancellationToken::new();

        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.run(listener, shutdown).await })
        };

        let url = format!("http://{addr}/healthz");
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
