//! OpenAI-compatible `/embeddings` endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sift_config::EmbeddingConfig;
use tracing::{debug, warn};

use super::{EmbeddingError, EmbeddingProvider};

const MAX_RETRIES: u32 = 3;

/// Request body for embedding API
#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

/// Response from embedding API
#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

/// Individual embedding data in response
#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Embeddings from any server speaking the OpenAI embeddings API
/// (OpenAI, OpenRouter, Ollama, vLLM, ...).
pub struct HttpEmbeddings {
    api_key: Option<String>,
    model: String,
    dimensions: usize,
    client: Client,
    base_url: String,
    batch_size: usize,
}

impl HttpEmbeddings {
    pub fn new(api_key: Option<String>, model: String, dimensions: usize) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            api_key,
            model,
            dimensions,
            client,
            base_url: EmbeddingConfig::default().base_url,
            batch_size: 32,
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Self {
        let mut provider = Self::new(config.api_key.clone(), config.model.clone(), config.dimensions)
            .with_base_url(config.base_url.clone());
        provider.batch_size = config.batch_size.max(1);
        provider
    }

    /// Set a custom base URL (useful for testing or proxies).
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    /// Send embedding request with retry logic for rate limits.
    async fn send_request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let request_body = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: Some(self.dimensions),
        };

        let mut retry_count = 0;
        let mut backoff_secs = 1u64;

        loop {
            debug!(
                "Sending embedding request for {} texts to {}",
                texts.len(),
                self.base_url
            );

            let mut request = self.client.post(&self.base_url).json(&request_body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }
            let response = request
                .send()
                .await
                .map_err(|e| EmbeddingError::NetworkError(e.to_string()))?;

            let status = response.status();

            if status.is_success() {
                let embedding_response: EmbeddingResponse = response
                    .json()
                    .await
                    .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

                // Sort by index to ensure correct order
                let mut embeddings: Vec<(usize, Vec<f32>)> = embedding_response
                    .data
                    .into_iter()
                    .map(|d| (d.index, d.embedding))
                    .collect();
                embeddings.sort_by_key(|(idx, _)| *idx);

                return Ok(embeddings.into_iter().map(|(_, emb)| emb).collect());
            }

            if status.as_u16() == 429 {
                retry_count += 1;
                if retry_count > MAX_RETRIES {
                    return Err(EmbeddingError::RateLimited(MAX_RETRIES));
                }

                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(backoff_secs);

                warn!(
                    "Rate limited, retrying after {} seconds (attempt {}/{})",
                    retry_after, retry_count, MAX_RETRIES
                );

                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                backoff_secs *= 2;
                continue;
            }

            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EmbeddingError::ApiError(format!(
                "{}: {}",
                status.as_u16(),
                error_body
            )));
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddings {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        debug!("Embedding batch of {} texts", texts.len());
        self.send_request(texts).await
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn max_batch_size(&self) -> usize {
        self.batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response per entry, in order. Returns the
    /// base URL and a handle yielding the raw requests received.
    async fn serve(responses: Vec<String>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                requests.push(read_request(&mut socket).await);
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
            requests
        });
        (format!("http://{addr}/v1/embeddings"), handle)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let length = text[..header_end]
                    .lines()
                    .find_map(|l| {
                        let lower = l.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn http_response(status: &str, extra_headers: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\n{extra_headers}Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[test]
    fn test_provider_from_config() {
        let config = EmbeddingConfig {
            model: "custom/model".to_string(),
            dimensions: 1024,
            batch_size: 16,
            base_url: "http://localhost:8080/embeddings".to_string(),
            ..EmbeddingConfig::default()
        };
        let provider = HttpEmbeddings::from_config(&config);
        assert_eq!(provider.dimensions(), 1024);
        assert_eq!(provider.model_name(), "custom/model");
        assert_eq!(provider.max_batch_size(), 16);
        assert_eq!(provider.base_url, "http://localhost:8080/embeddings");
    }

    #[tokio::test]
    async fn test_response_reordered_by_index() {
        let body = r#"{"data":[{"embedding":[2.0,2.0],"index":1},{"embedding":[1.0,1.0],"index":0}]}"#;
        let (url, server) = serve(vec![http_response("200 OK", "", body)]).await;

        let provider = HttpEmbeddings::new(Some("secret".to_string()), "m".to_string(), 2)
            .with_base_url(url);
        let vectors = provider
            .embed_batch(&["first".to_string(), "second".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![1.0, 1.0], vec![2.0, 2.0]]);

        let requests = server.await.unwrap();
        let request = requests[0].to_ascii_lowercase();
        assert!(request.contains("authorization: bearer secret"));
        assert!(requests[0].contains(r#""input":["first","second"]"#));
        assert!(requests[0].contains(r#""dimensions":2"#));
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let ok = r#"{"data":[{"embedding":[0.5],"index":0}]}"#;
        let (url, server) = serve(vec![
            http_response("429 Too Many Requests", "Retry-After: 0\r\n", "{}"),
            http_response("200 OK", "", ok),
        ])
        .await;

        let provider = HttpEmbeddings::new(None, "m".to_string(), 1).with_base_url(url);
        let vector = provider.embed("hello").await.unwrap();
        assert_eq!(vector, vec![0.5]);
        assert_eq!(server.await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_server_error_surfaces() {
        let (url, _server) =
            serve(vec![http_response("500 Internal Server Error", "", r#"{"error":"boom"}"#)]).await;
        let provider = HttpEmbeddings::new(None, "m".to_string(), 1).with_base_url(url);
        let err = provider.embed("hello").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::ApiError(msg) if msg.starts_with("500")));
    }
}
