//! OCR for a single page, against any OpenAI-compatible chat completions
//! endpoint (a local vLLM server or a remote API).

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImageArgs,
    ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs, ImageUrlArgs,
};
use base64::{Engine as _, prelude::BASE64_STANDARD};
use keen_retry::{ExponentialJitter, ResolvedResult, RetryResult};

use crate::{
    prelude::*,
    retry::{
        IsKnownTransient, retry_result_fatal, retry_result_ok, retry_result_transient,
        try_fatal, try_potentially_transient,
    },
};

/// Where to send requests, and how to authenticate.
#[derive(Clone)]
pub struct EndpointAuth {
    pub base_url: String,
    pub api_key: String,
}

impl std::fmt::Debug for EndpointAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointAuth")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Sampling parameters for OCR requests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.0,
        }
    }
}

/// The result of OCRing one page.
#[derive(Clone, Debug)]
pub struct OcrPageResult {
    /// The model's text, trimmed.
    pub markdown: String,
    /// How long the successful attempt took.
    pub request_duration: Duration,
    /// The provider's `usage` object, as-is.
    pub usage: Option<Value>,
    pub finish_reason: Option<String>,
    /// The model name reported by the provider.
    pub provider_model: Option<String>,
    /// Number of attempts, including the successful one.
    pub attempts: u32,
}

/// OCRs one page at a time.
#[async_trait]
pub trait PageOcr: Send + Sync {
    async fn ocr_page(
        &self,
        model: &str,
        prompt: &str,
        png: &[u8],
        params: &GenerationParams,
    ) -> Result<OcrPageResult>;
}

/// Creates a [`PageOcr`] client for an endpoint.
pub trait OcrClientFactory: Send + Sync + 'static {
    fn create(&self, auth: EndpointAuth) -> Result<Arc<dyn PageOcr>>;
}

/// When to retry, and how long to wait between attempts.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry. Each retry doubles it.
    pub base_delay: Duration,
    /// Upper bound on the delay between retries.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// The longest delay we'll reach, given the number of retries.
    fn final_delay(&self) -> Duration {
        let doublings = self.max_attempts.saturating_sub(2).min(16);
        self.base_delay
            .saturating_mul(1 << doublings)
            .min(self.max_delay)
            .max(self.base_delay)
    }
}

/// Builds [`OpenAiCompatibleClient`]s.
#[derive(Clone, Debug)]
pub struct OpenAiCompatibleFactory {
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl OcrClientFactory for OpenAiCompatibleFactory {
    fn create(&self, auth: EndpointAuth) -> Result<Arc<dyn PageOcr>> {
        Ok(Arc::new(OpenAiCompatibleClient::new(
            auth,
            self.timeout,
            self.retry.clone(),
        )?))
    }
}

/// The response fields we care about. Providers disagree on the rest.
#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// A client for one OpenAI-compatible endpoint.
#[derive(Debug)]
pub struct OpenAiCompatibleClient {
    auth: EndpointAuth,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl OpenAiCompatibleClient {
    pub fn new(auth: EndpointAuth, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { auth, http, retry })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.auth.base_url.trim_end_matches('/'))
    }

    /// Build the chat request: one user message with the prompt and the page.
    #[allow(deprecated)]
    fn build_request(
        model: &str,
        prompt: &str,
        png: &[u8],
        params: &GenerationParams,
    ) -> Result<CreateChatCompletionRequest> {
        let image_url = format!("data:image/png;base64,{}", BASE64_STANDARD.encode(png));
        let parts: Vec<ChatCompletionRequestUserMessageContentPart> = vec![
            ChatCompletionRequestMessageContentPartTextArgs::default()
                .text(prompt)
                .build()?
                .into(),
            ChatCompletionRequestMessageContentPartImageArgs::default()
                .image_url(ImageUrlArgs::default().url(image_url).build()?)
                .build()?
                .into(),
        ];
        let messages: Vec<ChatCompletionRequestMessage> =
            vec![ChatCompletionRequestUserMessageArgs::default()
                .content(parts)
                .build()?
                .into()];
        let request = CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages(messages)
            .max_tokens(params.max_tokens)
            .temperature(params.temperature)
            .build()
            .context("Error building request")?;
        Ok(request)
    }

    /// Make one attempt.
    #[instrument(level = "debug", skip_all, fields(attempt))]
    async fn attempt(
        &self,
        attempts: &AtomicU32,
        request: &CreateChatCompletionRequest,
    ) -> RetryResult<(), (), (Duration, ChatResponse), anyhow::Error> {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::Span::current().record("attempt", attempt);

        let started = Instant::now();
        let response = try_potentially_transient!(
            self.http
                .post(self.completions_url())
                .bearer_auth(&self.auth.api_key)
                .json(request)
                .send()
                .await
        );
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = anyhow!("HTTP status {}: {}", status, body.trim());
            return if status.is_known_transient() {
                debug!("Potentially transient error: {:?}", err);
                retry_result_transient(err)
            } else {
                retry_result_fatal(err)
            };
        }
        let body = try_potentially_transient!(response.text().await);
        let elapsed = started.elapsed();
        let parsed = try_fatal!(
            serde_json::from_str::<ChatResponse>(&body)
                .with_context(|| format!("Error parsing chat completion response: {:?}", body))
        );
        retry_result_ok((elapsed, parsed))
    }
}

#[async_trait]
impl PageOcr for OpenAiCompatibleClient {
    #[instrument(level = "debug", skip_all, fields(model = %model, base_url = %self.auth.base_url))]
    async fn ocr_page(
        &self,
        model: &str,
        prompt: &str,
        png: &[u8],
        params: &GenerationParams,
    ) -> Result<OcrPageResult> {
        let request = Self::build_request(model, prompt, png, params)?;
        let attempts = AtomicU32::new(0);

        let first = self.attempt(&attempts, &request).await;
        let resolved = if self.retry.max_attempts <= 1 {
            match first {
                RetryResult::Ok { output, .. } => Ok(output),
                RetryResult::Transient { error, .. } | RetryResult::Fatal { error, .. } => {
                    Err(error)
                }
            }
        } else {
            let jitter = ExponentialJitter::FromBackoffRange {
                backoff_range_millis: self.retry.base_delay.as_millis().try_into().unwrap_or(2_000)
                    ..=self.retry.final_delay().as_millis().try_into().unwrap_or(15_000),
                re_attempts: (self.retry.max_attempts - 1).try_into().unwrap_or(3),
                jitter_ratio: 0.1,
            };
            let result = first
                .retry_with_async(|_| async { self.attempt(&attempts, &request).await })
                .with_exponential_jitter(|| jitter)
                .await
                .inspect_recovered(|_, _, retry_errors_list| {
                    warn!(
                        "succeeded after retrying {} times (failed attempts: [{}])",
                        retry_errors_list.len(),
                        keen_retry::loggable_retry_errors(retry_errors_list)
                    )
                })
                .inspect_given_up(|_, retry_errors_list, fatal_error| {
                    warn!(
                        "gave up after {} retries with error {fatal_error:?}",
                        retry_errors_list.len(),
                    )
                });
            match result {
                ResolvedResult::Ok { output, .. } | ResolvedResult::Recovered { output, .. } => {
                    Ok(output)
                }
                ResolvedResult::Fatal { error, .. } => Err(error),
                ResolvedResult::GivenUp { fatal_error, .. }
                | ResolvedResult::Unrecoverable { fatal_error, .. } => Err(fatal_error),
            }
        };

        let (request_duration, response) = resolved.map_err(|err| {
            anyhow!(
                "OCR request failed for model '{}' against '{}': {:#}",
                model,
                self.auth.base_url,
                err
            )
        })?;
        let choice = response.choices.into_iter().next();
        let finish_reason = choice.as_ref().and_then(|c| c.finish_reason.clone());
        let markdown = choice
            .and_then(|c| c.message.content)
            .unwrap_or_default()
            .trim()
            .to_owned();
        Ok(OcrPageResult {
            markdown,
            request_duration,
            usage: response.usage.filter(|usage| !usage.is_null()),
            finish_reason,
            provider_model: response.model,
            attempts: attempts.load(Ordering::SeqCst),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;
    use tokio::{
        io::{AsyncReadExt as _, AsyncWriteExt as _},
        net::TcpListener,
    };

    use super::*;

    /// A tiny HTTP server that answers each request with the next canned
    /// response, and remembers the request bodies.
    pub(crate) struct ScriptedServer {
        pub base_url: String,
        pub hits: Arc<AtomicUsize>,
        pub bodies: Arc<std::sync::Mutex<Vec<Value>>>,
    }

    impl ScriptedServer {
        pub(crate) async fn start(responses: Vec<(u16, String)>) -> Result<Self> {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let base_url = format!("http://{}/v1", listener.local_addr()?);
            let hits = Arc::new(AtomicUsize::new(0));
            let bodies = Arc::new(std::sync::Mutex::new(vec![]));
            let responses = Arc::new(responses);
            {
                let hits = hits.clone();
                let bodies = bodies.clone();
                tokio::spawn(async move {
                    while let Ok((mut socket, _)) = listener.accept().await {
                        let index = hits.fetch_add(1, Ordering::SeqCst);
                        let (status, body) = responses
                            .get(index)
                            .or_else(|| responses.last())
                            .cloned()
                            .unwrap_or((500, String::new()));
                        let bodies = bodies.clone();
                        tokio::spawn(async move {
                            if let Some(request_body) = read_request_body(&mut socket).await {
                                if let Ok(value) = serde_json::from_slice(&request_body) {
                                    bodies.lock().expect("lock poisoned").push(value);
                                }
                            }
                            let reply = format!(
                                "HTTP/1.1 {status} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                                body.len()
                            );
                            let _ = socket.write_all(reply.as_bytes()).await;
                            let _ = socket.shutdown().await;
                        });
                    }
                });
            }
            Ok(Self {
                base_url,
                hits,
                bodies,
            })
        }
    }

    async fn read_request_body(socket: &mut tokio::net::TcpStream) -> Option<Vec<u8>> {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buffer.extend_from_slice(&chunk[..n]);
            let Some(header_end) = buffer.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let headers = String::from_utf8_lossy(&buffer[..header_end]).to_lowercase();
            let content_length = headers
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            let body_start = header_end + 4;
            while buffer.len() < body_start + content_length {
                let n = socket.read(&mut chunk).await.ok()?;
                if n == 0 {
                    return None;
                }
                buffer.extend_from_slice(&chunk[..n]);
            }
            return Some(buffer[body_start..body_start + content_length].to_vec());
        }
    }

    pub(crate) fn completion_body(text: &str) -> String {
        json!({
            "id": "cmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "served-model",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": text},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 100, "completion_tokens": 20, "total_tokens": 120}
        })
        .to_string()
    }

    fn fast_client(base_url: &str, max_attempts: u32) -> Result<OpenAiCompatibleClient> {
        OpenAiCompatibleClient::new(
            EndpointAuth {
                base_url: base_url.to_owned(),
                api_key: "sk-test".to_owned(),
            },
            Duration::from_secs(10),
            RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
            },
        )
    }

    #[tokio::test]
    async fn parses_successful_response() -> Result<()> {
        let server = ScriptedServer::start(vec![(200, completion_body("  # Title\n\nBody  "))]).await?;
        let client = fast_client(&server.base_url, 4)?;
        let result = client
            .ocr_page("m", "Read this.", b"png-bytes", &GenerationParams::default())
            .await?;
        assert_eq!(result.markdown, "# Title\n\nBody");
        assert_eq!(result.attempts, 1);
        assert_eq!(result.finish_reason.as_deref(), Some("stop"));
        assert_eq!(result.provider_model.as_deref(), Some("served-model"));
        assert_eq!(result.usage.as_ref().map(|u| u["total_tokens"].clone()), Some(json!(120)));

        let bodies = server.bodies.lock().expect("lock poisoned").clone();
        let request = &bodies[0];
        assert_eq!(request["model"], "m");
        assert_eq!(request["max_tokens"], 2048);
        let content = &request["messages"][0]["content"];
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[0]["text"], "Read this.");
        assert_eq!(content[1]["type"], "image_url");
        let url = content[1]["image_url"]["url"].as_str().unwrap_or_default();
        assert!(url.starts_with("data:image/png;base64,"));
        Ok(())
    }

    #[tokio::test]
    async fn retries_transient_statuses() -> Result<()> {
        let server = ScriptedServer::start(vec![
            (503, r#"{"error": "busy"}"#.to_owned()),
            (200, completion_body("ok")),
        ])
        .await?;
        let client = fast_client(&server.base_url, 4)?;
        let result = client
            .ocr_page("m", "p", b"png", &GenerationParams::default())
            .await?;
        assert_eq!(result.markdown, "ok");
        assert_eq!(result.attempts, 2);
        assert_eq!(server.hits.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn fatal_statuses_are_not_retried() -> Result<()> {
        let server = ScriptedServer::start(vec![(400, r#"{"error": "bad image"}"#.to_owned())]).await?;
        let client = fast_client(&server.base_url, 4)?;
        let err = client
            .ocr_page("m", "p", b"png", &GenerationParams::default())
            .await
            .expect_err("400 is fatal");
        let msg = err.to_string();
        assert!(
            msg.starts_with(&format!("OCR request failed for model 'm' against '{}'", server.base_url)),
            "{msg}"
        );
        assert!(msg.contains("400"), "{msg}");
        assert_eq!(server.hits.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() -> Result<()> {
        let server = ScriptedServer::start(vec![(429, "{}".to_owned())]).await?;
        let client = fast_client(&server.base_url, 3)?;
        let err = client
            .ocr_page("m", "p", b"png", &GenerationParams::default())
            .await
            .expect_err("always rate limited");
        assert!(err.to_string().contains("429"), "{err}");
        assert_eq!(server.hits.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn single_attempt_policy_does_not_retry() -> Result<()> {
        let server = ScriptedServer::start(vec![(503, "{}".to_owned())]).await?;
        let client = fast_client(&server.base_url, 1)?;
        assert!(
            client
                .ocr_page("m", "p", b"png", &GenerationParams::default())
                .await
                .is_err()
        );
        assert_eq!(server.hits.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.final_delay(), Duration::from_secs(8));
        let policy = RetryPolicy {
            max_attempts: 10,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.final_delay(), Duration::from_secs(15));
    }

    #[test]
    fn auth_debug_hides_key() {
        let auth = EndpointAuth {
            base_url: "http://x".into(),
            api_key: "sk-secret".into(),
        };
        assert!(!format!("{auth:?}").contains("sk-secret"));
    }
}
