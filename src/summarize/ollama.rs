use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::SummarizeConfig;
use crate::summarize::balancer::LoadBalancer;
use crate::util::{cap_words, strip_html, truncate_chars};

/// Sampling seed: summaries must come out the same for the same input.
const SAMPLING_SEED: i64 = 42;

/// Generation cap in tokens, comfortably above the word cap so the model is
/// never cut off mid-sentence by the transport.
const NUM_PREDICT: i32 = 512;

/// Attempts per summarize call, each against a different healthy endpoint.
const MAX_ATTEMPTS: usize = 2;

#[derive(Debug, Error)]
pub enum SummarizeError {
    /// Every configured endpoint is unhealthy; failing fast beats retrying blindly.
    #[error("No healthy inference endpoint available")]
    NoHealthyEndpoint,
    /// Network-level error reaching the endpoint
    #[error("Inference request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Endpoint answered with a non-2xx status
    #[error("Inference endpoint returned status {0}")]
    HttpStatus(u16),
    /// The request exceeded the configured timeout
    #[error("Inference request timed out")]
    Timeout,
    /// 2xx response with nothing usable in it
    #[error("Inference response was empty")]
    EmptyResponse,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    seed: i64,
    num_predict: i32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Client for Ollama-style `/api/generate` endpoints, load-balanced across
/// the configured list.
pub struct Summarizer {
    client: reqwest::Client,
    balancer: Arc<LoadBalancer>,
    config: SummarizeConfig,
}

impl Summarizer {
    pub fn new(
        client: reqwest::Client,
        balancer: Arc<LoadBalancer>,
        config: SummarizeConfig,
    ) -> Self {
        Self {
            client,
            balancer,
            config,
        }
    }

    /// The fixed instructional prompt: role, output constraints, length cap.
    fn system_prompt(&self) -> String {
        format!(
            "You are a news summarization assistant. Summarize the article the user \
             provides in at most {} words. Write plain prose: no headings, no bullet \
             points, no preamble. Keep the key facts and conclusions; drop boilerplate.",
            self.config.max_summary_words
        )
    }

    /// Summarize one article: strip markup, cap the input, call a healthy
    /// endpoint with deterministic sampling, then trim and word-cap the
    /// output.
    ///
    /// Up to two attempts, each rotated to a different healthy endpoint — a
    /// timeout in particular is never retried against the endpoint that
    /// timed out.
    pub async fn summarize(&self, title: &str, content: &str) -> Result<String, SummarizeError> {
        let text = strip_html(content);
        let text = truncate_chars(&text, self.config.max_input_chars);
        let prompt = format!("Title: {}\n\n{}", title, text);
        let system = self.system_prompt();

        let mut last_endpoint: Option<usize> = None;
        let mut last_error = SummarizeError::NoHealthyEndpoint;

        for attempt in 1..=MAX_ATTEMPTS {
            let Some((idx, endpoint)) = self.balancer.select(last_endpoint) else {
                // Nothing healthy (or nothing healthy besides the endpoint
                // that just failed): surface immediately.
                return Err(if attempt == 1 {
                    SummarizeError::NoHealthyEndpoint
                } else {
                    last_error
                });
            };

            let started = Instant::now();
            match self.call_endpoint(&endpoint.url, &endpoint.model, &prompt, &system).await {
                Ok(raw) => {
                    self.balancer.record_success(idx, started.elapsed());
                    let summary = cap_words(raw.trim(), self.config.max_summary_words);
                    if summary.is_empty() {
                        return Err(SummarizeError::EmptyResponse);
                    }
                    return Ok(summary);
                }
                Err(e) => {
                    self.balancer.record_failure(idx);
                    tracing::warn!(
                        url = %endpoint.url,
                        attempt,
                        error = %e,
                        "Inference call failed"
                    );
                    last_endpoint = Some(idx);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn call_endpoint(
        &self,
        base_url: &str,
        model: &str,
        prompt: &str,
        system: &str,
    ) -> Result<String, SummarizeError> {
        let url = format!("{}/api/generate", base_url.trim_end_matches('/'));
        let request = GenerateRequest {
            model,
            prompt,
            system,
            stream: false,
            options: GenerateOptions {
                temperature: 0.0,
                seed: SAMPLING_SEED,
                num_predict: NUM_PREDICT,
            },
        };

        let response = tokio::time::timeout(
            Duration::from_secs(self.config.request_timeout_secs),
            self.client.post(&url).json(&request).send(),
        )
        .await
        .map_err(|_| SummarizeError::Timeout)?
        .map_err(SummarizeError::Network)?;

        if !response.status().is_success() {
            return Err(SummarizeError::HttpStatus(response.status().as_u16()));
        }

        let body: GenerateResponse = response.json().await.map_err(SummarizeError::Network)?;
        Ok(body.response)
    }
}
