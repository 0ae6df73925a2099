use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::EndpointConfig;

/// Request failures in a row before an endpoint is forced unhealthy,
/// independent of the probe cadence.
const FAILURE_LIMIT: u32 = 3;

/// Smoothing factor for the rolling latency average.
const LATENCY_EMA_ALPHA: f64 = 0.3;

/// Probe requests get a short leash; a probe that hangs tells us enough.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Tracked health of one inference endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    pub reachable: bool,
    pub consecutive_failures: u32,
    pub avg_latency_ms: f64,
    pub requests: u64,
    pub successes: u64,
}

impl Default for EndpointHealth {
    fn default() -> Self {
        // Optimistic until the startup probe reports otherwise: rejecting
        // every call before the first probe finishes would be self-inflicted
        // downtime.
        Self {
            reachable: true,
            consecutive_failures: 0,
            avg_latency_ms: 0.0,
            requests: 0,
            successes: 0,
        }
    }
}

/// One endpoint's config plus current health, for the health command.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub url: String,
    pub model: String,
    pub weight: u32,
    pub health: EndpointHealth,
}

struct BalancerState {
    health: Vec<EndpointHealth>,
    cursor: usize,
}

/// Round-robin selection over healthy inference endpoints.
///
/// Weight is honored by slot expansion: an endpoint with weight w occupies w
/// positions in the rotation. Selection never blocks — if nothing is healthy
/// the caller fails immediately rather than retrying blindly.
pub struct LoadBalancer {
    endpoints: Vec<EndpointConfig>,
    rotation: Vec<usize>,
    state: Mutex<BalancerState>,
}

impl LoadBalancer {
    pub fn new(endpoints: Vec<EndpointConfig>) -> Self {
        let rotation: Vec<usize> = endpoints
            .iter()
            .enumerate()
            .flat_map(|(idx, e)| std::iter::repeat(idx).take(e.weight.max(1) as usize))
            .collect();
        let health = endpoints.iter().map(|_| EndpointHealth::default()).collect();
        Self {
            endpoints,
            rotation,
            state: Mutex::new(BalancerState { health, cursor: 0 }),
        }
    }

    /// Pick the next healthy endpoint in rotation, skipping `exclude`.
    /// Returns the endpoint's index and config, or `None` when no healthy
    /// endpoint remains.
    pub fn select(&self, exclude: Option<usize>) -> Option<(usize, EndpointConfig)> {
        let mut state = self.state.lock().expect("balancer lock poisoned");
        let len = self.rotation.len();
        for step in 0..len {
            let slot = (state.cursor + step) % len;
            let idx = self.rotation[slot];
            if Some(idx) == exclude || !state.health[idx].reachable {
                continue;
            }
            state.cursor = (slot + 1) % len;
            return Some((idx, self.endpoints[idx].clone()));
        }
        None
    }

    /// Record a completed request against endpoint `idx`.
    pub fn record_success(&self, idx: usize, latency: Duration) {
        let mut state = self.state.lock().expect("balancer lock poisoned");
        let health = &mut state.health[idx];
        health.requests += 1;
        health.successes += 1;
        health.consecutive_failures = 0;
        health.reachable = true;
        let sample = latency.as_secs_f64() * 1000.0;
        health.avg_latency_ms = if health.successes == 1 {
            sample
        } else {
            health.avg_latency_ms * (1.0 - LATENCY_EMA_ALPHA) + sample * LATENCY_EMA_ALPHA
        };
    }

    /// Record a failed request against endpoint `idx`. The third consecutive
    /// failure forces the endpoint unhealthy on the spot — no waiting for
    /// the next probe.
    pub fn record_failure(&self, idx: usize) {
        let mut state = self.state.lock().expect("balancer lock poisoned");
        let health = &mut state.health[idx];
        health.requests += 1;
        health.consecutive_failures += 1;
        if health.consecutive_failures >= FAILURE_LIMIT && health.reachable {
            health.reachable = false;
            tracing::warn!(
                url = %self.endpoints[idx].url,
                failures = health.consecutive_failures,
                "Inference endpoint marked unhealthy"
            );
        }
    }

    pub fn healthy_count(&self) -> usize {
        let state = self.state.lock().expect("balancer lock poisoned");
        state.health.iter().filter(|h| h.reachable).count()
    }

    /// Config plus health of every endpoint, for the health command.
    pub fn snapshot(&self) -> Vec<EndpointStatus> {
        let state = self.state.lock().expect("balancer lock poisoned");
        self.endpoints
            .iter()
            .zip(state.health.iter())
            .map(|(e, h)| EndpointStatus {
                url: e.url.clone(),
                model: e.model.clone(),
                weight: e.weight,
                health: h.clone(),
            })
            .collect()
    }

    /// Probe every endpoint's root URL and update reachability. A 2xx marks
    /// the endpoint healthy again and clears its failure streak.
    pub async fn probe_all(&self, client: &reqwest::Client) {
        for (idx, endpoint) in self.endpoints.iter().enumerate() {
            let reachable = match tokio::time::timeout(
                PROBE_TIMEOUT,
                client.get(&endpoint.url).send(),
            )
            .await
            {
                Ok(Ok(response)) => response.status().is_success(),
                Ok(Err(e)) => {
                    tracing::debug!(url = %endpoint.url, error = %e, "Endpoint probe failed");
                    false
                }
                Err(_) => {
                    tracing::debug!(url = %endpoint.url, "Endpoint probe timed out");
                    false
                }
            };

            let mut state = self.state.lock().expect("balancer lock poisoned");
            let health = &mut state.health[idx];
            if reachable && !health.reachable {
                tracing::info!(url = %endpoint.url, "Inference endpoint healthy again");
            }
            health.reachable = reachable;
            if reachable {
                health.consecutive_failures = 0;
            }
        }
    }

    /// Spawn the periodic probe task: one probe at startup, then one per
    /// interval, until the returned handle is aborted.
    pub fn spawn_probe(
        self: Arc<Self>,
        client: reqwest::Client,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.probe_all(&client).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn endpoint(url: &str, weight: u32) -> EndpointConfig {
        EndpointConfig {
            url: url.to_string(),
            model: "llama3.2".to_string(),
            weight,
        }
    }

    #[test]
    fn test_round_robin_alternates() {
        let lb = LoadBalancer::new(vec![endpoint("http://a", 1), endpoint("http://b", 1)]);
        let picks: Vec<usize> = (0..4).map(|_| lb.select(None).unwrap().0).collect();
        assert_eq!(picks, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_weighted_rotation() {
        let lb = LoadBalancer::new(vec![endpoint("http://a", 2), endpoint("http://b", 1)]);
        let picks: Vec<usize> = (0..6).map(|_| lb.select(None).unwrap().0).collect();
        assert_eq!(picks, vec![0, 0, 1, 0, 0, 1]);
    }

    #[test]
    fn test_zero_weight_still_rotates() {
        let lb = LoadBalancer::new(vec![endpoint("http://a", 0)]);
        assert_eq!(lb.select(None).unwrap().0, 0);
    }

    #[test]
    fn test_three_failures_force_unhealthy() {
        let lb = LoadBalancer::new(vec![endpoint("http://a", 1), endpoint("http://b", 1)]);
        lb.record_failure(0);
        lb.record_failure(0);
        assert_eq!(lb.healthy_count(), 2);
        lb.record_failure(0);
        assert_eq!(lb.healthy_count(), 1);

        // All subsequent selections route around the unhealthy endpoint
        for _ in 0..4 {
            assert_eq!(lb.select(None).unwrap().0, 1);
        }
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let lb = LoadBalancer::new(vec![endpoint("http://a", 1)]);
        lb.record_failure(0);
        lb.record_failure(0);
        lb.record_success(0, Duration::from_millis(100));
        lb.record_failure(0);
        lb.record_failure(0);
        // Streak was broken: still two short of the limit
        assert_eq!(lb.healthy_count(), 1);
    }

    #[test]
    fn test_no_healthy_endpoint_returns_none() {
        let lb = LoadBalancer::new(vec![endpoint("http://a", 1)]);
        for _ in 0..3 {
            lb.record_failure(0);
        }
        assert!(lb.select(None).is_none());
    }

    #[test]
    fn test_exclude_only_healthy_returns_none() {
        let lb = LoadBalancer::new(vec![endpoint("http://a", 1), endpoint("http://b", 1)]);
        for _ in 0..3 {
            lb.record_failure(1);
        }
        assert!(lb.select(Some(0)).is_none());
    }

    #[test]
    fn test_latency_average_smooths() {
        let lb = LoadBalancer::new(vec![endpoint("http://a", 1)]);
        lb.record_success(0, Duration::from_millis(100));
        lb.record_success(0, Duration::from_millis(200));
        let snapshot = lb.snapshot();
        // 100 * 0.7 + 200 * 0.3
        assert!((snapshot[0].health.avg_latency_ms - 130.0).abs() < 1.0);
        assert_eq!(snapshot[0].health.requests, 2);
        assert_eq!(snapshot[0].health.successes, 2);
    }

    #[tokio::test]
    async fn test_probe_restores_unhealthy_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Ollama is running"))
            .mount(&server)
            .await;

        let lb = LoadBalancer::new(vec![endpoint(&server.uri(), 1)]);
        for _ in 0..3 {
            lb.record_failure(0);
        }
        assert_eq!(lb.healthy_count(), 0);

        lb.probe_all(&reqwest::Client::new()).await;
        assert_eq!(lb.healthy_count(), 1);
        let snapshot = lb.snapshot();
        assert_eq!(snapshot[0].health.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_probe_marks_unreachable_down() {
        // Nothing is listening on this address
        let lb = LoadBalancer::new(vec![endpoint("http://127.0.0.1:1", 1)]);
        lb.probe_all(&reqwest::Client::new()).await;
        assert_eq!(lb.healthy_count(), 0);
    }
}
