use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AgentResult, ServerFault};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const INITIAL_POLL_DELAY: Duration = Duration::from_millis(100);
const MAX_POLL_DELAY: Duration = Duration::from_millis(2000);
const BACKOFF_FACTOR: f64 = 1.5;

/// Verdict of a single `/health` probe. Orthogonal to the lifecycle state:
/// a running process can still be loading its model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Loading,
    Error,
    Unknown,
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    status: Option<String>,
}

/// HTTP liveness/readiness polling against a server's loopback port.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthProbe {
    pub fn new() -> Self {
        HealthProbe {
            client: reqwest::Client::new(),
        }
    }

    /// One short-lived `GET /health`.
    ///
    /// 200 with a JSON `status` field maps onto [`HealthStatus`]
    /// (unrecognized values read as unknown); 200 without JSON is ok;
    /// non-2xx is error; refused/timeout/network failures are unknown.
    pub async fn probe(&self, port: u16, request_timeout: Duration) -> HealthStatus {
        let url = format!("http://127.0.0.1:{}/health", port);
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .timeout(request_timeout)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(_) => return HealthStatus::Unknown,
        };

        if !response.status().is_success() {
            return HealthStatus::Error;
        }

        let body = match response.text().await {
            Ok(b) => b,
            Err(_) => return HealthStatus::Unknown,
        };

        match serde_json::from_str::<HealthBody>(&body) {
            Ok(HealthBody { status: Some(s) }) => match s.as_str() {
                "ok" => HealthStatus::Ok,
                "loading" => HealthStatus::Loading,
                "error" => HealthStatus::Error,
                _ => HealthStatus::Unknown,
            },
            // 200 with non-JSON (or statusless JSON) body: the server answered
            _ => HealthStatus::Ok,
        }
    }

    /// Poll `/health` with exponential backoff (100 ms, ×1.5, capped at
    /// 2 s) until it reports ok. Anything else keeps polling until
    /// `total_timeout` has elapsed.
    pub async fn wait_ready(&self, port: u16, total_timeout: Duration) -> AgentResult<()> {
        self.wait_ready_with(port, total_timeout, INITIAL_POLL_DELAY, MAX_POLL_DELAY)
            .await
    }

    pub async fn wait_ready_with(
        &self,
        port: u16,
        total_timeout: Duration,
        initial_delay: Duration,
        max_delay: Duration,
    ) -> AgentResult<()> {
        let started = tokio::time::Instant::now();
        let mut delay = initial_delay;
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            if self.probe(port, DEFAULT_REQUEST_TIMEOUT).await == HealthStatus::Ok {
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= total_timeout {
                return Err(ServerFault::HealthTimeout { port, attempts }.into());
            }
            let remaining = total_timeout - elapsed;
            tokio::time::sleep(delay.min(remaining)).await;
            delay = Duration::from_secs_f64((delay.as_secs_f64() * BACKOFF_FACTOR).min(max_delay.as_secs_f64()));
        }
    }

    /// Single boolean probe, used for port-in-use detection: anything that
    /// answers HTTP on the port counts as responding.
    pub async fn is_responding(&self, port: u16, timeout: Duration) -> bool {
        self.probe(port, timeout).await != HealthStatus::Unknown
    }
}
