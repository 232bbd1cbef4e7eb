use crate::config::{GlobalSettings, RequestConfig, ScenarioConfig};
use crate::engine::metrics::MetricsEngine;
use crate::error::{Error, Result};
use crate::http::collect_headers;
use crate::template;
use crate::types::VuState;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How a single request step ended, short of a context cancellation.
enum StepOutcome {
    Completed,
    /// The VU's stop signal fired mid-step; the iteration aborts gracefully.
    Stopped,
}

struct ResponseData {
    status: u16,
    headers: HashMap<String, String>,
    body: String,
    bytes: u64,
}

/// One unit of sequential request execution.
///
/// A virtual user owns its iteration counter, a private variable scope that
/// overrides scenario variables during template resolution, and its stop and
/// done signals. State transitions are monotone along Idle↔Running →
/// Stopping → Stopped and happen only via compare-and-swap.
pub struct VirtualUser {
    id: u64,
    scenario: Arc<ScenarioConfig>,
    settings: Arc<GlobalSettings>,
    client: Client,
    metrics: Arc<MetricsEngine>,
    state: AtomicU8,
    iterations: AtomicU64,
    data: RwLock<HashMap<String, Value>>,
    stop: CancellationToken,
    done: CancellationToken,
}

impl VirtualUser {
    pub(crate) fn new(
        id: u64,
        scenario: Arc<ScenarioConfig>,
        settings: Arc<GlobalSettings>,
        client: Client,
        metrics: Arc<MetricsEngine>,
    ) -> Self {
        Self {
            id,
            scenario,
            settings,
            client,
            metrics,
            state: AtomicU8::new(VuState::Idle as u8),
            iterations: AtomicU64::new(0),
            data: RwLock::new(HashMap::new()),
            stop: CancellationToken::new(),
            done: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> VuState {
        VuState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::SeqCst)
    }

    /// Execute every request of the scenario in order.
    ///
    /// Returns `Err(Stopped)` when the VU was already stopping, `Ok(())` when
    /// the sequence completed or the stop signal aborted it mid-iteration
    /// (a graceful abort), and `Err(Cancelled)` when the context fired.
    pub async fn run_iteration(&self, ctx: &CancellationToken) -> Result<()> {
        if self
            .state
            .compare_exchange(
                VuState::Idle as u8,
                VuState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
            && self.state().is_stopping_or_stopped()
        {
            return Err(Error::Stopped);
        }
        self.iterations.fetch_add(1, Ordering::SeqCst);

        let last = self.scenario.requests.len().saturating_sub(1);
        for (i, request) in self.scenario.requests.iter().enumerate() {
            if ctx.is_cancelled() {
                self.leave_running();
                return Err(Error::Cancelled);
            }
            if self.stop.is_cancelled() {
                self.leave_running();
                return Ok(());
            }

            match self.execute_request(request, ctx).await {
                Ok(StepOutcome::Completed) => {}
                Ok(StepOutcome::Stopped) => {
                    self.leave_running();
                    return Ok(());
                }
                Err(err) => {
                    self.leave_running();
                    return Err(err);
                }
            }

            if i < last
                && let Some(think) = request.think_time
                && !think.is_zero()
            {
                tokio::select! {
                    _ = tokio::time::sleep(think) => {}
                    _ = ctx.cancelled() => {
                        self.leave_running();
                        return Err(Error::Cancelled);
                    }
                    _ = self.stop.cancelled() => {
                        self.leave_running();
                        return Ok(());
                    }
                }
            }
        }

        self.leave_running();
        Ok(())
    }

    /// Transition Idle/Running → Stopping and fire the stop signal.
    /// Idempotent; no effect once Stopping or Stopped.
    pub fn request_stop(&self) {
        loop {
            let current = self.state.load(Ordering::SeqCst);
            if VuState::from_u8(current).is_stopping_or_stopped() {
                return;
            }
            if self
                .state
                .compare_exchange(
                    current,
                    VuState::Stopping as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                self.stop.cancel();
                return;
            }
        }
    }

    /// Terminal transition; closes the done signal. Idempotent.
    pub fn mark_stopped(&self) {
        self.state.store(VuState::Stopped as u8, Ordering::SeqCst);
        self.stop.cancel();
        self.done.cancel();
    }

    /// Block until the done signal or the timeout. True when the VU reached
    /// Stopped within the deadline.
    pub async fn wait_for_stop(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.done.cancelled())
            .await
            .is_ok()
    }

    pub fn set_data(&self, key: &str, value: Value) {
        self.data.write().unwrap().insert(key.to_string(), value);
    }

    pub fn get_data(&self, key: &str) -> Option<Value> {
        self.data.read().unwrap().get(key).cloned()
    }

    pub fn clear_data(&self, key: &str) {
        self.data.write().unwrap().remove(key);
    }

    async fn execute_request(
        &self,
        request: &RequestConfig,
        ctx: &CancellationToken,
    ) -> Result<StepOutcome> {
        let (url, headers, body) = self.render(request);
        let started = Instant::now();

        tokio::select! {
            result = self.send_and_read(request, &url, &headers, body) => {
                let elapsed = started.elapsed();
                match result {
                    Ok(response) => {
                        // Transport succeeded; HTTP status decides success.
                        let success = response.status < 400;
                        self.metrics.record_latency(
                            elapsed,
                            &request.name,
                            success,
                            response.bytes,
                        );
                        if success {
                            self.apply_extracts(request, &response);
                        }
                    }
                    Err(err) => {
                        tracing::debug!(
                            vu = self.id,
                            request = %request.name,
                            error = %err,
                            "request failed"
                        );
                        self.metrics.record_latency(elapsed, &request.name, false, 0);
                    }
                }
                Ok(StepOutcome::Completed)
            }
            _ = ctx.cancelled() => {
                // The in-flight request is dropped; it still counts as a
                // failed sample.
                self.metrics.record_latency(started.elapsed(), &request.name, false, 0);
                Err(Error::Cancelled)
            }
            _ = self.stop.cancelled() => Ok(StepOutcome::Stopped),
        }
    }

    async fn send_and_read(
        &self,
        request: &RequestConfig,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<String>,
    ) -> reqwest::Result<ResponseData> {
        let mut builder = self.client.request(request.method.to_method(), url);
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        // Latency spans until the body is fully read.
        let bytes = response.bytes().await?;
        Ok(ResponseData {
            status,
            headers,
            body: String::from_utf8_lossy(&bytes).into_owned(),
            bytes: bytes.len() as u64,
        })
    }

    /// Resolve templates in URL, headers, and body. VU scope wins over
    /// scenario scope; global default headers apply under request headers.
    fn render(
        &self,
        request: &RequestConfig,
    ) -> (String, HashMap<String, String>, Option<String>) {
        let vars = self.data.read().unwrap();

        let mut url = template::resolve(&request.url, &vars, &self.scenario.variables);
        if !(url.starts_with("http://") || url.starts_with("https://"))
            && !self.settings.base_url.is_empty()
        {
            let base = self.settings.base_url.trim_end_matches('/');
            let path = url.trim_start_matches('/');
            url = format!("{base}/{path}");
        }

        let mut headers = HashMap::new();
        for (name, value) in &self.settings.headers {
            headers.insert(
                name.clone(),
                template::resolve(value, &vars, &self.scenario.variables),
            );
        }
        for (name, value) in &request.headers {
            headers.insert(
                name.clone(),
                template::resolve(value, &vars, &self.scenario.variables),
            );
        }

        let body = request
            .body
            .as_ref()
            .map(|b| template::resolve(b, &vars, &self.scenario.variables));

        (url, headers, body)
    }

    fn apply_extracts(&self, request: &RequestConfig, response: &ResponseData) {
        for extract in &request.extract {
            if let Some(value) = template::extract_value(
                extract,
                response.status,
                &response.headers,
                &response.body,
            ) {
                self.set_data(&extract.name, Value::String(value));
            }
        }
    }

    /// Running → Idle after an iteration; a concurrent Stopping is kept.
    fn leave_running(&self) {
        let _ = self.state.compare_exchange(
            VuState::Running as u8,
            VuState::Idle as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}
