use crate::error::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Parse a duration literal: Go-style unit strings (`"500ms"`, `"30s"`,
/// `"1h30m"`) or a bare integer interpreted as seconds.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        let secs: u64 = s.parse().map_err(|e| format!("invalid duration {s:?}: {e}"))?;
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| format!("invalid duration {s:?}: {e}"))
}

/// Serde adapter for duration fields that accept either a string literal or
/// a bare integer number of seconds.
pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    impl Raw {
        fn into_duration<E: serde::de::Error>(self) -> Result<Duration, E> {
            match self {
                Raw::Seconds(n) => Ok(Duration::from_secs(n)),
                Raw::Text(s) => super::parse_duration(&s).map_err(serde::de::Error::custom),
            }
        }
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Raw::deserialize(d)?.into_duration()
    }

    pub mod option {
        use super::Raw;
        use serde::{Deserialize, Deserializer};
        use std::time::Duration;

        pub fn deserialize<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<Raw>::deserialize(d)? {
                Some(raw) => raw.into_duration().map(Some),
                None => Ok(None),
            }
        }
    }
}

/// Load-shaping strategy tag. The kebab-case form is the wire name used in
/// configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorKind {
    ConstantVus,
    RampingVus,
    ConstantArrivalRate,
    RampingArrivalRate,
    SharedIterations,
    PerVuIterations,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::ConstantVus => "constant-vus",
            ExecutorKind::RampingVus => "ramping-vus",
            ExecutorKind::ConstantArrivalRate => "constant-arrival-rate",
            ExecutorKind::RampingArrivalRate => "ramping-arrival-rate",
            ExecutorKind::SharedIterations => "shared-iterations",
            ExecutorKind::PerVuIterations => "per-vu-iterations",
        }
    }

    /// True for the open-model executors, which schedule one-shot iterations
    /// against a VU pool instead of long-lived VU loops.
    pub fn is_open_model(&self) -> bool {
        matches!(
            self,
            ExecutorKind::ConstantArrivalRate | ExecutorKind::RampingArrivalRate
        )
    }
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn to_method(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
        }
    }
}

/// Where an extract directive reads its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractSource {
    Body,
    Header,
    Status,
}

/// Binds a response value into the virtual user's variable scope.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractConfig {
    pub name: String,
    pub source: ExtractSource,
    /// Header name for `source = header`. Accepted and ignored for `body`,
    /// which captures the full response text.
    #[serde(default)]
    pub path: String,
    /// Optional refinement: first capture group if present, else the whole
    /// match. No match means nothing is stored.
    #[serde(default)]
    pub regex: Option<String>,
}

/// One templated request in a scenario's sequence.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default, with = "duration_str::option")]
    pub timeout: Option<Duration>,
    #[serde(default, with = "duration_str::option")]
    pub think_time: Option<Duration>,
    #[serde(default)]
    pub extract: Vec<ExtractConfig>,
}

/// A (duration, target) pair in a ramping executor. `target` is a VU count
/// for ramping-vus and an arrival rate for ramping-arrival-rate.
#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    #[serde(with = "duration_str")]
    pub duration: Duration,
    pub target: f64,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacingKind {
    #[default]
    None,
    Constant,
    Random,
}

/// Delay applied between iterations of a long-lived VU loop.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PacingConfig {
    #[serde(default, rename = "type")]
    pub kind: PacingKind,
    #[serde(default, with = "duration_str::option")]
    pub duration: Option<Duration>,
    #[serde(default, with = "duration_str::option")]
    pub min: Option<Duration>,
    #[serde(default, with = "duration_str::option")]
    pub max: Option<Duration>,
}

impl PacingConfig {
    /// Draw the delay before the next iteration. Zero means no pacing.
    pub fn delay(&self) -> Duration {
        match self.kind {
            PacingKind::None => Duration::ZERO,
            PacingKind::Constant => self.duration.unwrap_or(Duration::ZERO),
            PacingKind::Random => {
                let min = self.min.unwrap_or(Duration::ZERO).as_micros() as u64;
                let max = self.max.unwrap_or(Duration::ZERO).as_micros() as u64;
                if max <= min {
                    return Duration::from_micros(min);
                }
                let us = rand::rng().random_range(min..=max);
                Duration::from_micros(us)
            }
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match self.kind {
            PacingKind::None => Ok(()),
            PacingKind::Constant => match self.duration {
                Some(_) => Ok(()),
                None => Err("constant pacing requires a duration".to_string()),
            },
            PacingKind::Random => match (self.min, self.max) {
                (Some(min), Some(max)) if min <= max => Ok(()),
                (Some(_), Some(_)) => Err("random pacing requires min <= max".to_string()),
                _ => Err("random pacing requires min and max".to_string()),
            },
        }
    }
}

/// Named load profile: variables, an ordered request sequence, and an
/// executor configuration. Immutable once the engine starts.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioConfig {
    #[serde(default = "default_executor")]
    pub executor: ExecutorKind,
    #[serde(default = "default_vus")]
    pub vus: u32,
    #[serde(default = "default_duration", with = "duration_str")]
    pub duration: Duration,
    #[serde(default)]
    pub rate: f64,
    #[serde(default)]
    pub pre_allocated_vus: u32,
    #[serde(default)]
    pub max_vus: u32,
    /// Iteration quota for the shared-iterations and per-vu-iterations
    /// executors.
    #[serde(default)]
    pub iterations: u64,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    pub requests: Vec<RequestConfig>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default = "default_graceful_stop", with = "duration_str")]
    pub graceful_stop: Duration,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            executor: default_executor(),
            vus: default_vus(),
            duration: default_duration(),
            rate: 0.0,
            pre_allocated_vus: 0,
            max_vus: 0,
            iterations: 0,
            stages: Vec::new(),
            requests: Vec::new(),
            variables: HashMap::new(),
            graceful_stop: default_graceful_stop(),
            pacing: PacingConfig::default(),
            tags: HashMap::new(),
        }
    }
}

impl ScenarioConfig {
    /// Wall-clock length of the load shape: the stage sum for ramping
    /// executors, the configured duration otherwise.
    pub fn total_duration(&self) -> Duration {
        match self.executor {
            ExecutorKind::RampingVus | ExecutorKind::RampingArrivalRate => {
                self.stages.iter().map(|s| s.duration).sum()
            }
            _ => self.duration,
        }
    }

    fn validate(&mut self, name: &str) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(format!("scenario {name:?}: {msg}")));

        if self.requests.is_empty() {
            return fail("at least one request is required".to_string());
        }
        for req in &self.requests {
            if req.url.is_empty() {
                return fail(format!("request {:?} has an empty URL", req.name));
            }
            for ex in &req.extract {
                if ex.name.is_empty() {
                    return fail(format!("request {:?}: extract with empty name", req.name));
                }
                if ex.source == ExtractSource::Header && ex.path.is_empty() {
                    return fail(format!(
                        "request {:?}: header extract {:?} needs a path",
                        req.name, ex.name
                    ));
                }
                if let Some(re) = &ex.regex
                    && regex_lite::Regex::new(re).is_err()
                {
                    return fail(format!(
                        "request {:?}: extract {:?} has an invalid regex",
                        req.name, ex.name
                    ));
                }
            }
        }
        if let Err(msg) = self.pacing.validate() {
            return fail(msg);
        }

        match self.executor {
            ExecutorKind::ConstantVus => {
                if self.vus == 0 {
                    return fail("constant-vus requires vus >= 1".to_string());
                }
                if self.duration.is_zero() {
                    return fail("constant-vus requires a non-zero duration".to_string());
                }
            }
            ExecutorKind::RampingVus => {
                if self.stages.is_empty() {
                    return fail("ramping-vus requires at least one stage".to_string());
                }
                self.validate_stages(name)?;
            }
            ExecutorKind::ConstantArrivalRate => {
                if self.rate <= 0.0 {
                    return fail("constant-arrival-rate requires rate > 0".to_string());
                }
                if self.duration.is_zero() {
                    return fail("constant-arrival-rate requires a non-zero duration".to_string());
                }
                self.apply_pool_defaults();
            }
            ExecutorKind::RampingArrivalRate => {
                if self.stages.is_empty() {
                    return fail("ramping-arrival-rate requires at least one stage".to_string());
                }
                self.validate_stages(name)?;
                self.apply_pool_defaults();
            }
            ExecutorKind::SharedIterations | ExecutorKind::PerVuIterations => {
                if self.vus == 0 {
                    return fail(format!("{} requires vus >= 1", self.executor));
                }
                if self.iterations == 0 {
                    return fail(format!("{} requires iterations >= 1", self.executor));
                }
                if self.duration.is_zero() {
                    return fail(format!("{} requires a non-zero max duration", self.executor));
                }
            }
        }
        Ok(())
    }

    fn validate_stages(&self, name: &str) -> Result<()> {
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.duration.is_zero() {
                return Err(Error::Config(format!(
                    "scenario {name:?}: stage {i} has a zero duration"
                )));
            }
            if stage.target < 0.0 || !stage.target.is_finite() {
                return Err(Error::Config(format!(
                    "scenario {name:?}: stage {i} has an invalid target"
                )));
            }
        }
        Ok(())
    }

    /// Open-model defaults: preAllocatedVUs >= 1, maxVUs >= preAllocatedVUs.
    fn apply_pool_defaults(&mut self) {
        if self.pre_allocated_vus == 0 {
            self.pre_allocated_vus = 1;
        }
        if self.max_vus < self.pre_allocated_vus {
            self.max_vus = self.pre_allocated_vus;
        }
    }
}

/// Process-wide settings shared by every scenario, including the HTTP client
/// configuration handed to each scheduler.
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalSettings {
    #[serde(default)]
    pub base_url: String,
    /// Default per-request timeout; overridable per request.
    #[serde(default = "default_timeout", with = "duration_str")]
    pub timeout: Duration,
    /// 0 = unbounded.
    #[serde(default)]
    pub max_conns_per_host: u32,
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_conns_per_host: u32,
    #[serde(default = "default_idle_conn_timeout", with = "duration_str")]
    pub idle_conn_timeout: Duration,
    #[serde(default)]
    pub disable_keep_alive: bool,
    #[serde(default)]
    pub disable_compression: bool,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Applied to every request; per-request headers override by name.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// One transport shared by all VUs of a scheduler (the default), or a
    /// fresh client per VU for isolation experiments.
    #[serde(default = "default_true")]
    pub use_shared_client: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout: default_timeout(),
            max_conns_per_host: 0,
            max_idle_conns_per_host: default_max_idle_per_host(),
            idle_conn_timeout: default_idle_conn_timeout(),
            disable_keep_alive: false,
            disable_compression: false,
            insecure_skip_verify: false,
            user_agent: None,
            headers: HashMap::new(),
            use_shared_client: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ExecutionOptions {
    /// Run scenarios one after another instead of concurrently.
    #[serde(default)]
    pub sequential: bool,
}

/// Root configuration record, typically produced by a file-format
/// collaborator and handed to [`crate::Engine::new`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub settings: GlobalSettings,
    /// Global variables, merged into every scenario's map (scenario wins).
    #[serde(default)]
    pub variables: HashMap<String, String>,
    /// Ordered by name so multi-scenario runs are deterministic.
    #[serde(default)]
    pub scenarios: BTreeMap<String, ScenarioConfig>,
    /// Metric family -> threshold expressions, e.g.
    /// `"http_req_duration" -> ["p95 < 500ms"]`.
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub options: ExecutionOptions,
}

impl TestConfig {
    /// Validate and normalise the configuration in place: executor-specific
    /// rules, open-model pool defaults, global-variable merge, and threshold
    /// expression shape.
    pub fn validate(&mut self) -> Result<()> {
        if self.scenarios.is_empty() {
            return Err(Error::Config("at least one scenario is required".to_string()));
        }
        let globals = self.variables.clone();
        for (name, scenario) in &mut self.scenarios {
            scenario.validate(name)?;
            for (k, v) in &globals {
                scenario
                    .variables
                    .entry(k.clone())
                    .or_insert_with(|| v.clone());
            }
        }
        for (family, exprs) in &self.thresholds {
            for expr in exprs {
                crate::engine::thresholds::parse_expression(expr).map_err(|msg| {
                    Error::Config(format!("threshold {family:?} {expr:?}: {msg}"))
                })?;
            }
        }
        Ok(())
    }
}

fn default_executor() -> ExecutorKind {
    ExecutorKind::ConstantVus
}

fn default_vus() -> u32 {
    1
}

fn default_duration() -> Duration {
    Duration::from_secs(30)
}

fn default_graceful_stop() -> Duration {
    Duration::from_secs(30)
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_idle_per_host() -> u32 {
    100
}

fn default_idle_conn_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn parse_duration_accepts_unit_strings() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
    }

    #[test]
    fn parse_duration_bare_integer_is_seconds() {
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("-3s").is_err());
    }

    #[test]
    fn scenario_deserializes_with_defaults() {
        let sc: ScenarioConfig = serde_json::from_str(
            r#"{"requests": [{"url": "http://localhost/"}]}"#,
        )
        .unwrap();
        assert_eq!(sc.executor, ExecutorKind::ConstantVus);
        assert_eq!(sc.vus, 1);
        assert_eq!(sc.duration, Duration::from_secs(30));
        assert_eq!(sc.graceful_stop, Duration::from_secs(30));
    }

    #[test]
    fn executor_tags_use_kebab_case() {
        let sc: ScenarioConfig = serde_json::from_str(
            r#"{"executor": "ramping-arrival-rate",
                "stages": [{"duration": "10s", "target": 50}],
                "requests": [{"url": "/"}]}"#,
        )
        .unwrap();
        assert_eq!(sc.executor, ExecutorKind::RampingArrivalRate);
        assert_eq!(sc.stages[0].duration, Duration::from_secs(10));
    }

    #[test]
    fn duration_fields_accept_bare_integers() {
        let sc: ScenarioConfig = serde_json::from_str(
            r#"{"duration": 5, "requests": [{"url": "/"}]}"#,
        )
        .unwrap();
        assert_eq!(sc.duration, Duration::from_secs(5));
    }

    fn one_request() -> Vec<RequestConfig> {
        vec![RequestConfig {
            name: "get".to_string(),
            url: "http://localhost/".to_string(),
            ..Default::default()
        }]
    }

    fn config_with(scenario: ScenarioConfig) -> TestConfig {
        let mut cfg = TestConfig::default();
        cfg.scenarios.insert("main".to_string(), scenario);
        cfg
    }

    #[test]
    fn validate_rejects_empty_scenario_map() {
        let mut cfg = TestConfig::default();
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_scenario_without_requests() {
        let mut cfg = config_with(ScenarioConfig::default());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_rate_open_model() {
        let mut cfg = config_with(ScenarioConfig {
            executor: ExecutorKind::ConstantArrivalRate,
            requests: one_request(),
            ..Default::default()
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_applies_open_model_pool_defaults() {
        let mut cfg = config_with(ScenarioConfig {
            executor: ExecutorKind::ConstantArrivalRate,
            rate: 10.0,
            pre_allocated_vus: 5,
            max_vus: 2,
            requests: one_request(),
            ..Default::default()
        });
        cfg.validate().unwrap();
        let sc = &cfg.scenarios["main"];
        assert_eq!(sc.pre_allocated_vus, 5);
        assert_eq!(sc.max_vus, 5);
    }

    #[test]
    fn validate_merges_global_variables_scenario_wins() {
        let mut cfg = config_with(ScenarioConfig {
            requests: one_request(),
            variables: HashMap::from([("env".to_string(), "staging".to_string())]),
            ..Default::default()
        });
        cfg.variables
            .insert("env".to_string(), "prod".to_string());
        cfg.variables
            .insert("region".to_string(), "eu".to_string());
        cfg.validate().unwrap();
        let vars = &cfg.scenarios["main"].variables;
        assert_eq!(vars["env"], "staging");
        assert_eq!(vars["region"], "eu");
    }

    #[test]
    fn validate_rejects_malformed_threshold() {
        let mut cfg = config_with(ScenarioConfig {
            requests: one_request(),
            ..Default::default()
        });
        cfg.thresholds
            .insert("http_req_duration".to_string(), vec!["p95 !! 1s".to_string()]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_pacing() {
        let mut cfg = config_with(ScenarioConfig {
            requests: one_request(),
            pacing: PacingConfig {
                kind: PacingKind::Random,
                min: Some(Duration::from_millis(100)),
                max: Some(Duration::from_millis(10)),
                ..Default::default()
            },
            ..Default::default()
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn random_pacing_draws_within_bounds() {
        let pacing = PacingConfig {
            kind: PacingKind::Random,
            min: Some(Duration::from_millis(10)),
            max: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        for _ in 0..50 {
            let d = pacing.delay();
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
        }
    }

    #[test]
    fn rng_range_sanity() {
        // random_range with an inclusive range never exceeds its bounds.
        let v: u64 = rand::rng().random_range(1..=1);
        assert_eq!(v, 1);
    }

    #[test]
    fn ramping_total_duration_sums_stages() {
        let sc = ScenarioConfig {
            executor: ExecutorKind::RampingVus,
            stages: vec![
                StageConfig {
                    duration: Duration::from_secs(1),
                    target: 2.0,
                    name: None,
                },
                StageConfig {
                    duration: Duration::from_secs(2),
                    target: 2.0,
                    name: None,
                },
            ],
            requests: one_request(),
            ..Default::default()
        };
        assert_eq!(sc.total_duration(), Duration::from_secs(3));
    }
}
