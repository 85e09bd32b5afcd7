//! Core Web Vitals export pipeline: plan, fetch, normalize, write, log.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use chrono_tz::Tz;
use cwv_core::{
    ExecutionRecord, ExecutionSummary, FormFactor, NormalizedRow, PipelineError, RequestDescriptor,
    DEFAULT_DATA_TAB,
};
use cwv_normalize::ZonedClock;
use cwv_storage::{CruxHttpClient, HttpClientConfig, MetricsClient, TableStore, WorkbookStore, DEFAULT_ENDPOINT};
use rand::Rng;
use serde::Deserialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, Instrument};

pub mod fetch;
pub mod guard;
pub mod normalize;
pub mod planner;
pub mod report;
pub mod sink;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use fetch::FetchedPayload;
pub use guard::RunGuard;
pub use report::history_markdown;

pub const CRATE_NAME: &str = "cwv-sync";

/// Guard token used by one-shot invocations.
pub const ONE_SHOT_TOKEN: &str = "one-shot";

#[derive(Debug, Clone)]
pub struct CwvConfig {
    pub urls: Vec<String>,
    pub form_factors: Vec<String>,
    pub spreadsheet_id: String,
    pub api_key: String,
    pub sheet_tab_name: String,
    pub endpoint: String,
    pub request_delay: Duration,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub timezone: String,
    pub data_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl Default for CwvConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            form_factors: FormFactor::ALL.iter().map(|ff| ff.as_str().to_string()).collect(),
            spreadsheet_id: String::new(),
            api_key: String::new(),
            sheet_tab_name: DEFAULT_DATA_TAB.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            request_delay: Duration::from_millis(400),
            http_timeout_secs: 30,
            user_agent: "cwv-export/0.1".to_string(),
            timezone: "UTC".to_string(),
            data_dir: PathBuf::from("./data"),
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
        }
    }
}

/// YAML overlay; every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub urls: Option<Vec<String>>,
    pub form_factors: Option<Vec<String>>,
    pub spreadsheet_id: Option<String>,
    pub api_key: Option<String>,
    pub sheet_tab_name: Option<String>,
    pub endpoint: Option<String>,
    pub request_delay_ms: Option<u64>,
    pub http_timeout_secs: Option<u64>,
    pub user_agent: Option<String>,
    pub timezone: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub scheduler_enabled: Option<bool>,
    pub sync_cron: Option<String>,
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_flag(key: &str, value: &str) -> Result<bool, PipelineError> {
    match value.trim() {
        "1" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "false" | "FALSE" | "False" => Ok(false),
        other => Err(PipelineError::Configuration(format!(
            "{key} must be a boolean, got {other:?}"
        ))),
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64, PipelineError> {
    value.trim().parse().map_err(|err| {
        PipelineError::Configuration(format!(
            "{key} must be a non-negative integer, got {value:?}: {err}"
        ))
    })
}

impl CwvConfig {
    /// Load the YAML file named by `CWV_CONFIG` (or `./cwv.yaml` when present),
    /// then apply environment overrides.
    pub fn load() -> Result<Self, PipelineError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Same as [`CwvConfig::load`] with variables read through `lookup`.
    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PipelineError> {
        let mut config = Self::default();
        let path = lookup("CWV_CONFIG")
            .map(PathBuf::from)
            .or_else(|| Some(PathBuf::from("cwv.yaml")).filter(|p| p.exists()));
        if let Some(path) = path {
            config.apply_file(read_config_file(&path)?);
        }
        config.apply_env(lookup)?;
        Ok(config)
    }

    pub fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.urls {
            self.urls = v;
        }
        if let Some(v) = file.form_factors {
            self.form_factors = v;
        }
        if let Some(v) = file.spreadsheet_id {
            self.spreadsheet_id = v;
        }
        if let Some(v) = file.api_key {
            self.api_key = v;
        }
        if let Some(v) = file.sheet_tab_name {
            self.sheet_tab_name = v;
        }
        if let Some(v) = file.endpoint {
            self.endpoint = v;
        }
        if let Some(v) = file.request_delay_ms {
            self.request_delay = Duration::from_millis(v);
        }
        if let Some(v) = file.http_timeout_secs {
            self.http_timeout_secs = v;
        }
        if let Some(v) = file.user_agent {
            self.user_agent = v;
        }
        if let Some(v) = file.timezone {
            self.timezone = v;
        }
        if let Some(v) = file.data_dir {
            self.data_dir = v;
        }
        if let Some(v) = file.scheduler_enabled {
            self.scheduler_enabled = v;
        }
        if let Some(v) = file.sync_cron {
            self.sync_cron = v;
        }
    }

    /// Override fields from `CWV_*` variables. Unparseable numbers and flags
    /// are configuration errors.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), PipelineError> {
        if let Some(v) = lookup("CWV_URLS") {
            self.urls = split_list(&v);
        }
        if let Some(v) = lookup("CWV_FORM_FACTORS") {
            self.form_factors = split_list(&v);
        }
        if let Some(v) = lookup("CWV_SPREADSHEET_ID") {
            self.spreadsheet_id = v;
        }
        if let Some(v) = lookup("CWV_API_KEY") {
            self.api_key = v;
        }
        if let Some(v) = lookup("CWV_SHEET_TAB") {
            self.sheet_tab_name = v;
        }
        if let Some(v) = lookup("CWV_ENDPOINT") {
            self.endpoint = v;
        }
        if let Some(v) = lookup("CWV_REQUEST_DELAY_MS") {
            self.request_delay = Duration::from_millis(parse_number("CWV_REQUEST_DELAY_MS", &v)?);
        }
        if let Some(v) = lookup("CWV_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = parse_number("CWV_HTTP_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("CWV_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = lookup("CWV_TIMEZONE") {
            self.timezone = v;
        }
        if let Some(v) = lookup("CWV_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CWV_SCHEDULER_ENABLED") {
            self.scheduler_enabled = parse_flag("CWV_SCHEDULER_ENABLED", &v)?;
        }
        if let Some(v) = lookup("CWV_SYNC_CRON") {
            self.sync_cron = v;
        }
        Ok(())
    }

    /// Reject unusable configuration before any I/O. Returns the parsed time zone.
    pub fn validate(&self) -> Result<Tz, PipelineError> {
        let invalid = |msg: String| Err(PipelineError::Configuration(msg));
        if self.urls.is_empty() {
            return invalid("urls must not be empty".to_string());
        }
        if self.form_factors.is_empty() {
            return invalid("form factors must not be empty".to_string());
        }
        if self.spreadsheet_id.trim().is_empty() {
            return invalid("spreadsheet id is required".to_string());
        }
        if self.api_key.trim().is_empty() {
            return invalid("api key is required".to_string());
        }
        if self.sheet_tab_name.trim().is_empty() {
            return invalid("sheet tab name must not be blank".to_string());
        }
        if self.http_timeout_secs == 0 {
            return invalid("http timeout must be at least one second".to_string());
        }
        if let Err(err) = url::Url::parse(&self.endpoint) {
            return invalid(format!("endpoint {} is not a valid url: {err}", self.endpoint));
        }
        self.timezone
            .parse::<Tz>()
            .map_err(|err| PipelineError::Configuration(format!("unknown time zone {}: {err}", self.timezone)))
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile, PipelineError> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| PipelineError::Configuration(format!("reading {}: {err}", path.display())))?;
    serde_yaml::from_str(&text)
        .map_err(|err| PipelineError::Configuration(format!("parsing {}: {err}", path.display())))
}

/// Pipeline state machine. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Planning,
    Fetching,
    Normalizing,
    Writing,
    Logging,
    Done,
    Failed,
}

/// `EXEC_<yyyyMMddHHmmss>_<0..10000>`, stamped in the configured zone.
pub fn new_execution_id(clock: &ZonedClock) -> String {
    let stamp = clock.now_utc().with_timezone(&clock.tz()).format("%Y%m%d%H%M%S");
    let suffix: u32 = rand::thread_rng().gen_range(0..10_000);
    format!("EXEC_{stamp}_{suffix}")
}

pub struct Pipeline {
    config: CwvConfig,
    client: Arc<dyn MetricsClient>,
    store: Arc<dyn TableStore>,
    clock: ZonedClock,
}

impl Pipeline {
    /// Build against the live API and the workbook store under `config.data_dir`.
    pub fn new(config: CwvConfig) -> Result<Self, PipelineError> {
        let tz = config.validate()?;
        let client = CruxHttpClient::new(HttpClientConfig {
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })
        .map_err(|err| PipelineError::Configuration(format!("{err:#}")))?;
        let store = WorkbookStore::new(config.data_dir.clone());
        Ok(Self {
            config,
            client: Arc::new(client),
            store: Arc::new(store),
            clock: ZonedClock::system(tz),
        })
    }

    pub fn with_collaborators(
        config: CwvConfig,
        client: Arc<dyn MetricsClient>,
        store: Arc<dyn TableStore>,
        clock: ZonedClock,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config,
            client,
            store,
            clock,
        })
    }

    pub fn config(&self) -> &CwvConfig {
        &self.config
    }

    pub fn start_run(&self) -> PipelineRun<'_> {
        PipelineRun {
            pipeline: self,
            execution_id: new_execution_id(&self.clock),
            stage: RunStage::Planning,
            descriptors: None,
            payloads: None,
            rows: None,
            rows_written: 0,
            records: Vec::new(),
        }
    }

    /// Run all stages once. On failure the audit records gathered so far are
    /// flushed before the original error is returned.
    pub async fn run_once(&self) -> Result<ExecutionSummary, PipelineError> {
        let mut run = self.start_run();
        let span = info_span!("run", execution_id = %run.execution_id);
        async move {
            info!("starting run");
            match run.drive().await {
                Ok(summary) => {
                    run.advance(RunStage::Logging);
                    run.flush_audit().await;
                    run.advance(RunStage::Done);
                    info!(
                        total = summary.total_requests,
                        succeeded = summary.successful_responses,
                        rows = summary.rows_written,
                        failed = summary.failed_requests,
                        "run complete"
                    );
                    Ok(summary)
                }
                Err(err) => {
                    error!(stage = ?run.stage, error = %err, "run aborted");
                    run.advance(RunStage::Failed);
                    run.flush_audit().await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// State carried between the stages of one execution.
pub struct PipelineRun<'p> {
    pipeline: &'p Pipeline,
    execution_id: String,
    stage: RunStage,
    descriptors: Option<Vec<RequestDescriptor>>,
    payloads: Option<Vec<FetchedPayload>>,
    rows: Option<Vec<NormalizedRow>>,
    rows_written: usize,
    records: Vec<ExecutionRecord>,
}

impl PipelineRun<'_> {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn stage(&self) -> RunStage {
        self.stage
    }

    pub fn records(&self) -> &[ExecutionRecord] {
        &self.records
    }

    fn advance(&mut self, next: RunStage) {
        info!(from = ?self.stage, to = ?next, "stage transition");
        self.stage = next;
    }

    async fn drive(&mut self) -> Result<ExecutionSummary, PipelineError> {
        self.plan()?;
        self.fetch().await?;
        self.normalize()?;
        self.write().await?;
        self.summary()
    }

    pub fn plan(&mut self) -> Result<usize, PipelineError> {
        let config = &self.pipeline.config;
        let descriptors = planner::plan_requests(&config.urls, &config.form_factors)?;
        let count = descriptors.len();
        self.descriptors = Some(descriptors);
        Ok(count)
    }

    pub async fn fetch(&mut self) -> Result<usize, PipelineError> {
        if self.descriptors.is_none() {
            return Err(PipelineError::Sequence {
                stage: "fetch",
                missing: "a request plan",
            });
        }
        self.advance(RunStage::Fetching);
        let descriptors = self.descriptors.as_deref().unwrap_or_default();
        let pipeline = self.pipeline;
        let payloads = fetch::fetch_all(
            pipeline.client.as_ref(),
            &self.execution_id,
            descriptors,
            pipeline.config.request_delay,
            &pipeline.clock,
            &mut self.records,
        )
        .await?;
        let count = payloads.len();
        self.payloads = Some(payloads);
        Ok(count)
    }

    pub fn normalize(&mut self) -> Result<usize, PipelineError> {
        if self.payloads.is_none() {
            return Err(PipelineError::Sequence {
                stage: "normalize",
                missing: "fetched payloads",
            });
        }
        self.advance(RunStage::Normalizing);
        let payloads = self.payloads.as_deref().unwrap_or_default();
        let date = self.pipeline.clock.date();
        let rows = normalize::normalize_all(payloads, &mut self.records, &date)?;
        let count = rows.len();
        self.rows = Some(rows);
        Ok(count)
    }

    pub async fn write(&mut self) -> Result<usize, PipelineError> {
        if self.rows.is_none() {
            return Err(PipelineError::Sequence {
                stage: "write",
                missing: "normalized rows",
            });
        }
        self.advance(RunStage::Writing);
        let rows = self.rows.as_deref().unwrap_or_default();
        let config = &self.pipeline.config;
        let written = sink::write_rows(
            self.pipeline.store.as_ref(),
            &config.spreadsheet_id,
            &config.sheet_tab_name,
            rows,
        )
        .await
        .map_err(PipelineError::Sink)?;
        self.rows_written = written;
        Ok(written)
    }

    fn summary(&self) -> Result<ExecutionSummary, PipelineError> {
        let (Some(descriptors), Some(payloads)) = (&self.descriptors, &self.payloads) else {
            return Err(PipelineError::Sequence {
                stage: "summary",
                missing: "a completed fetch",
            });
        };
        Ok(ExecutionSummary::new(
            self.execution_id.clone(),
            descriptors.len(),
            payloads.len(),
            self.rows_written,
        ))
    }

    /// Best effort: failures are logged and swallowed.
    pub async fn flush_audit(&mut self) {
        let pipeline = self.pipeline;
        if let Err(err) = sink::flush_audit(
            pipeline.store.as_ref(),
            &pipeline.config.spreadsheet_id,
            &self.records,
            &pipeline.clock,
        )
        .await
        {
            error!(error = %format!("{err:#}"), records = self.records.len(), "audit flush failed");
        }
    }
}

/// Claim `token` on `guard`, then build and run the pipeline for `config`.
pub async fn run_once_with_config(
    config: CwvConfig,
    guard: &RunGuard,
    token: &str,
) -> Result<ExecutionSummary, PipelineError> {
    guard.claim(token).await?;
    let pipeline = Pipeline::new(config)?;
    pipeline.run_once().await
}

/// Process entry point: load configuration and run the pipeline once.
pub async fn run_once_from_env(guard: &RunGuard) -> Result<ExecutionSummary, PipelineError> {
    let config = CwvConfig::load()?;
    run_once_with_config(config, guard, ONE_SHOT_TOKEN).await
}

/// Cron scheduler running the pipeline once per fire, or `None` when disabled.
///
/// Each fire claims a per-minute token, so a duplicated trigger for the same
/// fire is refused while later fires run normally.
pub async fn maybe_build_scheduler(config: &CwvConfig, guard: &RunGuard) -> anyhow::Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let shared = Arc::new(config.clone());
    let guard = guard.clone();
    let job = Job::new_async(config.sync_cron.as_str(), move |_uuid, _lock| {
        let config = Arc::clone(&shared);
        let guard = guard.clone();
        Box::pin(async move {
            let token = format!("cron:{}", Utc::now().format("%Y-%m-%dT%H:%M"));
            match run_once_with_config((*config).clone(), &guard, &token).await {
                Ok(summary) => info!(
                    execution_id = %summary.execution_id,
                    rows = summary.rows_written,
                    "scheduled run complete"
                ),
                Err(err) => error!(error = %err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.sync_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
