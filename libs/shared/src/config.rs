use serde::{Deserialize, Serialize};

/// Service-wide settings, resolved once at startup.
///
/// Precedence: built-in defaults < optional `config.toml` < environment.
/// The flat field names double as the recognized environment variables
/// (`RESULTS_DIR`, `PG_DATABASE_DEV`, `BAKTA_API_URL_PROD`, ...).
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Deployment environment: `dev`, `test` or `prod`.
    pub environment: String,
    /// HTTP bind address and port.
    pub http_host: String,
    pub http_port: u16,
    /// Base directory for the embedded database files.
    pub data_dir: String,
    /// Where uploaded FASTA files land (`<upload_dir>/<job_id>_<name>`).
    pub upload_dir: String,
    /// Where result files are written (`<results_dir>/...`).
    pub results_dir: String,

    // Relational store identity. The embedded SQLite backend derives its
    // file name from the per-environment database name; host/user/password
    // are carried for server-based deployments.
    pub pg_host: String,
    pub pg_port: u16,
    pub pg_user: String,
    pub pg_password: String,
    pub pg_database_dev: String,
    pub pg_database_test: String,
    pub pg_database_prod: String,

    pub db_min_connections: u32,
    pub db_max_connections: u32,
    pub db_acquire_timeout_secs: u64,

    // Remote Bakta API, one base URL per deployment target.
    pub bakta_api_url_prod: String,
    pub bakta_api_url_staging: String,
    pub bakta_api_url_dev: String,
    pub bakta_api_url_local: String,
    pub bakta_api_key: String,

    /// Inference sidecar endpoint for AMR predictions.
    pub model_api_url: String,

    pub http_timeout_secs: u64,
    pub upload_timeout_secs: u64,
    pub idle_timeout_secs: u64,

    pub poll_interval_secs: u64,
    pub poll_deadline_secs: u64,

    /// Terminal jobs older than this are moved to the archive table.
    pub archive_after_days: i64,
    /// Archived jobs older than this are deleted outright.
    pub delete_after_days: i64,
    pub archive_sweep_interval_hours: u64,

    /// CPU-bound AMR worker cap; 0 means "number of cores".
    pub amr_workers: usize,
    /// I/O-bound Bakta poll/download worker cap.
    pub bakta_workers: usize,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("environment", &self.environment)
            .field("http_host", &self.http_host)
            .field("http_port", &self.http_port)
            .field("data_dir", &self.data_dir)
            .field("upload_dir", &self.upload_dir)
            .field("results_dir", &self.results_dir)
            .field("pg_host", &self.pg_host)
            .field("pg_port", &self.pg_port)
            .field("pg_user", &self.pg_user)
            .field("pg_password", if self.pg_password.is_empty() { &"" } else { &"***" })
            .field("database", &self.database_name())
            .field("bakta_api_url", &self.bakta_api_url())
            .field("bakta_api_key", if self.bakta_api_key.is_empty() { &"" } else { &"***" })
            .field("model_api_url", &self.model_api_url)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("poll_deadline_secs", &self.poll_deadline_secs)
            .field("archive_after_days", &self.archive_after_days)
            .field("delete_after_days", &self.delete_after_days)
            .finish()
    }
}

impl AppConfig {
    /// Loads defaults, then an optional `config.toml`, then the environment.
    pub fn load() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .set_default("environment", "dev")?
            .set_default("http_host", "0.0.0.0")?
            .set_default("http_port", 8000)?
            .set_default("data_dir", "./data")?
            .set_default("upload_dir", "./data/uploads")?
            .set_default("results_dir", "./data/results")?
            .set_default("pg_host", "localhost")?
            .set_default("pg_port", 5432)?
            .set_default("pg_user", "")?
            .set_default("pg_password", "")?
            .set_default("pg_database_dev", "amr_dev")?
            .set_default("pg_database_test", "amr_test")?
            .set_default("pg_database_prod", "amr_prod")?
            .set_default("db_min_connections", 1)?
            .set_default("db_max_connections", 5)?
            .set_default("db_acquire_timeout_secs", 30)?
            .set_default("bakta_api_url_prod", "https://api.bakta.computational.bio/api/v1")?
            .set_default("bakta_api_url_staging", "https://api.staging.bakta.computational.bio/api/v1")?
            .set_default("bakta_api_url_dev", "https://dev.api.bakta.computational.bio/api/v1")?
            .set_default("bakta_api_url_local", "http://localhost:8080/api/v1")?
            .set_default("bakta_api_key", "")?
            .set_default("model_api_url", "http://127.0.0.1:8001")?
            .set_default("http_timeout_secs", 30)?
            .set_default("upload_timeout_secs", 600)?
            .set_default("idle_timeout_secs", 60)?
            .set_default("poll_interval_secs", 30)?
            .set_default("poll_deadline_secs", 86_400)?
            .set_default("archive_after_days", 30)?
            .set_default("delete_after_days", 90)?
            .set_default("archive_sweep_interval_hours", 6)?
            .set_default("amr_workers", 0)?
            .set_default("bakta_workers", 8)?
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;

        settings.try_deserialize()
    }

    /// Database name for the active environment.
    pub fn database_name(&self) -> &str {
        match self.environment.as_str() {
            "prod" => &self.pg_database_prod,
            "test" => &self.pg_database_test,
            _ => &self.pg_database_dev,
        }
    }

    /// File path of the embedded database for the active environment.
    pub fn database_path(&self) -> String {
        format!("{}/{}.db", self.data_dir, self.database_name())
    }

    /// Bakta base URL for the active environment.
    pub fn bakta_api_url(&self) -> &str {
        match self.environment.as_str() {
            "prod" => &self.bakta_api_url_prod,
            "test" => &self.bakta_api_url_staging,
            _ if !self.bakta_api_url_dev.is_empty() => &self.bakta_api_url_dev,
            _ => &self.bakta_api_url_local,
        }
    }

    /// Effective CPU-bound worker count.
    pub fn effective_amr_workers(&self) -> usize {
        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        if self.amr_workers == 0 {
            cores
        } else {
            self.amr_workers.min(cores)
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        // load() only fails on malformed config files; fall back to pure
        // defaults so tests and tools never need a config.toml.
        Self::load().unwrap_or_else(|_| {
            AppConfig {
                environment: "dev".to_string(),
                http_host: "0.0.0.0".to_string(),
                http_port: 8000,
                data_dir: "./data".to_string(),
                upload_dir: "./data/uploads".to_string(),
                results_dir: "./data/results".to_string(),
                pg_host: "localhost".to_string(),
                pg_port: 5432,
                pg_user: String::new(),
                pg_password: String::new(),
                pg_database_dev: "amr_dev".to_string(),
                pg_database_test: "amr_test".to_string(),
                pg_database_prod: "amr_prod".to_string(),
                db_min_connections: 1,
                db_max_connections: 5,
                db_acquire_timeout_secs: 30,
                bakta_api_url_prod: "https://api.bakta.computational.bio/api/v1".to_string(),
                bakta_api_url_staging: "https://api.staging.bakta.computational.bio/api/v1".to_string(),
                bakta_api_url_dev: "https://dev.api.bakta.computational.bio/api/v1".to_string(),
                bakta_api_url_local: "http://localhost:8080/api/v1".to_string(),
                bakta_api_key: String::new(),
                model_api_url: "http://127.0.0.1:8001".to_string(),
                http_timeout_secs: 30,
                upload_timeout_secs: 600,
                idle_timeout_secs: 60,
                poll_interval_secs: 30,
                poll_deadline_secs: 86_400,
                archive_after_days: 30,
                delete_after_days: 90,
                archive_sweep_interval_hours: 6,
                amr_workers: 0,
                bakta_workers: 8,
            }
        })
    }
}

/// Parses one `BAKTA_CONFIG_<KEY>` override value: booleans as
/// `true/yes/1` | `false/no/0`, integers auto-detected, `none` as null,
/// anything else as a string.
pub fn parse_override_value(raw: &str) -> serde_json::Value {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => return serde_json::Value::Bool(true),
        "false" | "no" | "0" => return serde_json::Value::Bool(false),
        "none" => return serde_json::Value::Null,
        _ => {}
    }
    if let Ok(n) = raw.trim().parse::<i64>() {
        return serde_json::Value::Number(n.into());
    }
    serde_json::Value::String(raw.trim().to_string())
}

/// `COMPLETE_GENOME` -> `completeGenome`.
pub fn env_key_to_camel(key: &str) -> String {
    let mut out = String::new();
    for (i, part) in key.split('_').filter(|p| !p.is_empty()).enumerate() {
        let lower = part.to_ascii_lowercase();
        if i == 0 {
            out.push_str(&lower);
        } else {
            let mut chars = lower.chars();
            if let Some(first) = chars.next() {
                out.push(first.to_ascii_uppercase());
                out.push_str(chars.as_str());
            }
        }
    }
    out
}

/// Collects `BAKTA_CONFIG_<KEY>` environment overrides as a JSON object
/// keyed by the wire (camelCase) config names.
pub fn bakta_env_overrides() -> serde_json::Map<String, serde_json::Value> {
    let mut map = serde_json::Map::new();
    for (key, value) in std::env::vars() {
        if let Some(suffix) = key.strip_prefix("BAKTA_CONFIG_") {
            if suffix.is_empty() {
                continue;
            }
            map.insert(env_key_to_camel(suffix), parse_override_value(&value));
        }
    }
    map
}
