use std::env;

/// Service configuration, read once at startup.
///
/// Worker counts, batch size, and retry rounds were tuned against the
/// platform's undocumented rate limits; they are knobs, not contracts.
#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub db_path: String,
    pub slack_api_base: String,
    /// Year the wrapped covers, used in every search query.
    pub wrapped_year: String,
    pub confessions_channel: String,
    pub meta_channel: String,
    /// The one fixed recipient whose DM count gets its own slide.
    pub prox_user_id: String,
    pub site_url: String,
    pub retry_rounds: usize,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub job_delay_ms: u64,
    pub workers_default: usize,
    pub workers_restricted: usize,
    pub hackatime_base: String,
    /// Project-submission lookup service; submissions are skipped when unset.
    pub ysws_base: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("WRAPPED_PORT")
                .unwrap_or_else(|_| "9107".to_string())
                .parse()
                .expect("WRAPPED_PORT must be a valid number"),
            db_path: env::var("WRAPPED_DB_PATH").unwrap_or_else(|_| "./wrapped.db".to_string()),
            slack_api_base: env::var("SLACK_API_BASE")
                .unwrap_or_else(|_| "https://slack.com/api".to_string()),
            wrapped_year: env::var("WRAPPED_YEAR").unwrap_or_else(|_| "2025".to_string()),
            confessions_channel: env::var("WRAPPED_CONFESSIONS_CHANNEL")
                .unwrap_or_else(|_| "confessions".to_string()),
            meta_channel: env::var("WRAPPED_META_CHANNEL").unwrap_or_else(|_| "meta".to_string()),
            prox_user_id: env::var("WRAPPED_PROX_USER")
                .unwrap_or_else(|_| "U023L3A4UKX".to_string()),
            site_url: env::var("WRAPPED_SITE_URL")
                .unwrap_or_else(|_| "https://wrapped.isitzoe.dev".to_string()),
            retry_rounds: env::var("SLACK_RETRY_ROUNDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(100),
            batch_size: env::var("SCRAPE_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            batch_delay_ms: env::var("SCRAPE_BATCH_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1500),
            job_delay_ms: env::var("WORKER_JOB_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2000),
            workers_default: env::var("WORKERS_DEFAULT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),
            workers_restricted: env::var("WORKERS_RESTRICTED")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),
            hackatime_base: env::var("HACKATIME_API_BASE")
                .unwrap_or_else(|_| "https://hackatime.hackclub.com".to_string()),
            ysws_base: env::var("YSWS_API_BASE").ok(),
        }
    }
}
