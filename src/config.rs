//! Environment-driven configuration, loaded once at startup.

use std::env;
use std::path::PathBuf;

use crate::hdx;

const DEFAULT_USER_AGENT: &str = "hdx-scraper-cesa";
const DEFAULT_SITE: &str = "dev";
/// CogniCity reports endpoint.
const DEFAULT_BASE_URL: &str = "https://api.petabencana.id/reports";
const DEFAULT_LOOKBACK_DAYS: i64 = 7;

/// Startup configuration failure. Fatal before any network traffic.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("HDX_KEY is not set; the catalog API key is required to publish")]
    MissingApiKey,
    #[error("unknown HDX_SITE '{0}' (expected prod, demo, stage or dev)")]
    UnknownSite(String),
    #[error("invalid {var}: '{value}' is not a non-negative number of days")]
    InvalidLookback { var: &'static str, value: String },
    #[error("invalid CESA_EXTRA_PARAMS entry '{0}' (expected key=value)")]
    InvalidExtraParam(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// User-Agent sent on both upstream and catalog requests.
    pub user_agent: String,
    pub hdx_api_key: String,
    pub hdx_site: String,
    pub hdx_base_url: String,
    pub base_url: String,
    /// Extra query parameters appended to every upstream request.
    pub extra_params: Vec<(String, String)>,
    pub lookback_days: i64,
    pub temp_dir: PathBuf,
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Read every recognized variable; a local `.env` file is honored.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let user_agent =
            env::var("CESA_USER_AGENT").unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string());
        let hdx_api_key = env::var("HDX_KEY").map_err(|_| ConfigError::MissingApiKey)?;
        let hdx_site = env::var("HDX_SITE").unwrap_or_else(|_| DEFAULT_SITE.to_string());
        let hdx_base_url = hdx::site_base_url(&hdx_site)
            .ok_or_else(|| ConfigError::UnknownSite(hdx_site.clone()))?
            .to_string();
        let base_url = env::var("CESA_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let extra_params = parse_extra_params(&env::var("CESA_EXTRA_PARAMS").unwrap_or_default())?;
        let lookback_days = parse_lookback("CESA_LOOKBACK_DAYS")?;
        let temp_dir = env::var("TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::temp_dir());
        let log_file = env::var("LOG_FILE").ok().map(PathBuf::from);

        Ok(Self {
            user_agent,
            hdx_api_key,
            hdx_site,
            hdx_base_url,
            base_url,
            extra_params,
            lookback_days,
            temp_dir,
            log_file,
        })
    }
}

fn parse_lookback(var: &'static str) -> Result<i64, ConfigError> {
    match env::var(var) {
        Err(_) => Ok(DEFAULT_LOOKBACK_DAYS),
        Ok(value) => match value.trim().parse::<i64>() {
            Ok(days) if days >= 0 => Ok(days),
            _ => Err(ConfigError::InvalidLookback { var, value }),
        },
    }
}

/// Parse a comma-separated list of `key=value` pairs.
fn parse_extra_params(raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    let mut params = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match entry.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                params.push((key.trim().to_string(), value.trim().to_string()));
            }
            _ => return Err(ConfigError::InvalidExtraParam(entry.to_string())),
        }
    }
    Ok(params)
}
