use std::{
    env, fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroU32,
    str::FromStr,
    time::Duration,
};

#[cfg(feature = "tch-backend")]
use std::path::PathBuf;

use anyhow::{Context, bail};
use governor::Quota;

#[cfg(feature = "tch-backend")]
use tch::Device;

/// Secret value that switches bearer authentication off entirely.
///
/// Intended only for local development and demo deployments. Any deployment
/// reachable by untrusted clients must set `API_TOKEN` to something else.
pub const AUTH_DISABLED_SENTINEL: &str = "changeme";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub model_id: String,
    pub api_token: String,
    pub cors_origins: Vec<String>,
    pub max_new_tokens_limit: usize,
    pub default_max_new_tokens: usize,
    pub default_temperature: f64,
    pub rate_limit: RateLimitPolicy,
    pub use_mock: bool,
    pub log_level: String,
    pub log_format: LogFormat,
    #[cfg(feature = "tch-backend")]
    pub module_path: PathBuf,
    #[cfg(feature = "tch-backend")]
    pub tokenizer_path: PathBuf,
    #[cfg(feature = "tch-backend")]
    pub device: Device,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8000),
            model_id: "bigcode/starcoder2-3b".to_string(),
            api_token: AUTH_DISABLED_SENTINEL.to_string(),
            cors_origins: vec!["*".to_string()],
            max_new_tokens_limit: 512,
            default_max_new_tokens: 256,
            default_temperature: 0.7,
            rate_limit: RateLimitPolicy::per_minute(100),
            use_mock: false,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            #[cfg(feature = "tch-backend")]
            module_path: PathBuf::from("models/model.ts"),
            #[cfg(feature = "tch-backend")]
            tokenizer_path: PathBuf::from("models/tokenizer.json"),
            #[cfg(feature = "tch-backend")]
            device: Device::Cpu,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let listen_addr = env::var("SERVER_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.listen_addr);

        let model_id = env::var("MODEL_ID").unwrap_or(defaults.model_id);
        let api_token = env::var("API_TOKEN").unwrap_or(defaults.api_token);

        let cors_origins = env::var("CORS_ORIGINS")
            .map(|raw| parse_origins(&raw))
            .unwrap_or(defaults.cors_origins);

        let max_new_tokens_limit = env::var("MAX_NEW_TOKENS_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_new_tokens_limit);
        let default_max_new_tokens = env::var("DEFAULT_MAX_NEW_TOKENS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.default_max_new_tokens);
        let default_temperature = env::var("DEFAULT_TEMPERATURE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.default_temperature);

        let rate_limit = match env::var("RATE_LIMIT") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("invalid RATE_LIMIT expression {raw:?}"))?,
            Err(_) => defaults.rate_limit,
        };

        let use_mock = env::var("USE_MOCK_GENERATION")
            .map(|v| parse_flag(&v))
            .unwrap_or(defaults.use_mock);

        let log_level = env::var("LOG_LEVEL")
            .map(|v| v.to_lowercase())
            .unwrap_or(defaults.log_level);
        let log_format = env::var("LOG_FORMAT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.log_format);

        #[cfg(feature = "tch-backend")]
        let (module_path, tokenizer_path, device) = {
            let module_path = env::var("MODEL_MODULE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.module_path);
            let tokenizer_path = env::var("TOKENIZER_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.tokenizer_path);
            let raw = env::var("DEVICE").unwrap_or_else(|_| "cpu".into());
            (module_path, tokenizer_path, parse_device(&raw))
        };

        Ok(Self {
            listen_addr,
            model_id,
            api_token,
            cors_origins,
            max_new_tokens_limit,
            default_max_new_tokens,
            default_temperature,
            rate_limit,
            use_mock,
            log_level,
            log_format,
            #[cfg(feature = "tch-backend")]
            module_path,
            #[cfg(feature = "tch-backend")]
            tokenizer_path,
            #[cfg(feature = "tch-backend")]
            device,
        })
    }

    pub fn auth_enabled(&self) -> bool {
        self.api_token != AUTH_DISABLED_SENTINEL
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "compact" | "text" | "pretty" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => bail!("unknown log format {other:?}"),
        }
    }
}

/// "N requests per window", e.g. `100/minute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub requests: NonZeroU32,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn per_minute(requests: u32) -> Self {
        Self {
            requests: NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN),
            window: Duration::from_secs(60),
        }
    }

    /// Quota allowing a burst of `requests` that refills evenly over `window`.
    pub fn quota(&self) -> Option<Quota> {
        let interval = self.window / self.requests.get();
        Quota::with_period(interval).map(|quota| quota.allow_burst(self.requests))
    }
}

impl FromStr for RateLimitPolicy {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_lowercase();
        let (count, unit) = normalized
            .split_once('/')
            .or_else(|| normalized.split_once(" per "))
            .with_context(|| format!("expected `<count>/<unit>`, got {raw:?}"))?;

        let requests: u32 = count
            .trim()
            .parse()
            .with_context(|| format!("invalid request count {count:?}"))?;
        let requests = NonZeroU32::new(requests).context("request count must be positive")?;

        let window = match unit.trim().trim_end_matches('s') {
            "second" | "sec" => Duration::from_secs(1),
            "minute" | "min" => Duration::from_secs(60),
            "hour" => Duration::from_secs(60 * 60),
            "day" => Duration::from_secs(24 * 60 * 60),
            other => bail!("unsupported rate-limit unit {other:?}"),
        };

        let policy = Self { requests, window };
        if policy.quota().is_none() {
            bail!("rate limit {raw:?} is finer than the limiter resolution");
        }
        Ok(policy)
    }
}

impl fmt::Display for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}s", self.requests, self.window.as_secs())
    }
}

#[cfg(feature = "tch-backend")]
fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower == "cpu" {
        Device::Cpu
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            Device::Cpu
        }
    } else {
        Device::Cpu
    }
}
