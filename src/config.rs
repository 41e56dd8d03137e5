use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context};

use crate::logging::LogFormat;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_QUEUE: &str = "scan_jobs";
pub const DEFAULT_INFERENCE_URL: &str = "http://localhost:8001";
pub const DEFAULT_EXTENSIONS: &str = ".srt,.vtt,.mp4,.mkv,.avi";
pub const DEFAULT_IGNORE_PATTERNS: &str = "*sample*,*.tmp";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub queue_name: String,
    pub inference_url: String,
    pub poll_timeout: Duration,
    pub queue_backoff: Duration,
    pub db_max_connections: u32,
    pub segment_concurrency: usize,
    pub log_format: LogFormat,
    pub media_paths: Vec<String>,
    pub extensions: Vec<String>,
    pub ignore_patterns: Vec<String>,
    pub scan_interval: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|value| !value.trim().is_empty())
            .context("DATABASE_URL must be set to a Postgres instance")?;

        let log_format = match lookup("LOG_FORMAT") {
            Some(value) => LogFormat::parse(&value)
                .ok_or_else(|| anyhow!("LOG_FORMAT must be 'text' or 'json', got '{value}'"))?,
            None => LogFormat::Text,
        };

        let segment_concurrency: usize = parse_or(&lookup, "SEGMENT_CONCURRENCY", 4)?;
        let scan_interval: u64 = parse_or(&lookup, "SCAN_INTERVAL_SECS", 300)?;

        Ok(Self {
            database_url,
            redis_url: lookup("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            queue_name: lookup("SCAN_QUEUE").unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
            inference_url: lookup("INFERENCE_URL")
                .unwrap_or_else(|| DEFAULT_INFERENCE_URL.to_string()),
            poll_timeout: Duration::from_secs(parse_or(&lookup, "POLL_TIMEOUT_SECS", 5)?),
            queue_backoff: Duration::from_millis(parse_or(&lookup, "QUEUE_BACKOFF_MS", 1000)?),
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 5)?,
            segment_concurrency: segment_concurrency.max(1),
            log_format,
            media_paths: split_list(lookup("MEDIA_PATHS").as_deref().unwrap_or("")),
            extensions: split_list(
                lookup("SCAN_EXTENSIONS")
                    .as_deref()
                    .unwrap_or(DEFAULT_EXTENSIONS),
            ),
            ignore_patterns: split_list(
                lookup("SCAN_IGNORE")
                    .as_deref()
                    .unwrap_or(DEFAULT_IGNORE_PATTERNS),
            ),
            scan_interval: Duration::from_secs(scan_interval.max(1)),
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow!("{key} has invalid value '{raw}': {err}")),
        None => Ok(default),
    }
}
