//! Runtime configuration.
//!
//! Values come from the environment (after `.env` is loaded). A REST tree
//! source is used when `TREE_SOURCE_URL` is set; otherwise service records
//! are read from `TREE_SOURCE_DIR`.

use crate::search::DEFAULT_SEARCH_URL;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_SOURCE_DIR: &str = "services";
const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_CACHE_MAX_CAPACITY: u64 = 1024;

/// Where service records are fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceConfig {
    Rest {
        url: String,
        api_key: Option<String>,
    },
    Dir(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: String,
    pub source: SourceConfig,
    pub cache_ttl: Duration,
    pub cache_max_capacity: u64,
    /// Search endpoint used when a search form names no host.
    pub search_url: String,
}

impl AppConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key → value lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let source = match non_empty("TREE_SOURCE_URL") {
            Some(url) => SourceConfig::Rest {
                url,
                api_key: non_empty("TREE_SOURCE_API_KEY"),
            },
            None => SourceConfig::Dir(PathBuf::from(
                non_empty("TREE_SOURCE_DIR").unwrap_or_else(|| DEFAULT_SOURCE_DIR.to_string()),
            )),
        };

        let cache_ttl_secs: u64 = parse_or(
            "CACHE_TTL_SECS",
            non_empty("CACHE_TTL_SECS"),
            DEFAULT_CACHE_TTL_SECS,
        )?;
        let cache_max_capacity: u64 = parse_or(
            "CACHE_MAX_CAPACITY",
            non_empty("CACHE_MAX_CAPACITY"),
            DEFAULT_CACHE_MAX_CAPACITY,
        )?;

        Ok(Self {
            bind_addr: non_empty("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            source,
            cache_ttl: Duration::from_secs(cache_ttl_secs),
            cache_max_capacity,
            search_url: non_empty("SEARCH_API_URL")
                .unwrap_or_else(|| DEFAULT_SEARCH_URL.to_string()),
        })
    }
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}: {:?}", key, value)),
        None => Ok(default),
    }
}
