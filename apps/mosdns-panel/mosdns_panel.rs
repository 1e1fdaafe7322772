//! # MosDNS Panel - Resolver Status Dashboard
//!
//! A small dashboard and reverse proxy that sits in front of a MosDNS resolver.
//! It scrapes the resolver's Prometheus endpoint, folds the interesting series
//! into a typed summary, and forwards plugin API calls from the browser.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              MOSDNS PANEL                                 │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  FETCH → LINE CLASSIFIER → AGGREGATOR → DERIVED METRICS → JSON SUMMARY    │
//! │  /plugins/* ───────────────── PASS-THROUGH PROXY ─────────────────────────│
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## HTTP surface
//!
//! - `GET /` - embedded dashboard page
//! - `GET /api/mosdns_status` - scrape, parse and return the summary
//! - `GET|POST /plugins/*subpath` - forwarded verbatim to the MosDNS admin API
//! - `GET /api/background_status`, `POST /api/upload_background`,
//!   `POST /api/remove_background`, `GET /backgrounds/*` - custom dashboard background

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::net::TcpListener;
use tokio::signal;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{Local, TimeZone};

// ----------------------------------------------------------------------------
// Networking & HTTP
// ----------------------------------------------------------------------------
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path as UrlPath, RawQuery, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::{Client as HttpClient, Url};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// Regex & Pattern Matching
// ----------------------------------------------------------------------------
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

pub const PANEL_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PANEL_NAME: &str = "mosdns-panel";
pub const PANEL_FULL_NAME: &str = "MosDNS Status Panel";

// ----------------------------------------------------------------------------
// Backend Defaults
// ----------------------------------------------------------------------------

/// Admin API of a locally running MosDNS
pub const DEFAULT_ADMIN_URL: &str = "http://127.0.0.1:9099";

/// Path of the Prometheus endpoint below the admin URL
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Timeout for one metrics scrape
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 5;

/// Timeout for one proxied plugin call
pub const DEFAULT_PROXY_TIMEOUT_SECS: u64 = 10;

pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 300;

// ----------------------------------------------------------------------------
// Server Defaults
// ----------------------------------------------------------------------------

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5001;
pub const DEFAULT_CONFIG_PATH: &str = "mosdns-panel.toml";

/// Prefix for environment overrides, e.g. `MOSDNS_PANEL_BACKEND__ADMIN_URL`
pub const ENV_PREFIX: &str = "MOSDNS_PANEL_";

// ----------------------------------------------------------------------------
// Formatting
// ----------------------------------------------------------------------------

/// Rate reported for caches that have not answered any query yet
pub const ZERO_RATE: &str = "0.00%";

/// Sentinel for a runtime version that was never reported
pub const RUNTIME_VERSION_UNKNOWN: &str = "N/A";

pub const BYTES_PER_MEGABYTE: f64 = 1024.0 * 1024.0;

pub const START_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// ----------------------------------------------------------------------------
// Dashboard Background
// ----------------------------------------------------------------------------

/// Directory holding the uploaded dashboard background
pub const DEFAULT_UPLOADS_DIR: &str = "uploads";

/// File stem of the stored background; the extension follows the upload
pub const BACKGROUND_STEM: &str = "custom_background";

/// Multipart field carrying the image
pub const BACKGROUND_FIELD: &str = "background_image";

pub const BACKGROUND_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "gif", "webp"];

/// Request body limit for background uploads
pub const MAX_BACKGROUND_BYTES: usize = 16 * 1024 * 1024;

pub const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];
pub const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

const INDEX_HTML: &str = include_str!("index.html");

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Field identifiers for the recognized metric families and the summary types
// handed to the dashboard.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Metric Field Identifiers
// ----------------------------------------------------------------------------

/// Per-tag cache counters exported as `mosdns_cache_<name>{tag="..."}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheField {
    QueryTotal,
    HitTotal,
    LazyHitTotal,
    SizeCurrent,
}

impl CacheField {
    pub const ALL: [CacheField; 4] = [
        CacheField::QueryTotal,
        CacheField::HitTotal,
        CacheField::LazyHitTotal,
        CacheField::SizeCurrent,
    ];

    /// Resolve the `<name>` part of a cache series. Unknown names yield `None`.
    pub fn from_metric_name(name: &str) -> Option<Self> {
        match name {
            "query_total" => Some(CacheField::QueryTotal),
            "hit_total" => Some(CacheField::HitTotal),
            "lazy_hit_total" => Some(CacheField::LazyHitTotal),
            "size_current" => Some(CacheField::SizeCurrent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheField::QueryTotal => "query_total",
            CacheField::HitTotal => "hit_total",
            CacheField::LazyHitTotal => "lazy_hit_total",
            CacheField::SizeCurrent => "size_current",
        }
    }
}

impl Display for CacheField {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar process-level series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemField {
    StartTime,
    CpuTime,
    ResidentMemory,
    HeapIdleMemory,
    ThreadCount,
    OpenFdCount,
    RuntimeVersion,
}

impl SystemField {
    /// Shape of the captured value for this field
    pub fn value_kind(&self) -> ValueKind {
        match self {
            SystemField::StartTime
            | SystemField::CpuTime
            | SystemField::ResidentMemory
            | SystemField::HeapIdleMemory => ValueKind::Float,
            SystemField::ThreadCount | SystemField::OpenFdCount => ValueKind::Integer,
            SystemField::RuntimeVersion => ValueKind::Text,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SystemField::StartTime => "start_time",
            SystemField::CpuTime => "cpu_time",
            SystemField::ResidentMemory => "resident_memory",
            SystemField::HeapIdleMemory => "heap_idle_memory",
            SystemField::ThreadCount => "threads",
            SystemField::OpenFdCount => "open_fds",
            SystemField::RuntimeVersion => "go_version",
        }
    }
}

impl Display for SystemField {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Float,
    Integer,
    Text,
}

/// A parsed scalar capture. Text borrows from the source line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue<'a> {
    Float(f64),
    Integer(u64),
    Text(&'a str),
}

impl<'a> ScalarValue<'a> {
    /// Parse a raw capture. A capture that is not a valid, finite number
    /// yields `None`.
    pub fn parse(kind: ValueKind, raw: &'a str) -> Option<Self> {
        match kind {
            ValueKind::Float => parse_finite(raw).map(ScalarValue::Float),
            ValueKind::Integer => raw.parse::<u64>().ok().map(ScalarValue::Integer),
            ValueKind::Text => Some(ScalarValue::Text(raw)),
        }
    }
}

/// Float parse that rejects out-of-range input such as `1e999`, which
/// `str::parse` would otherwise turn into infinity.
pub fn parse_finite(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|value| value.is_finite())
}

// ----------------------------------------------------------------------------
// 3.2 Summary Types
// ----------------------------------------------------------------------------

/// Counters and derived rates of one cache instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetric {
    pub query_total: f64,
    pub hit_total: f64,
    pub lazy_hit_total: f64,
    pub hit_rate: String,
    pub lazy_hit_rate: String,
    pub size_current: f64,
}

/// Formatted process metrics of the resolver.
///
/// Fields that never showed up in the scrape are `None` and left out of the
/// JSON. The runtime version is always present and falls back to `"N/A"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resident_memory: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heap_idle_memory: Option<String>,

    #[serde(rename = "go_version", default = "default_runtime_version")]
    pub runtime_version: String,

    #[serde(rename = "threads", default, skip_serializing_if = "Option::is_none")]
    pub thread_count: Option<u64>,

    #[serde(rename = "open_fds", default, skip_serializing_if = "Option::is_none")]
    pub open_fd_count: Option<u64>,
}

impl Default for SystemSnapshot {
    fn default() -> Self {
        Self {
            start_time: None,
            cpu_time: None,
            resident_memory: None,
            heap_idle_memory: None,
            runtime_version: default_runtime_version(),
            thread_count: None,
            open_fd_count: None,
        }
    }
}

fn default_runtime_version() -> String {
    RUNTIME_VERSION_UNKNOWN.into()
}

/// Result of one scrape: every cache keyed by tag plus the process snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub caches: BTreeMap<String, CacheMetric>,
    pub system: SystemSnapshot,
}

impl MetricsSummary {
    pub fn cache(&self, tag: &str) -> Option<&CacheMetric> {
        self.caches.get(tag)
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// The parsing pipeline never fails; everything here belongs to configuration
// and to the HTTP side that talks to MosDNS.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Panel Errors
// ----------------------------------------------------------------------------

/// The main error type of the panel.
#[derive(Error, Debug)]
pub enum PanelError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Metrics fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Background error: {0}")]
    Background(#[from] BackgroundError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PanelError {
    /// Subsystem name for logging
    pub fn category(&self) -> &'static str {
        match self {
            PanelError::Config(_) => "config",
            PanelError::Fetch(_) => "fetch",
            PanelError::Proxy(_) => "proxy",
            PanelError::Background(_) => "background",
            PanelError::Io(_) => "io",
            PanelError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Gateway Errors
// ----------------------------------------------------------------------------

/// Failures of the metrics scrape. Any of these replaces the summary with a
/// 502 response.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("cannot reach MosDNS metrics endpoint {url}: {message}")]
    Unreachable { url: String, message: String },

    #[error("MosDNS metrics endpoint {url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("failed to read metrics response from {url}: {message}")]
    Read { url: String, message: String },
}

/// Failures of a proxied plugin call.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("invalid plugin path '{path}'")]
    InvalidPath { path: String },

    #[error("proxy request to MosDNS failed ({url}): {message}")]
    Upstream { url: String, message: String },
}

/// Failures of the background upload and removal endpoints.
#[derive(Error, Debug)]
pub enum BackgroundError {
    #[error("request has no '{field}' file part")]
    MissingFile { field: &'static str },

    #[error("no file selected")]
    EmptyFilename,

    #[error("file type of '{filename}' is not allowed, expected one of {allowed}")]
    UnsupportedType { filename: String, allowed: String },

    #[error("malformed upload: {message}")]
    Multipart { message: String },

    #[error("failed to store background: {0}")]
    Io(#[from] std::io::Error),
}

impl BackgroundError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BackgroundError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// JSON body for failed status requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for FetchError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (StatusCode::BAD_GATEWAY, Json(body)).into_response()
    }
}

impl IntoResponse for BackgroundError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match &self {
            ProxyError::InvalidPath { .. } => {
                (StatusCode::BAD_REQUEST, self.to_string()).into_response()
            }
            ProxyError::Upstream { message, .. } => (
                StatusCode::BAD_GATEWAY,
                format!("request to MosDNS failed: {}", message),
            )
                .into_response(),
        }
    }
}

/// Render an error together with its source chain.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

// ----------------------------------------------------------------------------
// 4.4 Result Type Aliases
// ----------------------------------------------------------------------------

pub type PanelResult<T> = Result<T, PanelError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Layered configuration: built-in defaults, optional TOML file, then
// `MOSDNS_PANEL_*` environment variables, then CLI flags.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Root Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelConfig {
    /// Listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// MosDNS admin API settings
    #[serde(default)]
    pub backend: BackendConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            backend: BackendConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl PanelConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let config = Self::layered(Some(path))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, without a file
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::layered(None)?;
        config.validate()?;
        Ok(config)
    }

    /// Merge all layers without validating
    pub fn layered(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI flags and legacy environment variables on top
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(host) = &overrides.host {
            self.server.host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(admin_url) = &overrides.admin_url {
            self.backend.admin_url = admin_url.clone();
        }
        if let Some(level) = &overrides.log_level {
            self.logging.level = level.clone();
        }
        if overrides.debug {
            self.logging.level = "debug".into();
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let admin_url = reqwest::Url::parse(&self.backend.admin_url)
            .map_err(|e| ConfigError::invalid_value("backend.admin_url", e.to_string()))?;
        if !matches!(admin_url.scheme(), "http" | "https") {
            return Err(ConfigError::invalid_value(
                "backend.admin_url",
                format!("unsupported scheme '{}', expected http or https", admin_url.scheme()),
            ));
        }

        if self.server.uploads_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid_value(
                "server.uploads_dir",
                "directory must not be empty",
            ));
        }

        if !self.backend.metrics_path.starts_with('/') {
            return Err(ConfigError::invalid_value(
                "backend.metrics_path",
                "path must start with '/'",
            ));
        }

        for (field, value) in [
            ("backend.fetch_timeout_secs", self.backend.fetch_timeout_secs),
            ("backend.proxy_timeout_secs", self.backend.proxy_timeout_secs),
        ] {
            if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&value) {
                return Err(ConfigError::invalid_value(
                    field,
                    format!(
                        "timeout must be between {} and {} seconds",
                        MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS
                    ),
                ));
            }
        }

        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            return Err(ConfigError::invalid_value(
                "logging.format",
                format!("expected one of {}", LOG_FORMATS.join(", ")),
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::invalid_value(
                "logging.level",
                format!("expected one of {}", LOG_LEVELS.join(", ")),
            ));
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> Result<String, ConfigError> {
        toml::to_string_pretty(&Self::default()).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }
}

/// Values coming from the command line. `None` leaves the loaded value alone.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub admin_url: Option<String>,
    pub log_level: Option<String>,
    pub debug: bool,
}

// ----------------------------------------------------------------------------
// 5.2 Server Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Where the custom dashboard background is stored
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            uploads_dir: default_uploads_dir(),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    DEFAULT_HOST.into()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from(DEFAULT_UPLOADS_DIR)
}

// ----------------------------------------------------------------------------
// 5.3 Backend Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the MosDNS admin API
    #[serde(default = "default_admin_url")]
    pub admin_url: String,

    /// Prometheus endpoint below `admin_url`
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            admin_url: default_admin_url(),
            metrics_path: default_metrics_path(),
            fetch_timeout_secs: default_fetch_timeout(),
            proxy_timeout_secs: default_proxy_timeout(),
        }
    }
}

impl BackendConfig {
    /// Admin URL without trailing slashes
    pub fn admin_base(&self) -> &str {
        self.admin_url.trim_end_matches('/')
    }

    pub fn metrics_url(&self) -> String {
        format!("{}{}", self.admin_base(), self.metrics_path)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_timeout_secs)
    }
}

fn default_admin_url() -> String {
    DEFAULT_ADMIN_URL.into()
}

fn default_metrics_path() -> String {
    DEFAULT_METRICS_PATH.into()
}

fn default_fetch_timeout() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

fn default_proxy_timeout() -> u64 {
    DEFAULT_PROXY_TIMEOUT_SECS
}

// ----------------------------------------------------------------------------
// 5.4 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Initialize the logging system based on configuration.
///
/// `RUST_LOG` takes precedence over the configured level. Output goes to
/// stderr so that `scrape` and `parse` can print JSON on stdout.
pub fn init_logging(config: &LoggingConfig) -> PanelResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        "off" => tracing::level_filters::LevelFilter::OFF,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| PanelError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| PanelError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| PanelError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "mosdns_panel::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: PATTERN REGISTRY
// ============================================================================
// One compiled rule per recognized metric family. Built once on first use and
// shared read-only by every parse.
//
// Scalar rules are anchored at the start of the line so that histogram and
// quantile series with a similar prefix never match. The cache rule is a
// substring match and accepts extra labels around `tag`.
// ============================================================================

static PATTERNS: Lazy<PatternRegistry> = Lazy::new(PatternRegistry::new);

const CACHE_PATTERN: &str =
    r#"mosdns_cache_(\w+)\{(?:[^{}]*?,\s*)?tag="([^"]+)"[^{}]*\}\s+([\d.eE+-]+)(?:\s|$)"#;

const SCALAR_PATTERNS: [(SystemField, &str); 7] = [
    (
        SystemField::StartTime,
        r"^process_start_time_seconds\s+([\d.eE+-]+)(?:\s|$)",
    ),
    (
        SystemField::CpuTime,
        r"^process_cpu_seconds_total\s+([\d.eE+-]+)(?:\s|$)",
    ),
    (
        SystemField::ResidentMemory,
        r"^process_resident_memory_bytes\s+([\d.eE+-]+)(?:\s|$)",
    ),
    (
        SystemField::HeapIdleMemory,
        r"^go_memstats_heap_idle_bytes\s+([\d.eE+-]+)(?:\s|$)",
    ),
    (SystemField::ThreadCount, r"^go_threads\s+(\d+)(?:\s|$)"),
    (SystemField::OpenFdCount, r"^process_open_fds\s+(\d+)(?:\s|$)"),
    (SystemField::RuntimeVersion, r#"^go_info\{version="([^"]+)"\}"#),
];

/// A line-matching rule for one scalar family.
#[derive(Debug)]
pub struct ScalarRule {
    pub field: SystemField,
    pub pattern: Regex,
}

#[derive(Debug)]
pub struct PatternRegistry {
    cache: Regex,
    scalars: Vec<ScalarRule>,
}

impl PatternRegistry {
    /// Compile the fixed rule set. The patterns are constants, so a failure
    /// here is a programming error.
    pub fn new() -> Self {
        let cache = Regex::new(CACHE_PATTERN).expect("cache pattern must compile");
        let scalars = SCALAR_PATTERNS
            .iter()
            .map(|(field, pattern)| ScalarRule {
                field: *field,
                pattern: Regex::new(pattern).expect("scalar pattern must compile"),
            })
            .collect();

        Self { cache, scalars }
    }

    /// Process-wide registry
    pub fn global() -> &'static PatternRegistry {
        &PATTERNS
    }

    pub fn cache_pattern(&self) -> &Regex {
        &self.cache
    }

    /// Scalar rules in match order
    pub fn scalar_rules(&self) -> &[ScalarRule] {
        &self.scalars
    }
}

impl Default for PatternRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// SECTION 8: LINE CLASSIFIER
// ============================================================================

/// Outcome of matching one exposition line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LineClass<'a> {
    NoMatch,
    Cache {
        field: CacheField,
        tag: &'a str,
        value: f64,
    },
    System {
        field: SystemField,
        value: ScalarValue<'a>,
    },
}

impl PatternRegistry {
    /// Classify one trimmed, non-comment line.
    ///
    /// The cache rule is tried first and short-circuits the scalar rules.
    /// Among scalar rules the first match wins, even when its value then
    /// fails to parse.
    pub fn classify<'a>(&self, line: &'a str) -> LineClass<'a> {
        if let Some(caps) = self.cache.captures(line) {
            return Self::classify_cache(&caps);
        }

        for rule in &self.scalars {
            let Some(caps) = rule.pattern.captures(line) else {
                continue;
            };
            let Some(raw) = caps.get(1) else {
                return LineClass::NoMatch;
            };
            return match ScalarValue::parse(rule.field.value_kind(), raw.as_str()) {
                Some(value) => LineClass::System {
                    field: rule.field,
                    value,
                },
                None => LineClass::NoMatch,
            };
        }

        LineClass::NoMatch
    }

    fn classify_cache<'a>(caps: &Captures<'a>) -> LineClass<'a> {
        let (Some(metric), Some(tag), Some(raw)) = (caps.get(1), caps.get(2), caps.get(3)) else {
            return LineClass::NoMatch;
        };
        // Series the panel does not know about are dropped without a trace.
        let Some(field) = CacheField::from_metric_name(metric.as_str()) else {
            return LineClass::NoMatch;
        };
        match parse_finite(raw.as_str()) {
            Some(value) => LineClass::Cache {
                field,
                tag: tag.as_str(),
                value,
            },
            None => LineClass::NoMatch,
        }
    }
}

/// Classify a line against the global registry.
pub fn classify_line(line: &str) -> LineClass<'_> {
    PatternRegistry::global().classify(line)
}

// ============================================================================
// SECTION 9: AGGREGATOR
// ============================================================================

/// Raw counters of one cache tag, before rates are derived.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheCounters {
    pub query_total: f64,
    pub hit_total: f64,
    pub lazy_hit_total: f64,
    pub size_current: f64,
}

impl CacheCounters {
    pub fn set(&mut self, field: CacheField, value: f64) {
        match field {
            CacheField::QueryTotal => self.query_total = value,
            CacheField::HitTotal => self.hit_total = value,
            CacheField::LazyHitTotal => self.lazy_hit_total = value,
            CacheField::SizeCurrent => self.size_current = value,
        }
    }
}

/// Raw process readings, before formatting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemReadings {
    pub start_time_secs: Option<f64>,
    pub cpu_seconds: Option<f64>,
    pub resident_bytes: Option<f64>,
    pub heap_idle_bytes: Option<f64>,
    pub thread_count: Option<u64>,
    pub open_fd_count: Option<u64>,
    pub runtime_version: Option<String>,
}

impl SystemReadings {
    /// Store a scalar reading. Returns `false` when the value has the wrong
    /// shape for the field.
    pub fn apply(&mut self, field: SystemField, value: ScalarValue<'_>) -> bool {
        match (field, value) {
            (SystemField::StartTime, ScalarValue::Float(v)) => self.start_time_secs = Some(v),
            (SystemField::CpuTime, ScalarValue::Float(v)) => self.cpu_seconds = Some(v),
            (SystemField::ResidentMemory, ScalarValue::Float(v)) => self.resident_bytes = Some(v),
            (SystemField::HeapIdleMemory, ScalarValue::Float(v)) => self.heap_idle_bytes = Some(v),
            (SystemField::ThreadCount, ScalarValue::Integer(v)) => self.thread_count = Some(v),
            (SystemField::OpenFdCount, ScalarValue::Integer(v)) => self.open_fd_count = Some(v),
            (SystemField::RuntimeVersion, ScalarValue::Text(v)) => {
                self.runtime_version = Some(v.to_string())
            }
            _ => return false,
        }
        true
    }
}

/// In-progress summary for a single parse.
///
/// Lines are ingested in file order; a repeated tag/field simply overwrites
/// the earlier value.
#[derive(Debug)]
pub struct MetricsAggregator<'r> {
    registry: &'r PatternRegistry,
    caches: BTreeMap<String, CacheCounters>,
    system: SystemReadings,
    lines_seen: usize,
    lines_applied: usize,
}

impl MetricsAggregator<'static> {
    pub fn new() -> Self {
        Self::with_registry(PatternRegistry::global())
    }
}

impl Default for MetricsAggregator<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'r> MetricsAggregator<'r> {
    pub fn with_registry(registry: &'r PatternRegistry) -> Self {
        Self {
            registry,
            caches: BTreeMap::new(),
            system: SystemReadings::default(),
            lines_seen: 0,
            lines_applied: 0,
        }
    }

    /// Feed one raw line. Blank lines and `#` comments are skipped.
    /// Returns whether the line changed the summary.
    pub fn ingest(&mut self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return false;
        }
        self.lines_seen += 1;

        let applied = match self.registry.classify(line) {
            LineClass::NoMatch => false,
            LineClass::Cache { field, tag, value } => {
                // get-or-create; a tag's fields arrive on separate lines
                match self.caches.get_mut(tag) {
                    Some(counters) => counters.set(field, value),
                    None => {
                        let mut counters = CacheCounters::default();
                        counters.set(field, value);
                        self.caches.insert(tag.to_string(), counters);
                    }
                }
                true
            }
            LineClass::System { field, value } => self.system.apply(field, value),
        };

        if applied {
            self.lines_applied += 1;
        }
        applied
    }

    /// Feed a whole exposition body.
    pub fn ingest_text(&mut self, text: &str) {
        for line in text.lines() {
            self.ingest(line);
        }
    }

    pub fn counters(&self, tag: &str) -> Option<&CacheCounters> {
        self.caches.get(tag)
    }

    pub fn system(&self) -> &SystemReadings {
        &self.system
    }

    /// Non-comment lines looked at so far
    pub fn lines_seen(&self) -> usize {
        self.lines_seen
    }

    /// Lines that changed the summary
    pub fn lines_applied(&self) -> usize {
        self.lines_applied
    }

    /// Derive rates and formatted fields and hand out the summary.
    pub fn finalize(self) -> MetricsSummary {
        MetricsSummary {
            caches: self
                .caches
                .into_iter()
                .map(|(tag, counters)| (tag, counters.finalize()))
                .collect(),
            system: self.system.finalize(),
        }
    }
}

/// Parse a full exposition body into a fresh summary.
pub fn parse_metrics(text: &str) -> MetricsSummary {
    let mut aggregator = MetricsAggregator::new();
    aggregator.ingest_text(text);

    debug!(
        target: "mosdns_panel::parser",
        lines = aggregator.lines_seen(),
        applied = aggregator.lines_applied(),
        "Parsed metrics exposition"
    );

    aggregator.finalize()
}

// ============================================================================
// SECTION 10: DERIVED METRICS
// ============================================================================

/// `part / total` as a percentage with two decimals, `"0.00%"` when there
/// is nothing to divide by.
pub fn format_rate(part: f64, total: f64) -> String {
    if total > 0.0 {
        format!("{:.2}%", part / total * 100.0)
    } else {
        ZERO_RATE.to_string()
    }
}

/// Local calendar time of a Unix epoch in seconds. Out-of-range values yield `None`.
pub fn format_start_time(epoch_secs: f64) -> Option<String> {
    if !epoch_secs.is_finite() {
        return None;
    }
    Local
        .timestamp_opt(epoch_secs.trunc() as i64, 0)
        .single()
        .map(|dt| dt.format(START_TIME_FORMAT).to_string())
}

pub fn format_cpu_seconds(seconds: f64) -> String {
    format!("{:.2} s", seconds)
}

pub fn format_megabytes(bytes: f64) -> String {
    format!("{:.2} MB", bytes / BYTES_PER_MEGABYTE)
}

impl CacheCounters {
    pub fn hit_rate(&self) -> String {
        format_rate(self.hit_total, self.query_total)
    }

    pub fn lazy_hit_rate(&self) -> String {
        format_rate(self.lazy_hit_total, self.query_total)
    }

    pub fn finalize(self) -> CacheMetric {
        CacheMetric {
            query_total: self.query_total,
            hit_total: self.hit_total,
            lazy_hit_total: self.lazy_hit_total,
            hit_rate: self.hit_rate(),
            lazy_hit_rate: self.lazy_hit_rate(),
            size_current: self.size_current,
        }
    }
}

impl SystemReadings {
    pub fn finalize(self) -> SystemSnapshot {
        SystemSnapshot {
            start_time: self.start_time_secs.and_then(format_start_time),
            cpu_time: self.cpu_seconds.map(format_cpu_seconds),
            resident_memory: self.resident_bytes.map(format_megabytes),
            heap_idle_memory: self.heap_idle_bytes.map(format_megabytes),
            runtime_version: self.runtime_version.unwrap_or_else(default_runtime_version),
            thread_count: self.thread_count,
            open_fd_count: self.open_fd_count,
        }
    }
}

// ============================================================================
// SECTION 11: PARSING PIPELINE TESTS
// ============================================================================

#[cfg(test)]
mod parser_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use test_case::test_case;

    const FORWARD_SAMPLE: &str = "\
mosdns_cache_query_total{tag=\"forward\"} 100
mosdns_cache_hit_total{tag=\"forward\"} 40
mosdns_cache_lazy_hit_total{tag=\"forward\"} 10
mosdns_cache_size_current{tag=\"forward\"} 512
process_start_time_seconds 1700000000
go_threads 8
";

    const FULL_SCRAPE: &str = r#"
# HELP go_gc_duration_seconds A summary of the pause duration of garbage collection cycles.
# TYPE go_gc_duration_seconds summary
go_gc_duration_seconds{quantile="0"} 2.1e-05
go_gc_duration_seconds{quantile="0.5"} 4.6e-05
go_gc_duration_seconds_sum 0.0123
go_gc_duration_seconds_count 211
# HELP go_info Information about the Go environment.
# TYPE go_info gauge
go_info{version="go1.21.4"} 1
go_memstats_heap_idle_bytes 8.388608e+06
go_memstats_heap_idle_bytes_total 3
go_threads 12
# HELP mosdns_cache_query_total The total number of processed queries
# TYPE mosdns_cache_query_total counter
mosdns_cache_query_total{tag="cache_cn"} 2000
mosdns_cache_query_total{tag="cache_global"} 0
mosdns_cache_hit_total{tag="cache_cn"} 1500
mosdns_cache_lazy_hit_total{tag="cache_cn"} 250
mosdns_cache_size_current{tag="cache_cn"} 4096
mosdns_cache_size_current{tag="cache_global"} 17
process_cpu_seconds_total 123.456
process_open_fds 42
process_resident_memory_bytes 5.24288e+07
process_start_time_seconds 1.7e+09
"#;

    fn expected_start_time(secs: i64) -> String {
        Local
            .timestamp_opt(secs, 0)
            .single()
            .unwrap()
            .format(START_TIME_FORMAT)
            .to_string()
    }

    fn sample_lines() -> Vec<&'static str> {
        FULL_SCRAPE.lines().collect()
    }

    // ---- Pattern registry & classification ----

    #[test]
    fn test_registry_scalar_order() {
        let fields: Vec<SystemField> = PatternRegistry::global()
            .scalar_rules()
            .iter()
            .map(|rule| rule.field)
            .collect();
        assert_eq!(
            fields,
            vec![
                SystemField::StartTime,
                SystemField::CpuTime,
                SystemField::ResidentMemory,
                SystemField::HeapIdleMemory,
                SystemField::ThreadCount,
                SystemField::OpenFdCount,
                SystemField::RuntimeVersion,
            ]
        );
    }

    #[test]
    fn test_classify_cache_line() {
        assert_eq!(
            classify_line(r#"mosdns_cache_hit_total{tag="forward"} 40"#),
            LineClass::Cache {
                field: CacheField::HitTotal,
                tag: "forward",
                value: 40.0,
            }
        );
    }

    #[test]
    fn test_cache_match_is_unanchored() {
        assert_eq!(
            classify_line(r#"prefix mosdns_cache_query_total{tag="main"} 7"#),
            LineClass::Cache {
                field: CacheField::QueryTotal,
                tag: "main",
                value: 7.0,
            }
        );
    }

    #[test]
    fn test_cache_line_with_extra_labels() {
        assert_eq!(
            classify_line(r#"mosdns_cache_size_current{instance="a:9099", tag="lazy"} 3"#),
            LineClass::Cache {
                field: CacheField::SizeCurrent,
                tag: "lazy",
                value: 3.0,
            }
        );
        assert_eq!(
            classify_line(r#"mosdns_cache_size_current{tag="lazy",job="dns"} 5"#),
            LineClass::Cache {
                field: CacheField::SizeCurrent,
                tag: "lazy",
                value: 5.0,
            }
        );
    }

    #[test]
    fn test_cache_label_suffix_is_not_tag() {
        assert_eq!(
            classify_line(r#"mosdns_cache_size_current{othertag="x"} 5"#),
            LineClass::NoMatch
        );
    }

    #[test]
    fn test_unknown_cache_metric_is_ignored() {
        assert_eq!(
            classify_line(r#"mosdns_cache_evicted_total{tag="forward"} 9"#),
            LineClass::NoMatch
        );
    }

    #[test_case("process_start_time_seconds 1700000000", SystemField::StartTime, ScalarValue::Float(1_700_000_000.0) ; "start time")]
    #[test_case("process_cpu_seconds_total 12.5", SystemField::CpuTime, ScalarValue::Float(12.5) ; "cpu time")]
    #[test_case("process_resident_memory_bytes 2.097152e+06", SystemField::ResidentMemory, ScalarValue::Float(2_097_152.0) ; "scientific notation")]
    #[test_case("go_memstats_heap_idle_bytes 1048576", SystemField::HeapIdleMemory, ScalarValue::Float(1_048_576.0) ; "heap idle")]
    #[test_case("go_threads 8", SystemField::ThreadCount, ScalarValue::Integer(8) ; "threads")]
    #[test_case("process_open_fds 42", SystemField::OpenFdCount, ScalarValue::Integer(42) ; "open fds")]
    #[test_case("go_info{version=\"go1.22.1\"} 1", SystemField::RuntimeVersion, ScalarValue::Text("go1.22.1") ; "runtime version")]
    fn test_classify_scalar_line(line: &str, field: SystemField, value: ScalarValue<'_>) {
        assert_eq!(classify_line(line), LineClass::System { field, value });
    }

    #[test_case("xprocess_cpu_seconds_total 12.5" ; "prefixed name")]
    #[test_case("go_threads_total 3" ; "longer name")]
    #[test_case("go_memstats_heap_idle_bytes_total 3" ; "suffixed family")]
    #[test_case("go_gc_duration_seconds{quantile=\"0.5\"} 4.6e-05" ; "quantile series")]
    #[test_case("process_cpu_seconds_total{mode=\"user\"} 1" ; "labelled variant")]
    #[test_case("some_other_metric 3.14" ; "unknown family")]
    fn test_scalar_rules_are_anchored(line: &str) {
        assert_eq!(classify_line(line), LineClass::NoMatch);
    }

    #[test_case("mosdns_cache_query_total{tag=\"forward\"} 1.2.3" ; "cache two dots")]
    #[test_case("mosdns_cache_hit_total{tag=\"forward\"} 1e" ; "cache dangling exponent")]
    #[test_case("process_cpu_seconds_total 1.2.3" ; "scalar two dots")]
    #[test_case("go_threads 8.5" ; "fractional integer")]
    #[test_case("go_threads abc" ; "non numeric")]
    #[test_case("mosdns_cache_hit_total{tag=\"t\"} 1e999" ; "cache value out of range")]
    #[test_case("mosdns_cache_query_total{tag=\"t\"} -1e999" ; "cache value negative overflow")]
    #[test_case("process_resident_memory_bytes 1e999" ; "scalar value out of range")]
    #[test_case("go_threads 99999999999999999999999" ; "integer overflow")]
    fn test_malformed_value_is_no_match(line: &str) {
        assert_eq!(classify_line(line), LineClass::NoMatch);
    }

    // ---- Aggregation ----

    #[test]
    fn test_forward_sample_summary() {
        let summary = parse_metrics(FORWARD_SAMPLE);

        assert_eq!(
            summary.cache("forward"),
            Some(&CacheMetric {
                query_total: 100.0,
                hit_total: 40.0,
                lazy_hit_total: 10.0,
                hit_rate: "40.00%".into(),
                lazy_hit_rate: "10.00%".into(),
                size_current: 512.0,
            })
        );
        assert_eq!(summary.system.thread_count, Some(8));
        assert_eq!(
            summary.system.start_time,
            Some(expected_start_time(1_700_000_000))
        );
        assert_eq!(summary.system.runtime_version, RUNTIME_VERSION_UNKNOWN);
        assert_eq!(summary.system.cpu_time, None);
    }

    #[test]
    fn test_full_scrape_summary() {
        let summary = parse_metrics(FULL_SCRAPE);

        assert_eq!(summary.caches.len(), 2);
        let cn = summary.cache("cache_cn").unwrap();
        assert_eq!(cn.hit_rate, "75.00%");
        assert_eq!(cn.lazy_hit_rate, "12.50%");
        assert_eq!(cn.size_current, 4096.0);

        let global = summary.cache("cache_global").unwrap();
        assert_eq!(global.hit_rate, ZERO_RATE);
        assert_eq!(global.size_current, 17.0);

        let system = &summary.system;
        assert_eq!(system.runtime_version, "go1.21.4");
        assert_eq!(system.thread_count, Some(12));
        assert_eq!(system.open_fd_count, Some(42));
        assert_eq!(system.cpu_time.as_deref(), Some("123.46 s"));
        assert_eq!(system.resident_memory.as_deref(), Some("50.00 MB"));
        assert_eq!(system.heap_idle_memory.as_deref(), Some("8.00 MB"));
        assert_eq!(system.start_time, Some(expected_start_time(1_700_000_000)));
    }

    #[test]
    fn test_zero_queries_yield_zero_rates() {
        let summary = parse_metrics(
            "mosdns_cache_query_total{tag=\"t\"} 0\nmosdns_cache_hit_total{tag=\"t\"} 5\n",
        );
        let cache = summary.cache("t").unwrap();
        assert_eq!(cache.hit_rate, ZERO_RATE);
        assert_eq!(cache.lazy_hit_rate, ZERO_RATE);
    }

    #[test]
    fn test_size_only_tag() {
        let summary = parse_metrics("mosdns_cache_size_current{tag=\"only_size\"} 77");
        let cache = summary.cache("only_size").unwrap();
        assert_eq!(cache.size_current, 77.0);
        assert_eq!(cache.query_total, 0.0);
        assert_eq!(cache.hit_rate, ZERO_RATE);
        assert_eq!(cache.lazy_hit_rate, ZERO_RATE);
    }

    #[test]
    fn test_duplicate_lines_last_write_wins() {
        let summary = parse_metrics(
            "mosdns_cache_query_total{tag=\"t\"} 10\n\
             mosdns_cache_query_total{tag=\"t\"} 20\n\
             mosdns_cache_hit_total{tag=\"t\"} 5\n\
             go_threads 3\n\
             go_threads 9\n",
        );
        assert_eq!(summary.cache("t").unwrap().query_total, 20.0);
        assert_eq!(summary.cache("t").unwrap().hit_rate, "25.00%");
        assert_eq!(summary.system.thread_count, Some(9));
    }

    #[test]
    fn test_malformed_line_keeps_prior_value() {
        let mut aggregator = MetricsAggregator::new();
        assert!(aggregator.ingest("mosdns_cache_query_total{tag=\"t\"} 10"));
        assert!(!aggregator.ingest("mosdns_cache_query_total{tag=\"t\"} 1.2.3"));
        assert_eq!(aggregator.counters("t").unwrap().query_total, 10.0);

        assert!(aggregator.ingest("process_cpu_seconds_total 4"));
        assert!(!aggregator.ingest("process_cpu_seconds_total 4..0"));
        assert_eq!(aggregator.system().cpu_seconds, Some(4.0));
    }

    #[test]
    fn test_out_of_range_value_keeps_prior_value() {
        let summary = parse_metrics(
            "mosdns_cache_query_total{tag=\"x\"} 10\n\
             mosdns_cache_hit_total{tag=\"x\"} 4\n\
             mosdns_cache_hit_total{tag=\"x\"} 1e999\n\
             mosdns_cache_query_total{tag=\"y\"} 1e999\n\
             process_resident_memory_bytes 1048576\n\
             process_resident_memory_bytes 1e999\n",
        );

        let x = summary.cache("x").unwrap();
        assert_eq!(x.hit_total, 4.0);
        assert_eq!(x.hit_rate, "40.00%");
        assert!(summary.cache("y").is_none());
        assert_eq!(summary.system.resident_memory.as_deref(), Some("1.00 MB"));

        let json = serde_json::to_string(&summary).unwrap();
        assert!(!json.contains("null"));
        assert!(!json.contains("inf"));
    }

    #[test]
    fn test_cache_match_skips_scalar_rules() {
        let line = r#"go_threads 8 mosdns_cache_query_total{tag="x"} 1"#;
        assert_eq!(
            classify_line(line),
            LineClass::Cache {
                field: CacheField::QueryTotal,
                tag: "x",
                value: 1.0,
            }
        );

        let summary = parse_metrics(line);
        assert_eq!(summary.cache("x").unwrap().query_total, 1.0);
        assert_eq!(summary.system.thread_count, None);
    }

    #[test]
    fn test_malformed_line_creates_no_entry() {
        let summary = parse_metrics("mosdns_cache_hit_total{tag=\"ghost\"} 1e\n");
        assert!(summary.caches.is_empty());
    }

    #[test]
    fn test_unknown_cache_metric_creates_no_entry() {
        let summary = parse_metrics("mosdns_cache_evicted_total{tag=\"ghost\"} 3\n");
        assert!(summary.caches.is_empty());
    }

    #[test]
    fn test_unknown_lines_do_not_mutate() {
        let mut aggregator = MetricsAggregator::new();
        assert!(!aggregator.ingest("some_other_metric 3.14"));
        assert_eq!(aggregator.lines_seen(), 1);
        assert_eq!(aggregator.lines_applied(), 0);
        assert_eq!(aggregator.finalize(), MetricsSummary::default());
    }

    #[test]
    fn test_empty_and_comment_only_input() {
        for input in ["", "\n\n   \n", "# HELP go_threads Number of OS threads\n# TYPE go_threads gauge\n"] {
            let summary = parse_metrics(input);
            assert!(summary.caches.is_empty());
            assert_eq!(summary.system, SystemSnapshot::default());
            assert_eq!(summary.system.runtime_version, "N/A");
        }
    }

    #[test]
    fn test_comment_lines_are_skipped_even_if_they_look_like_metrics() {
        let mut aggregator = MetricsAggregator::new();
        assert!(!aggregator.ingest("# go_threads 8"));
        assert!(!aggregator.ingest("   "));
        assert_eq!(aggregator.lines_seen(), 0);
    }

    #[test]
    fn test_lines_are_trimmed() {
        let summary = parse_metrics("   go_threads 8   \r\n\tprocess_open_fds 3\r\n");
        assert_eq!(summary.system.thread_count, Some(8));
        assert_eq!(summary.system.open_fd_count, Some(3));
    }

    #[test]
    fn test_observed_zero_is_kept() {
        let summary = parse_metrics("process_open_fds 0\n");
        assert_eq!(summary.system.open_fd_count, Some(0));
    }

    #[test]
    fn test_each_parse_starts_fresh() {
        let first = parse_metrics(FORWARD_SAMPLE);
        let second = parse_metrics("mosdns_cache_query_total{tag=\"other\"} 1\n");
        assert!(first.cache("forward").is_some());
        assert!(second.cache("forward").is_none());
        assert_eq!(second.system.thread_count, None);
    }

    // ---- Derived metrics ----

    #[test_case(40.0, 100.0, "40.00%" ; "forty percent")]
    #[test_case(2.0, 3.0, "66.67%" ; "rounded up")]
    #[test_case(1.0, 3.0, "33.33%" ; "rounded down")]
    #[test_case(3.0, 3.0, "100.00%" ; "all hits")]
    #[test_case(5.0, 0.0, "0.00%" ; "no queries")]
    fn test_format_rate(part: f64, total: f64, expected: &str) {
        assert_eq!(format_rate(part, total), expected);
    }

    #[test_case(0.0, "0.00 MB" ; "zero")]
    #[test_case(1_048_576.0, "1.00 MB" ; "one megabyte")]
    #[test_case(1_572_864.0, "1.50 MB" ; "one and a half")]
    fn test_format_megabytes(bytes: f64, expected: &str) {
        assert_eq!(format_megabytes(bytes), expected);
    }

    #[test]
    fn test_format_cpu_seconds() {
        assert_eq!(format_cpu_seconds(0.5), "0.50 s");
        assert_eq!(format_cpu_seconds(123.456), "123.46 s");
    }

    #[test]
    fn test_format_start_time_truncates_fraction() {
        assert_eq!(
            format_start_time(1_700_000_000.9),
            Some(expected_start_time(1_700_000_000))
        );
    }

    #[test]
    fn test_format_start_time_out_of_range() {
        assert_eq!(format_start_time(f64::INFINITY), None);
        assert_eq!(format_start_time(1e300), None);
    }

    // ---- Serialization ----

    #[test]
    fn test_summary_json_shape() {
        let json = serde_json::to_value(parse_metrics(FORWARD_SAMPLE)).unwrap();

        assert_eq!(json["caches"]["forward"]["hit_rate"], "40.00%");
        assert_eq!(json["caches"]["forward"]["size_current"], 512.0);
        assert_eq!(json["system"]["threads"], 8);
        assert_eq!(json["system"]["go_version"], "N/A");

        let system = json["system"].as_object().unwrap();
        assert!(system.contains_key("start_time"));
        assert!(!system.contains_key("cpu_time"));
        assert!(!system.contains_key("resident_memory"));
        assert!(!system.contains_key("heap_idle_memory"));
        assert!(!system.contains_key("open_fds"));
    }

    #[test]
    fn test_empty_summary_json() {
        let json = serde_json::to_value(MetricsSummary::default()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "caches": {}, "system": { "go_version": "N/A" } })
        );
    }

    // ---- Properties ----

    proptest! {
        #[test]
        fn prop_summary_independent_of_line_order(lines in Just(sample_lines()).prop_shuffle()) {
            let shuffled = lines.join("\n");
            prop_assert_eq!(parse_metrics(&shuffled), parse_metrics(FULL_SCRAPE));
        }

        #[test]
        fn prop_hit_rate_matches_ratio(queries in 1u32..1_000_000, hits_seed in 0u32..1_000_000) {
            let hits = hits_seed % (queries + 1);
            let text = format!(
                "mosdns_cache_hit_total{{tag=\"p\"}} {}\nmosdns_cache_query_total{{tag=\"p\"}} {}\n",
                hits, queries
            );
            let summary = parse_metrics(&text);
            let expected = format!("{:.2}%", hits as f64 / queries as f64 * 100.0);
            prop_assert_eq!(&summary.caches["p"].hit_rate, &expected);
        }

        #[test]
        fn prop_reingesting_lines_is_idempotent(queries in 0u32..100_000, lazy in 0u32..100_000, size in 0u32..100_000) {
            let text = format!(
                "mosdns_cache_query_total{{tag=\"p\"}} {}\nmosdns_cache_lazy_hit_total{{tag=\"p\"}} {}\nmosdns_cache_size_current{{tag=\"p\"}} {}\n",
                queries, lazy, size
            );
            let doubled = format!("{}{}", text, text);
            prop_assert_eq!(parse_metrics(&doubled), parse_metrics(&text));
        }

        #[test]
        fn prop_zero_queries_always_zero_rate(hits in 0u32..1_000_000, lazy in 0u32..1_000_000) {
            let text = format!(
                "mosdns_cache_hit_total{{tag=\"z\"}} {}\nmosdns_cache_lazy_hit_total{{tag=\"z\"}} {}\n",
                hits, lazy
            );
            let summary = parse_metrics(&text);
            prop_assert_eq!(summary.caches["z"].hit_rate.as_str(), ZERO_RATE);
            prop_assert_eq!(summary.caches["z"].lazy_hit_rate.as_str(), ZERO_RATE);
        }
    }
}

// ============================================================================
// SECTION 12: MOSDNS BACKEND CLIENT
// ============================================================================
// Everything that talks to the resolver over HTTP: the metrics scrape and the
// plugin API pass-through. One pooled reqwest client serves both.
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Metrics Source Trait
// ----------------------------------------------------------------------------

/// Something that can hand over the raw exposition text of one scrape.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn fetch_metrics_text(&self) -> Result<String, FetchError>;

    /// Where the metrics come from, for logs
    fn endpoint(&self) -> &str;
}

// ----------------------------------------------------------------------------
// 12.2 HTTP Client
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MosdnsClient {
    http: HttpClient,
    admin_base: String,
    admin_url: Url,
    metrics_url: String,
    fetch_timeout: Duration,
    proxy_timeout: Duration,
}

impl MosdnsClient {
    pub fn new(config: &BackendConfig) -> PanelResult<Self> {
        let http = HttpClient::builder()
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| PanelError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        let admin_url = Url::parse(config.admin_base())
            .map_err(|e| ConfigError::invalid_value("backend.admin_url", e.to_string()))?;

        Ok(Self {
            http,
            admin_base: config.admin_base().to_string(),
            admin_url,
            metrics_url: config.metrics_url(),
            fetch_timeout: config.fetch_timeout(),
            proxy_timeout: config.proxy_timeout(),
        })
    }

    pub fn admin_base(&self) -> &str {
        &self.admin_base
    }

    /// Target URL of a plugin call. `..` segments are refused so the proxy
    /// cannot be used to leave `/plugins/`.
    ///
    /// The subpath arrives percent-decoded, so every segment is encoded again
    /// and a decoded `?` or `#` stays part of the path.
    pub fn plugin_url(&self, subpath: &str, query: Option<&str>) -> Result<String, ProxyError> {
        let subpath = subpath.trim_start_matches('/');
        let invalid = || ProxyError::InvalidPath {
            path: subpath.to_string(),
        };
        if subpath.split('/').any(|segment| segment == "..") {
            return Err(invalid());
        }

        let mut url = self.admin_url.clone();
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .pop_if_empty()
            .push("plugins")
            .extend(subpath.split('/'));
        url.set_query(query.filter(|q| !q.is_empty()));

        Ok(url.into())
    }

    /// Forward a plugin call. POST bodies are passed along with the caller's
    /// content type, or `application/json` when it sent none.
    pub async fn forward_plugin_request(
        &self,
        method: Method,
        subpath: &str,
        query: Option<&str>,
        content_type: Option<HeaderValue>,
        body: Bytes,
    ) -> Result<reqwest::Response, ProxyError> {
        let url = self.plugin_url(subpath, query)?;

        let mut request = self
            .http
            .request(method.clone(), url.as_str())
            .timeout(self.proxy_timeout);

        if method == Method::POST {
            let content_type =
                content_type.unwrap_or_else(|| HeaderValue::from_static("application/json"));
            request = request.header(header::CONTENT_TYPE, content_type).body(body);
        }

        request.send().await.map_err(|e| ProxyError::Upstream {
            url: url.clone(),
            message: error_chain(&e),
        })
    }
}

#[async_trait]
impl MetricsSource for MosdnsClient {
    async fn fetch_metrics_text(&self) -> Result<String, FetchError> {
        let url = &self.metrics_url;

        let response = self
            .http
            .get(url.as_str())
            .timeout(self.fetch_timeout)
            .send()
            .await
            .map_err(|e| FetchError::Unreachable {
                url: url.clone(),
                message: error_chain(&e),
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::Status {
                url: url.clone(),
                status: status.as_u16(),
            });
        }

        response.text().await.map_err(|e| FetchError::Read {
            url: url.clone(),
            message: error_chain(&e),
        })
    }

    fn endpoint(&self) -> &str {
        &self.metrics_url
    }
}

// ----------------------------------------------------------------------------
// 12.3 Response Mirroring
// ----------------------------------------------------------------------------

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Turn the backend's answer into ours: same status, same end-to-end headers,
/// body streamed through as-is.
pub fn mirror_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in upstream_headers.iter() {
        if is_hop_by_hop(name) || *name == header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    if !headers.contains_key(header::CONTENT_TYPE) {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
    }

    response
}

// ============================================================================
// SECTION 13: DASHBOARD BACKGROUND STORE
// ============================================================================
// At most one custom background image lives in the uploads directory, named
// `custom_background.<ext>`. Uploading replaces it, removing deletes it.
// ============================================================================

/// Answer of `GET /api/background_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundStatus {
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl BackgroundStatus {
    fn from_current(current: Option<String>) -> Self {
        match current {
            Some(filename) => Self {
                status: "custom".into(),
                url: Some(background_url(&filename)),
            },
            None => Self {
                status: "default".into(),
                url: None,
            },
        }
    }
}

/// Answer of the upload and remove endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundUpdate {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn background_url(filename: &str) -> String {
    format!("/backgrounds/{}", filename)
}

#[derive(Debug, Clone)]
pub struct BackgroundStore {
    dir: PathBuf,
}

impl BackgroundStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lower-cased extension of an upload, if it is an accepted image type.
    pub fn allowed_extension(filename: &str) -> Option<String> {
        let (_, ext) = filename.rsplit_once('.')?;
        let ext = ext.to_ascii_lowercase();
        BACKGROUND_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
    }

    fn candidates(&self) -> impl Iterator<Item = (String, PathBuf)> + '_ {
        BACKGROUND_EXTENSIONS.iter().map(move |ext| {
            let filename = format!("{}.{}", BACKGROUND_STEM, ext);
            let path = self.dir.join(&filename);
            (filename, path)
        })
    }

    /// File name of the stored background, if any.
    pub async fn current(&self) -> Option<String> {
        for (filename, path) in self.candidates() {
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                if meta.is_file() {
                    return Some(filename);
                }
            }
        }
        None
    }

    /// Store `data` as the new background and drop whatever was there before.
    /// Returns the stored file name.
    pub async fn replace(&self, ext: &str, data: &[u8]) -> Result<String, BackgroundError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        self.remove().await?;

        let filename = format!("{}.{}", BACKGROUND_STEM, ext);
        tokio::fs::write(self.dir.join(&filename), data).await?;
        Ok(filename)
    }

    /// Delete the stored background. Returns the removed file name.
    pub async fn remove(&self) -> Result<Option<String>, BackgroundError> {
        let mut removed = None;
        for (filename, path) in self.candidates() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed = Some(filename),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }
}

// ============================================================================
// SECTION 14: HTTP SERVER
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 Shared State
// ----------------------------------------------------------------------------

pub struct AppState {
    client: Arc<MosdnsClient>,
    source: Arc<dyn MetricsSource>,
    backgrounds: BackgroundStore,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("client", &self.client)
            .field("source", &self.source.endpoint())
            .field("backgrounds", &self.backgrounds)
            .finish()
    }
}

impl AppState {
    pub fn new(client: MosdnsClient) -> Self {
        let client = Arc::new(client);
        Self {
            source: client.clone(),
            client,
            backgrounds: BackgroundStore::new(DEFAULT_UPLOADS_DIR),
        }
    }

    pub fn with_backgrounds(mut self, backgrounds: BackgroundStore) -> Self {
        self.backgrounds = backgrounds;
        self
    }

    /// Replace where status requests read their metrics from
    pub fn with_source(mut self, source: Arc<dyn MetricsSource>) -> Self {
        self.source = source;
        self
    }
}

// ----------------------------------------------------------------------------
// 14.2 Router
// ----------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    let backgrounds = ServeDir::new(state.backgrounds.dir());

    Router::new()
        .route("/", get(index_handler))
        .route("/api/mosdns_status", get(status_handler))
        .route(
            "/plugins/*subpath",
            get(plugin_proxy_handler).post(plugin_proxy_handler),
        )
        .route("/api/background_status", get(background_status_handler))
        .route(
            "/api/upload_background",
            post(upload_background_handler).layer(DefaultBodyLimit::max(MAX_BACKGROUND_BYTES)),
        )
        .route("/api/remove_background", post(remove_background_handler))
        .nest_service("/backgrounds", backgrounds)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ----------------------------------------------------------------------------
// 14.3 Handlers
// ----------------------------------------------------------------------------

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<MetricsSummary>, FetchError> {
    let start = Instant::now();

    let text = state.source.fetch_metrics_text().await.map_err(|e| {
        error!(target: "mosdns_panel::fetch", endpoint = state.source.endpoint(), error = %e, "Metrics scrape failed");
        e
    })?;

    let summary = parse_metrics(&text);

    debug!(
        target: "mosdns_panel::status",
        caches = summary.caches.len(),
        bytes = text.len(),
        duration_us = start.elapsed().as_micros() as u64,
        "Status summary built"
    );

    Ok(Json(summary))
}

async fn plugin_proxy_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    UrlPath(subpath): UrlPath<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    debug!(
        target: "mosdns_panel::proxy",
        method = %method,
        subpath = %subpath,
        "Proxying request to /plugins/{}",
        subpath
    );

    let content_type = headers.get(header::CONTENT_TYPE).cloned();

    let upstream = state
        .client
        .forward_plugin_request(method, &subpath, query.as_deref(), content_type, body)
        .await
        .map_err(|e| {
            error!(target: "mosdns_panel::proxy", error = %e, "Plugin request failed");
            e
        })?;

    Ok(mirror_response(upstream))
}

async fn background_status_handler(State(state): State<Arc<AppState>>) -> Json<BackgroundStatus> {
    Json(BackgroundStatus::from_current(state.backgrounds.current().await))
}

async fn upload_background_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<BackgroundUpdate>, BackgroundError> {
    let malformed = |e: axum::extract::multipart::MultipartError| BackgroundError::Multipart {
        message: e.to_string(),
    };

    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        if field.name() != Some(BACKGROUND_FIELD) {
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_string();
        if filename.is_empty() {
            return Err(BackgroundError::EmptyFilename);
        }
        let ext = BackgroundStore::allowed_extension(&filename).ok_or_else(|| {
            BackgroundError::UnsupportedType {
                filename: filename.clone(),
                allowed: BACKGROUND_EXTENSIONS.join(", "),
            }
        })?;

        let data = field.bytes().await.map_err(malformed)?;
        let stored = state.backgrounds.replace(&ext, &data).await.map_err(|e| {
            error!(target: "mosdns_panel::background", error = %e, "Failed to store background");
            e
        })?;

        info!(
            target: "mosdns_panel::background",
            upload = %filename,
            stored = %stored,
            bytes = data.len(),
            "Custom background updated"
        );

        return Ok(Json(BackgroundUpdate {
            success: true,
            url: Some(background_url(&stored)),
            message: None,
        }));
    }

    Err(BackgroundError::MissingFile {
        field: BACKGROUND_FIELD,
    })
}

async fn remove_background_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<BackgroundUpdate>, BackgroundError> {
    let removed = state.backgrounds.remove().await?;

    let message = match &removed {
        Some(filename) => {
            info!(target: "mosdns_panel::background", removed = %filename, "Custom background removed");
            None
        }
        None => Some("no custom background to remove".to_string()),
    };

    Ok(Json(BackgroundUpdate {
        success: true,
        url: None,
        message,
    }))
}

// ----------------------------------------------------------------------------
// 14.4 Server Lifecycle
// ----------------------------------------------------------------------------

/// Bind the listener and serve until Ctrl-C or SIGTERM.
pub async fn run_server(config: PanelConfig) -> PanelResult<()> {
    let client = MosdnsClient::new(&config.backend)?;
    tokio::fs::create_dir_all(&config.server.uploads_dir).await?;
    let backgrounds = BackgroundStore::new(&config.server.uploads_dir);
    let state = Arc::new(AppState::new(client).with_backgrounds(backgrounds));
    let router = build_router(state);

    let listener =
        TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;

    info!(
        target: "mosdns_panel::server",
        address = %config.server.bind_address(),
        "Starting MosDNS panel server"
    );
    info!(
        target: "mosdns_panel::server",
        admin_url = %config.backend.admin_base(),
        metrics_url = %config.backend.metrics_url(),
        "MosDNS admin API"
    );
    info!(
        target: "mosdns_panel::server",
        uploads_dir = %config.server.uploads_dir.display(),
        "Background uploads directory"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(target: "mosdns_panel::server", "Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(target: "mosdns_panel::server", error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(target: "mosdns_panel::server", error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!(target: "mosdns_panel::server", "Shutdown signal received");
}

// ============================================================================
// SECTION 15: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// MosDNS Panel CLI
#[derive(Parser, Debug)]
#[command(
    name = "mosdns-panel",
    author = "AIOps Team",
    version,
    about = "Status dashboard and plugin API gateway for MosDNS"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "MOSDNS_PANEL_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Listen address
    #[arg(long, env = "HOST")]
    pub host: Option<String>,

    /// Listen port
    #[arg(short, long, env = "FLASK_PORT")]
    pub port: Option<u16>,

    /// MosDNS admin API base URL
    #[arg(long, env = "MOSDNS_ADMIN_URL")]
    pub admin_url: Option<String>,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            host: self.host.clone(),
            port: self.port,
            admin_url: self.admin_url.clone(),
            log_level: self.log_level.clone(),
            debug: self.debug,
        }
    }
}

/// Available subcommands
#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Run the HTTP server (default)
    Serve,

    /// Scrape MosDNS once and print the summary as JSON
    Scrape,

    /// Parse a metrics exposition file and print the summary as JSON
    Parse {
        /// File to read, `-` for stdin
        input: PathBuf,
    },

    /// Validate configuration
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

// ----------------------------------------------------------------------------
// 15.2 Command Handlers
// ----------------------------------------------------------------------------

/// Defaults, file (when present), environment, then CLI flags.
pub fn load_config(cli: &Cli) -> Result<PanelConfig, ConfigError> {
    let path = cli.config.exists().then_some(cli.config.as_path());
    let mut config = PanelConfig::layered(path)?;
    config.apply_overrides(&cli.overrides());
    config.validate()?;
    Ok(config)
}

fn handle_validate(cli: &Cli, verbose: bool) -> PanelResult<()> {
    if cli.config.exists() {
        println!("Validating configuration file: {}", cli.config.display());
    } else {
        println!(
            "Configuration file {} not found, validating defaults and environment",
            cli.config.display()
        );
    }

    let config = load_config(cli)?;
    println!("Configuration is valid");

    if verbose {
        println!();
        match toml::to_string_pretty(&config) {
            Ok(s) => println!("{}", s),
            Err(e) => println!("Failed to serialize: {}", e),
        }
    }

    println!();
    println!("  • Listen address: {}", config.server.bind_address());
    println!("  • MosDNS admin API: {}", config.backend.admin_base());
    println!("  • Metrics endpoint: {}", config.backend.metrics_url());
    println!("  • Log level: {}", config.logging.level);

    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> PanelResult<()> {
    let config_str = PanelConfig::generate_default_config()?;

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

fn handle_parse(input: &Path) -> PanelResult<()> {
    let text = if input.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        fs::read_to_string(input)?
    };

    print_summary(&parse_metrics(&text))
}

async fn handle_scrape(config: &PanelConfig) -> PanelResult<()> {
    let client = MosdnsClient::new(&config.backend)?;
    let text = client.fetch_metrics_text().await?;
    print_summary(&parse_metrics(&text))
}

fn print_summary(summary: &MetricsSummary) -> PanelResult<()> {
    let json = serde_json::to_string_pretty(summary)
        .map_err(|e| PanelError::Internal(format!("Failed to serialize summary: {}", e)))?;
    println!("{}", json);
    Ok(())
}

fn handle_version() {
    println!("{} v{}", PANEL_FULL_NAME, PANEL_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("License: MIT");
}

// ============================================================================
// SECTION 16: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need configuration or logging
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config = load_config(&cli)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    init_logging(&config.logging)?;

    match &cli.command {
        Some(Commands::Parse { input }) => handle_parse(input)?,
        Some(Commands::Scrape) => handle_scrape(&config).await?,
        Some(Commands::Serve) | None => {
            info!("{} v{}", PANEL_FULL_NAME, PANEL_VERSION);
            run_server(config).await?;
        }
        Some(Commands::Version | Commands::GenerateConfig { .. } | Commands::Validate { .. }) => {}
    }

    Ok(())
}

// ============================================================================
// SECTION 17: CONFIGURATION & CLI TESTS
// ============================================================================


// ============================================================================
// SECTION 18: GATEWAY & SERVER TESTS
// ============================================================================
