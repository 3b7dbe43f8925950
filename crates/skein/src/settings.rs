//! Engine configuration.
//!
//! Every tunable has a default; a TOML file and `SKEIN__`-prefixed
//! environment variables can override them. Business logic never reads config
//! ambiently - policies are materialized once and passed down as plain
//! values.

use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::dedup::DedupPolicy;
use crate::error::EngineError;
use crate::lifecycle::CompactionPolicy;
use crate::merge::MergePolicy;
use crate::snapshot::RefreshPolicy;

/// Environment variable prefix, e.g. `SKEIN__REFRESH_INTERVAL_SECS=10`.
const ENV_PREFIX: &str = "SKEIN";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the dashboard server (REST + event stream).
    pub base_url: String,

    /// Snapshot refresh interval, seconds.
    pub refresh_interval_secs: u64,

    /// Content-dedup timestamp window, milliseconds.
    pub dedup_window_ms: i64,

    /// Content-dedup tail reach when timestamps are unavailable.
    pub dedup_tail_window: usize,

    /// How long a deactivated session keeps its realtime buffer, seconds.
    pub grace_window_secs: u64,

    /// Merged transcript cap; oldest entries evicted past this.
    pub buffer_cap: usize,

    /// Minimum fractional snapshot shrink treated as compaction.
    pub compaction_drop_ratio: f64,

    /// Message-count floor below which shrinks are never compaction.
    pub compaction_floor: usize,

    /// Client-side timeout for the liveness probe, seconds.
    pub probe_timeout_secs: u64,

    /// Rendered tool-call argument length cap, characters.
    pub tool_args_truncate: usize,

    /// `limit` parameter for history fetches.
    pub history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8790".to_string(),
            refresh_interval_secs: 30,
            dedup_window_ms: 10_000,
            dedup_tail_window: 5,
            grace_window_secs: 5,
            buffer_cap: 500,
            compaction_drop_ratio: 0.4,
            compaction_floor: 10,
            probe_timeout_secs: 5,
            tool_args_truncate: 120,
            history_limit: 1000,
        }
    }
}

impl EngineConfig {
    /// Load configuration: defaults, then an optional TOML file, then
    /// environment overrides.
    pub fn load(config_file: Option<&Path>) -> Result<Self, EngineError> {
        let mut builder = Config::builder();

        if let Some(path) = config_file {
            builder = builder.add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        let built = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        Ok(built.try_deserialize()?)
    }

    pub fn dedup_policy(&self) -> DedupPolicy {
        DedupPolicy {
            window_ms: self.dedup_window_ms,
            tail_window: self.dedup_tail_window,
        }
    }

    pub fn merge_policy(&self) -> MergePolicy {
        MergePolicy {
            buffer_cap: self.buffer_cap,
        }
    }

    pub fn refresh_policy(&self) -> RefreshPolicy {
        RefreshPolicy {
            interval_ms: (self.refresh_interval_secs * 1_000) as i64,
        }
    }

    pub fn compaction_policy(&self) -> CompactionPolicy {
        CompactionPolicy {
            drop_ratio: self.compaction_drop_ratio,
            floor: self.compaction_floor,
        }
    }
}
