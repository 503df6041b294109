//! Suite configuration
//!
//! Every field has a default, so a TOML file only needs the values it
//! changes:
//!
//! ```toml
//! data_dir = "/usr/share/sockprobe"
//!
//! [preference]
//! ordering_slack = 0.2
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tracer polling and logging behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    /// Log `close` on descriptors that are not tracked sockets
    pub log_untracked_close: bool,
    /// First sleep between empty polling rounds
    pub initial_backoff_ms: u64,
    /// Cap for the doubling sleep
    pub max_backoff_ms: u64,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            log_untracked_close: false,
            initial_backoff_ms: 1,
            max_backoff_ms: 500,
        }
    }
}

impl TracerConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Deadlines for the scenario startup sequence, in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub server_listen: f64,
    pub second_listen: f64,
    pub client: f64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            server_listen: 35.0,
            second_listen: 5.0,
            client: 20.0,
        }
    }
}

/// Seconds as a duration; values rejected by `Timeouts::validate` map to zero
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl Timeouts {
    pub fn server_listen(&self) -> Duration {
        seconds(self.server_listen)
    }

    pub fn second_listen(&self) -> Duration {
        seconds(self.second_listen)
    }

    pub fn client(&self) -> Duration {
        seconds(self.client)
    }

    /// Reject timeouts that are negative, not finite or out of range
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("server_listen", self.server_listen),
            ("second_listen", self.second_listen),
            ("client", self.client),
        ] {
            if let Err(e) = Duration::try_from_secs_f64(value) {
                bail!("Invalid timeout {} = {}: {}", name, value, e);
            }
        }
        Ok(())
    }
}

/// Tolerances of the IPv6 preference check, in seconds
///
/// These absorb scheduling jitter between the traced processes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferenceThresholds {
    /// How much later than the fallback the preferred attempt may start
    pub ordering_slack: f64,
    /// Shortest preferred-attempt lifetime that counts as a real delay
    pub min_delay: f64,
}

impl Default for PreferenceThresholds {
    fn default() -> Self {
        Self {
            ordering_slack: 0.1,
            min_delay: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuiteConfig {
    /// Resolver configuration directory; test cases live below it
    pub data_dir: PathBuf,
    /// Program run in front of each role script
    pub wrapper: Option<String>,
    pub timeouts: Timeouts,
    pub preference: PreferenceThresholds,
    pub tracer: TracerConfig,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            wrapper: Some("wrapresolve".to_string()),
            timeouts: Timeouts::default(),
            preference: PreferenceThresholds::default(),
            tracer: TracerConfig::default(),
        }
    }
}

impl SuiteConfig {
    /// Load a TOML configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config
            .timeouts
            .validate()
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Directory holding one subdirectory per test case
    pub fn testcase_dir(&self) -> PathBuf {
        self.data_dir.join("testcases").join("client-server")
    }

    /// Role script of a test case
    pub fn script(&self, testcase: &str, origin: &str) -> PathBuf {
        self.testcase_dir().join(testcase).join(origin)
    }
}
