//! CLI argument parsing for sockprobe

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

use crate::scenario::ScenarioKind;

#[derive(Parser, Debug)]
#[command(name = "sockprobe")]
#[command(version)]
#[command(about = "Test driver for client-server networking applications", long_about = None)]
pub struct Cli {
    /// Print debug messages
    #[arg(short, long)]
    pub debug: bool,

    /// List test cases
    #[arg(short = 'l', long = "list-testcases")]
    pub list_testcases: bool,

    /// List scenarios
    #[arg(long = "list-scenarios")]
    pub list_scenarios: bool,

    /// List dependencies of the selected test cases
    #[arg(long)]
    pub deps: bool,

    /// Print the property registry as JSON
    #[arg(long = "list-properties")]
    pub list_properties: bool,

    /// Directory receiving one JSON document per test case
    #[arg(long, value_name = "DIR", default_value = "./json-output/")]
    pub outdir: PathBuf,

    /// Data directory holding resolver configuration and test cases
    #[arg(long = "data-dir", value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Comma-separated test cases to run (default: all)
    pub testcases: Option<String>,

    /// Comma-separated scenarios to run (default: all)
    pub scenarios: Option<String>,
}

/// Split a comma-separated list, dropping empty items
pub fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

impl Cli {
    pub fn testcase_filter(&self) -> Option<Vec<String>> {
        self.testcases.as_deref().map(split_list)
    }

    pub fn scenario_filter(&self) -> Result<Option<Vec<ScenarioKind>>> {
        let Some(list) = self.scenarios.as_deref() else {
            return Ok(None);
        };
        split_list(list)
            .iter()
            .map(|name| {
                ScenarioKind::from_name(name).ok_or_else(|| anyhow!("Unknown scenario: {}", name))
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["sockprobe"]);
        assert!(!cli.debug);
        assert!(!cli.list_testcases && !cli.deps);
        assert_eq!(cli.outdir, PathBuf::from("./json-output/"));
        assert!(cli.testcase_filter().is_none());
        assert!(cli.scenario_filter().unwrap().is_none());
    }

    #[test]
    fn test_cli_positional_filters() {
        let cli = Cli::parse_from(["sockprobe", "curl,wget", "dualstack,v6dropped"]);
        assert_eq!(
            cli.testcase_filter(),
            Some(vec!["curl".to_string(), "wget".to_string()])
        );
        assert_eq!(
            cli.scenario_filter().unwrap(),
            Some(vec![ScenarioKind::Dualstack, ScenarioKind::V6Dropped])
        );
    }

    #[test]
    fn test_cli_unknown_scenario() {
        let cli = Cli::parse_from(["sockprobe", "curl", "nat64"]);
        let err = cli.scenario_filter().unwrap_err();
        assert!(err.to_string().contains("nat64"));
    }

    #[test]
    fn test_cli_short_flags() {
        let cli = Cli::parse_from(["sockprobe", "-d", "-l"]);
        assert!(cli.debug);
        assert!(cli.list_testcases);
        assert!(!cli.list_scenarios);
    }

    #[test]
    fn test_cli_paths() {
        let cli = Cli::parse_from([
            "sockprobe",
            "--data-dir",
            "/srv/data",
            "--config",
            "probe.toml",
            "--outdir",
            "out",
        ]);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/srv/data")));
        assert_eq!(cli.config, Some(PathBuf::from("probe.toml")));
        assert_eq!(cli.outdir, PathBuf::from("out"));
    }

    #[test]
    fn test_split_list_skips_empty_items() {
        assert_eq!(split_list("a,,b, c,"), vec!["a", "b", "c"]);
    }
}
