//! Command-line and environment configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use clusterset_common::Error;
use clusterset_rbac::DEFAULT_APPLY_CONCURRENCY;

/// Keeps cluster-set admin/view RoleBindings in every member namespace
#[derive(Parser, Debug, Clone)]
#[command(name = "clusterset-operator", version, about, long_about = None)]
pub struct Config {
    /// Seconds between RoleBinding sync passes
    #[arg(long, env = "CLUSTERSET_SYNC_PERIOD_SECS", default_value_t = 60)]
    pub sync_period_secs: u64,

    /// Seconds between refreshes of the RBAC-derived access caches
    #[arg(long, env = "CLUSTERSET_ACCESS_REFRESH_SECS", default_value_t = 30)]
    pub access_refresh_secs: u64,

    /// Maximum concurrent RoleBinding writes within one pass
    #[arg(
        long,
        env = "CLUSTERSET_APPLY_CONCURRENCY",
        default_value_t = DEFAULT_APPLY_CONCURRENCY
    )]
    pub apply_concurrency: usize,

    /// Name of the set every managed cluster belongs to
    #[arg(long, env = "CLUSTERSET_GLOBAL_SET", default_value = "global")]
    pub global_set_name: String,

    /// Path to a kubeconfig; in-cluster configuration is inferred when unset
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "CLUSTERSET_PRETTY_LOGS")]
    pub pretty_logs: bool,
}

impl Config {
    /// Reject values the operator cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.sync_period_secs == 0 {
            return Err(Error::validation_for_field(
                "--sync-period-secs",
                "must be greater than zero",
            ));
        }
        if self.access_refresh_secs == 0 {
            return Err(Error::validation_for_field(
                "--access-refresh-secs",
                "must be greater than zero",
            ));
        }
        if self.apply_concurrency == 0 {
            return Err(Error::validation_for_field(
                "--apply-concurrency",
                "must be at least 1",
            ));
        }
        if self.global_set_name.trim().is_empty() {
            return Err(Error::validation_for_field(
                "--global-set-name",
                "must not be empty",
            ));
        }
        Ok(())
    }

    /// Period of the sync loop
    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period_secs)
    }

    /// Period of the access cache refresher
    pub fn access_refresh_period(&self) -> Duration {
        Duration::from_secs(self.access_refresh_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(args: &[&str]) -> Config {
        let argv = std::iter::once("clusterset-operator").chain(args.iter().copied());
        Config::try_parse_from(argv).expect("arguments should parse")
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert_eq!(config.sync_period(), Duration::from_secs(60));
        assert_eq!(config.access_refresh_period(), Duration::from_secs(30));
        assert_eq!(config.apply_concurrency, 16);
        assert_eq!(config.global_set_name, "global");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = parse(&[
            "--sync-period-secs",
            "5",
            "--apply-concurrency",
            "2",
            "--global-set-name",
            "everything",
            "--kubeconfig",
            "/tmp/kubeconfig",
        ]);
        assert_eq!(config.sync_period_secs, 5);
        assert_eq!(config.apply_concurrency, 2);
        assert_eq!(config.global_set_name, "everything");
        assert_eq!(config.kubeconfig, Some(PathBuf::from("/tmp/kubeconfig")));
    }

    #[rstest]
    #[case::zero_sync_period(&["--sync-period-secs", "0"], "--sync-period-secs")]
    #[case::zero_refresh(&["--access-refresh-secs", "0"], "--access-refresh-secs")]
    #[case::zero_concurrency(&["--apply-concurrency", "0"], "--apply-concurrency")]
    #[case::blank_global_set(&["--global-set-name", " "], "--global-set-name")]
    fn test_validate_rejects(#[case] args: &[&str], #[case] field: &str) {
        let err = parse(args).validate().unwrap_err();
        assert_eq!(err.context(), Some(field));
    }
}
