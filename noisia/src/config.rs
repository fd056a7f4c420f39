//! Run configuration
//!
//! Configuration is read once at startup from command-line flags, each with a
//! `NOISIA_*` environment fallback, and split into one config per workload.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use thiserror::Error;

/// Shortest terminate interval accepted
pub const MIN_TERMINATE_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{workload}: jobs must be at least {min}")]
    Jobs { workload: &'static str, min: usize },

    #[error("{workload}: {setting} must be greater than zero")]
    NotPositive {
        workload: &'static str,
        setting: &'static str,
    },

    #[error("{workload}: min {setting} must be less or equal to max {setting}")]
    Range {
        workload: &'static str,
        setting: &'static str,
    },

    #[error("terminate: interval must be at least {}ms", MIN_TERMINATE_INTERVAL.as_millis())]
    TerminateInterval,
}

fn check_jobs(workload: &'static str, jobs: usize, min: usize) -> Result<(), ConfigError> {
    if jobs < min {
        return Err(ConfigError::Jobs { workload, min });
    }
    Ok(())
}

fn check_range<T: PartialOrd + Default>(
    workload: &'static str,
    setting: &'static str,
    min: T,
    max: T,
) -> Result<(), ConfigError> {
    if min <= T::default() || max <= T::default() {
        return Err(ConfigError::NotPositive { workload, setting });
    }
    if min > max {
        return Err(ConfigError::Range { workload, setting });
    }
    Ok(())
}

fn check_positive(workload: &'static str, setting: &'static str, value: f64) -> Result<(), ConfigError> {
    if !(value.is_finite() && value > 0.0) {
        return Err(ConfigError::NotPositive { workload, setting });
    }
    Ok(())
}

/// Main run configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub conninfo: String,
    /// Default concurrency of every workload
    pub jobs: usize,
    /// Run deadline
    pub duration: Duration,
    pub log_level: LogLevel,
    /// Seed for reproducible random draws
    pub seed: Option<u64>,
    /// Drop fixture tables and exit instead of running workloads
    pub cleanup: bool,
    /// Prometheus listener address
    pub metrics_addr: Option<SocketAddr>,

    pub idle_xacts: Option<IdleXactsConfig>,
    pub wait_xacts: Option<WaitXactsConfig>,
    pub deadlocks: Option<DeadlocksConfig>,
    pub rollbacks: Option<RollbacksConfig>,
    pub temp_files: Option<TempFilesConfig>,
    pub terminate: Option<TerminateConfig>,
    pub fail_conns: Option<FailConnsConfig>,
    pub fork_conns: Option<ForkConnsConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            conninfo: String::new(),
            jobs: 1,
            duration: Duration::from_secs(10),
            log_level: LogLevel::Info,
            seed: None,
            cleanup: false,
            metrics_addr: None,
            idle_xacts: None,
            wait_xacts: None,
            deadlocks: None,
            rollbacks: None,
            temp_files: None,
            terminate: None,
            fail_conns: None,
            fork_conns: None,
        }
    }
}

impl Config {
    /// Check every enabled workload
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_jobs("noisia", self.jobs, 1)?;
        if let Some(c) = &self.idle_xacts {
            c.validate()?;
        }
        if let Some(c) = &self.wait_xacts {
            c.validate()?;
        }
        if let Some(c) = &self.deadlocks {
            c.validate()?;
        }
        if let Some(c) = &self.rollbacks {
            c.validate()?;
        }
        if let Some(c) = &self.temp_files {
            c.validate()?;
        }
        if let Some(c) = &self.terminate {
            c.validate()?;
        }
        if let Some(c) = &self.fail_conns {
            c.validate()?;
        }
        if let Some(c) = &self.fork_conns {
            c.validate()?;
        }
        Ok(())
    }

    /// Whether at least one workload is enabled
    pub fn any_workload(&self) -> bool {
        self.idle_xacts.is_some()
            || self.wait_xacts.is_some()
            || self.deadlocks.is_some()
            || self.rollbacks.is_some()
            || self.temp_files.is_some()
            || self.terminate.is_some()
            || self.fail_conns.is_some()
            || self.fork_conns.is_some()
    }
}

/// Idle transactions workload
#[derive(Debug, Clone, PartialEq)]
pub struct IdleXactsConfig {
    pub jobs: usize,
    pub naptime_min: Duration,
    pub naptime_max: Duration,
}

impl Default for IdleXactsConfig {
    fn default() -> Self {
        Self {
            jobs: 1,
            naptime_min: Duration::from_secs(5),
            naptime_max: Duration::from_secs(20),
        }
    }
}

impl IdleXactsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_jobs("idle xacts", self.jobs, 1)?;
        check_range("idle xacts", "naptime", self.naptime_min, self.naptime_max)
    }
}

/// Waiting transactions workload
#[derive(Debug, Clone, PartialEq)]
pub struct WaitXactsConfig {
    /// At least two, so that lockers wait on each other
    pub jobs: usize,
    /// Lock the fixture table even when user tables are available
    pub fixture: bool,
    pub locktime_min: Duration,
    pub locktime_max: Duration,
}

impl Default for WaitXactsConfig {
    fn default() -> Self {
        Self {
            jobs: 2,
            fixture: false,
            locktime_min: Duration::from_secs(5),
            locktime_max: Duration::from_secs(20),
        }
    }
}

impl WaitXactsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_jobs("wait xacts", self.jobs, 2)?;
        check_range("wait xacts", "lock time", self.locktime_min, self.locktime_max)
    }
}

/// Deadlocks workload
#[derive(Debug, Clone, PartialEq)]
pub struct DeadlocksConfig {
    /// Sessions in use; each attempt takes two
    pub jobs: usize,
}

impl Default for DeadlocksConfig {
    fn default() -> Self {
        Self { jobs: 2 }
    }
}

impl DeadlocksConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_jobs("deadlocks", self.jobs, 2)
    }
}

/// Rollbacks workload
#[derive(Debug, Clone, PartialEq)]
pub struct RollbacksConfig {
    pub jobs: usize,
    /// Statements per second, lower bound
    pub min_rate: f64,
    /// Statements per second, upper bound
    pub max_rate: f64,
}

impl Default for RollbacksConfig {
    fn default() -> Self {
        Self {
            jobs: 1,
            min_rate: 1.0,
            max_rate: 1.0,
        }
    }
}

impl RollbacksConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_jobs("rollbacks", self.jobs, 1)?;
        check_positive("rollbacks", "rate", self.min_rate)?;
        check_positive("rollbacks", "rate", self.max_rate)?;
        check_range("rollbacks", "rate", self.min_rate, self.max_rate)
    }
}

/// Temporary files workload
#[derive(Debug, Clone, PartialEq)]
pub struct TempFilesConfig {
    pub jobs: usize,
    /// Queries per second
    pub rate: f64,
    /// Thousands of rows in the fixture table; zero sorts `pg_class` instead
    pub scale_factor: u32,
}

impl Default for TempFilesConfig {
    fn default() -> Self {
        Self {
            jobs: 1,
            rate: 1.0,
            scale_factor: 0,
        }
    }
}

impl TempFilesConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_jobs("temp files", self.jobs, 1)?;
        check_positive("temp files", "rate", self.rate)
    }
}

/// Terminate backends workload
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TerminateConfig {
    /// Period over which `rate` backends are signalled
    pub interval: Duration,
    pub rate: u32,
    /// Cancel the running query instead of terminating the backend
    pub soft_mode: bool,
    /// Signal client backends only
    pub ignore_system: bool,
    /// Regular expressions matched against `pg_stat_activity`
    pub client_addr: Option<String>,
    pub user: Option<String>,
    pub database: Option<String>,
    pub application_name: Option<String>,
}

impl TerminateConfig {
    pub fn new(interval: Duration, rate: u32) -> Self {
        Self {
            interval,
            rate,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval < MIN_TERMINATE_INTERVAL {
            return Err(ConfigError::TerminateInterval);
        }
        if self.rate < 1 {
            return Err(ConfigError::NotPositive {
                workload: "terminate",
                setting: "rate",
            });
        }
        Ok(())
    }

    /// Pause between two signals
    pub fn naptime(&self) -> Duration {
        self.interval / self.rate.max(1)
    }
}

/// Connections exhaustion workload
#[derive(Debug, Clone, PartialEq)]
pub struct FailConnsConfig {
    /// Shortest interval between connection attempts
    pub floor: Duration,
    /// Longest interval between connection attempts
    pub ceiling: Duration,
}

impl Default for FailConnsConfig {
    fn default() -> Self {
        Self {
            floor: Duration::from_millis(50),
            ceiling: Duration::from_secs(10),
        }
    }
}

impl FailConnsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("failconns", "interval", self.floor, self.ceiling)
    }
}

/// Forced reconnection workload
#[derive(Debug, Clone, PartialEq)]
pub struct ForkConnsConfig {
    pub jobs: usize,
    /// Connections per second
    pub rate: f64,
}

impl Default for ForkConnsConfig {
    fn default() -> Self {
        Self { jobs: 1, rate: 1.0 }
    }
}

impl ForkConnsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_jobs("forkconns", self.jobs, 1)?;
        check_positive("forkconns", "rate", self.rate)
    }
}

/// Log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Parse `500ms`, `10s`, `2m`, `1h` or a bare number of seconds
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{}'", value))?;
    let seconds = match unit {
        "" | "s" => number,
        "ms" => number / 1000.0,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        _ => return Err(format!("invalid duration unit in '{}'", value)),
    };
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("invalid duration '{}': {}", value, e))
}

/// Harmful workload generator for PostgreSQL
#[derive(Debug, Parser)]
#[command(name = "noisia", version, about)]
pub struct Cli {
    /// PostgreSQL connection URL
    #[arg(long, env = "NOISIA_POSTGRES_CONNINFO")]
    pub conninfo: String,

    /// Number of workers per workload
    #[arg(long, env = "NOISIA_JOBS", default_value_t = 1)]
    pub jobs: usize,

    /// Duration of the run
    #[arg(long, env = "NOISIA_DURATION", default_value = "10s", value_parser = parse_duration)]
    pub duration: Duration,

    /// Log level
    #[arg(long, env = "NOISIA_LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Seed for reproducible random draws
    #[arg(long, env = "NOISIA_SEED")]
    pub seed: Option<u64>,

    /// Drop fixture tables left by previous runs and exit
    #[arg(long, env = "NOISIA_CLEANUP")]
    pub cleanup: bool,

    /// Address of the Prometheus metrics listener
    #[arg(long, env = "NOISIA_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Run idle transactions workload
    #[arg(long = "idle-xacts", env = "NOISIA_IDLE_XACTS")]
    pub idle_xacts: bool,

    /// Min transactions naptime
    #[arg(long = "idle-xacts.naptime-min", env = "NOISIA_IDLE_XACTS_NAPTIME_MIN", default_value = "5s", value_parser = parse_duration)]
    pub idle_xacts_naptime_min: Duration,

    /// Max transactions naptime
    #[arg(long = "idle-xacts.naptime-max", env = "NOISIA_IDLE_XACTS_NAPTIME_MAX", default_value = "20s", value_parser = parse_duration)]
    pub idle_xacts_naptime_max: Duration,

    /// Run rollbacks workload
    #[arg(long, env = "NOISIA_ROLLBACKS")]
    pub rollbacks: bool,

    /// Min rollbacks rate per second
    #[arg(long = "rollbacks.min-rate", env = "NOISIA_ROLLBACKS_MIN_RATE", default_value_t = 1.0)]
    pub rollbacks_min_rate: f64,

    /// Max rollbacks rate per second
    #[arg(long = "rollbacks.max-rate", env = "NOISIA_ROLLBACKS_MAX_RATE", default_value_t = 1.0)]
    pub rollbacks_max_rate: f64,

    /// Run waiting transactions workload
    #[arg(long = "wait-xacts", env = "NOISIA_WAIT_XACTS")]
    pub wait_xacts: bool,

    /// Lock the fixture table instead of user tables
    #[arg(long = "wait-xacts.fixture", env = "NOISIA_WAIT_XACTS_FIXTURE")]
    pub wait_xacts_fixture: bool,

    /// Min transactions locking time
    #[arg(long = "wait-xacts.locktime-min", env = "NOISIA_WAIT_XACTS_LOCKTIME_MIN", default_value = "5s", value_parser = parse_duration)]
    pub wait_xacts_locktime_min: Duration,

    /// Max transactions locking time
    #[arg(long = "wait-xacts.locktime-max", env = "NOISIA_WAIT_XACTS_LOCKTIME_MAX", default_value = "20s", value_parser = parse_duration)]
    pub wait_xacts_locktime_max: Duration,

    /// Run deadlocks workload
    #[arg(long, env = "NOISIA_DEADLOCKS")]
    pub deadlocks: bool,

    /// Run temporary files workload
    #[arg(long = "tempfiles", env = "NOISIA_TEMP_FILES")]
    pub temp_files: bool,

    /// Number of queries per second
    #[arg(long = "tempfiles.rate", env = "NOISIA_TEMP_FILES_RATE", default_value_t = 1.0)]
    pub temp_files_rate: f64,

    /// Size of the sorted table in thousands of rows, 0 sorts pg_class
    #[arg(long = "tempfiles.scale-factor", env = "NOISIA_TEMP_FILES_SCALE_FACTOR", default_value_t = 0)]
    pub temp_files_scale_factor: u32,

    /// Run terminate workload
    #[arg(long, env = "NOISIA_TERMINATE")]
    pub terminate: bool,

    /// Time interval of a single round of termination
    #[arg(long = "terminate.interval", env = "NOISIA_TERMINATE_INTERVAL", default_value = "1s", value_parser = parse_duration)]
    pub terminate_interval: Duration,

    /// Number of backends signalled per interval
    #[arg(long = "terminate.rate", env = "NOISIA_TERMINATE_RATE", default_value_t = 1)]
    pub terminate_rate: u32,

    /// Cancel queries instead of terminating backends
    #[arg(long = "terminate.soft-mode", env = "NOISIA_TERMINATE_SOFT_MODE")]
    pub terminate_soft_mode: bool,

    /// Leave system processes alone
    #[arg(long = "terminate.ignore-system", env = "NOISIA_TERMINATE_IGNORE_SYSTEM")]
    pub terminate_ignore_system: bool,

    /// Signal backends whose client address matches this regex
    #[arg(long = "terminate.client-addr", env = "NOISIA_TERMINATE_CLIENT_ADDR")]
    pub terminate_client_addr: Option<String>,

    /// Signal backends whose user matches this regex
    #[arg(long = "terminate.user", env = "NOISIA_TERMINATE_USER")]
    pub terminate_user: Option<String>,

    /// Signal backends whose database matches this regex
    #[arg(long = "terminate.database", env = "NOISIA_TERMINATE_DATABASE")]
    pub terminate_database: Option<String>,

    /// Signal backends whose application name matches this regex
    #[arg(long = "terminate.appname", env = "NOISIA_TERMINATE_APPNAME")]
    pub terminate_appname: Option<String>,

    /// Run connections exhaustion workload
    #[arg(long, env = "NOISIA_FAILCONNS")]
    pub failconns: bool,

    /// Shortest interval between connection attempts
    #[arg(long = "failconns.floor", env = "NOISIA_FAILCONNS_FLOOR", default_value = "50ms", value_parser = parse_duration)]
    pub failconns_floor: Duration,

    /// Longest interval between connection attempts
    #[arg(long = "failconns.ceiling", env = "NOISIA_FAILCONNS_CEILING", default_value = "10s", value_parser = parse_duration)]
    pub failconns_ceiling: Duration,

    /// Run queries in dedicated short-lived connections
    #[arg(long, env = "NOISIA_FORKCONNS")]
    pub forkconns: bool,

    /// Number of connections made per second
    #[arg(long = "forkconns.rate", env = "NOISIA_FORKCONNS_RATE", default_value_t = 1.0)]
    pub forkconns_rate: f64,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl Cli {
    /// Split flags into per-workload configs
    pub fn into_config(self) -> Config {
        let jobs = self.jobs;
        Config {
            conninfo: self.conninfo,
            jobs,
            duration: self.duration,
            log_level: self.log_level,
            seed: self.seed,
            cleanup: self.cleanup,
            metrics_addr: self.metrics_addr,
            idle_xacts: self.idle_xacts.then(|| IdleXactsConfig {
                jobs,
                naptime_min: self.idle_xacts_naptime_min,
                naptime_max: self.idle_xacts_naptime_max,
            }),
            wait_xacts: self.wait_xacts.then(|| WaitXactsConfig {
                jobs,
                fixture: self.wait_xacts_fixture,
                locktime_min: self.wait_xacts_locktime_min,
                locktime_max: self.wait_xacts_locktime_max,
            }),
            deadlocks: self.deadlocks.then_some(DeadlocksConfig { jobs }),
            rollbacks: self.rollbacks.then(|| RollbacksConfig {
                jobs,
                min_rate: self.rollbacks_min_rate,
                max_rate: self.rollbacks_max_rate,
            }),
            temp_files: self.temp_files.then(|| TempFilesConfig {
                jobs,
                rate: self.temp_files_rate,
                scale_factor: self.temp_files_scale_factor,
            }),
            terminate: self.terminate.then(|| TerminateConfig {
                interval: self.terminate_interval,
                rate: self.terminate_rate,
                soft_mode: self.terminate_soft_mode,
                ignore_system: self.terminate_ignore_system,
                client_addr: non_empty(self.terminate_client_addr),
                user: non_empty(self.terminate_user),
                database: non_empty(self.terminate_database),
                application_name: non_empty(self.terminate_appname),
            }),
            fail_conns: self.failconns.then(|| FailConnsConfig {
                floor: self.failconns_floor,
                ceiling: self.failconns_ceiling,
            }),
            fork_conns: self.forkconns.then(|| ForkConnsConfig {
                jobs,
                rate: self.forkconns_rate,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["noisia", "--conninfo", "postgres://localhost/postgres"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap().into_config()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.jobs, 1);
        assert_eq!(config.duration, Duration::from_secs(10));
        assert!(!config.any_workload());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("10s"), Ok(Duration::from_secs(10)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration("3"), Ok(Duration::from_secs(3)));
        assert_eq!(parse_duration("1.5s"), Ok(Duration::from_millis(1500)));
        assert!(parse_duration("ten").is_err());
        assert!(parse_duration("5d").is_err());
    }

    #[test]
    fn test_cli_defaults_per_workload() {
        let config = parse(&["--idle-xacts", "--failconns", "--terminate", "--jobs", "4"]);

        let idle = config.idle_xacts.unwrap();
        assert_eq!(idle.jobs, 4);
        assert_eq!(idle.naptime_min, Duration::from_secs(5));
        assert_eq!(idle.naptime_max, Duration::from_secs(20));

        let failconns = config.fail_conns.unwrap();
        assert_eq!(failconns.floor, Duration::from_millis(50));
        assert_eq!(failconns.ceiling, Duration::from_secs(10));

        let terminate = config.terminate.unwrap();
        assert_eq!(terminate.naptime(), Duration::from_secs(1));
        assert_eq!(terminate.user, None);

        assert!(config.rollbacks.is_none());
    }

    #[test]
    fn test_cli_workload_settings() {
        let config = parse(&[
            "--rollbacks",
            "--rollbacks.min-rate",
            "2",
            "--rollbacks.max-rate",
            "5",
            "--terminate",
            "--terminate.interval",
            "2s",
            "--terminate.rate",
            "4",
            "--terminate.soft-mode",
            "--terminate.user",
            "^app",
            "--terminate.appname",
            "",
            "--tempfiles",
            "--tempfiles.scale-factor",
            "10",
            "--seed",
            "42",
        ]);

        let rollbacks = config.rollbacks.unwrap();
        assert_eq!((rollbacks.min_rate, rollbacks.max_rate), (2.0, 5.0));

        let terminate = config.terminate.as_ref().unwrap();
        assert!(terminate.soft_mode);
        assert_eq!(terminate.user.as_deref(), Some("^app"));
        assert_eq!(terminate.application_name, None);
        assert_eq!(terminate.naptime(), Duration::from_millis(500));

        assert_eq!(config.temp_files.unwrap().scale_factor, 10);
        assert_eq!(config.seed, Some(42));
    }

    #[test]
    fn test_validate_ranges() {
        let idle = IdleXactsConfig {
            jobs: 1,
            naptime_min: Duration::from_secs(10),
            naptime_max: Duration::from_secs(5),
        };
        assert_eq!(
            idle.validate(),
            Err(ConfigError::Range {
                workload: "idle xacts",
                setting: "naptime"
            })
        );

        let idle = IdleXactsConfig {
            naptime_min: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(idle.validate(), Err(ConfigError::NotPositive { .. })));

        let rollbacks = RollbacksConfig {
            min_rate: 5.0,
            max_rate: 1.0,
            ..Default::default()
        };
        assert!(matches!(rollbacks.validate(), Err(ConfigError::Range { .. })));

        let failconns = FailConnsConfig {
            floor: Duration::from_secs(1),
            ceiling: Duration::from_millis(1),
        };
        assert!(failconns.validate().is_err());
    }

    #[test]
    fn test_validate_jobs() {
        assert_eq!(
            DeadlocksConfig { jobs: 1 }.validate(),
            Err(ConfigError::Jobs {
                workload: "deadlocks",
                min: 2
            })
        );
        let wait = WaitXactsConfig {
            jobs: 1,
            ..Default::default()
        };
        assert!(wait.validate().is_err());
        assert!(WaitXactsConfig::default().validate().is_ok());

        let config = Config {
            deadlocks: Some(DeadlocksConfig { jobs: 1 }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_terminate() {
        assert_eq!(
            TerminateConfig::new(Duration::from_millis(5), 1).validate(),
            Err(ConfigError::TerminateInterval)
        );
        assert!(TerminateConfig::new(Duration::from_secs(1), 0).validate().is_err());
        assert!(TerminateConfig::new(Duration::from_secs(1), 3).validate().is_ok());
    }

    #[test]
    fn test_validate_rates() {
        let forkconns = ForkConnsConfig {
            jobs: 1,
            rate: 0.0,
        };
        assert!(forkconns.validate().is_err());
        let temp_files = TempFilesConfig {
            rate: f64::NAN,
            ..Default::default()
        };
        assert!(temp_files.validate().is_err());
    }
}
