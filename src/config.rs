//! Configuration options recognized by the bridge (spec.md §6) and the
//! `log4rs` bootstrap used by standalone binaries and tests, adapted from
//! the teacher's `demos/mock.rs::init_logger`.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub port_range_end: u16,
    pub connection_timeout: Duration,
    pub watchdog_timeout: Duration,
    pub max_depth: u32,
    pub default_max_children: u32,
    pub data_dir: PathBuf,
    pub project_root: PathBuf,
    pub debug: bool,
}

/// Hard upper bound on `inspect_variable` depth, regardless of `max_depth`.
pub const ABSOLUTE_MAX_DEPTH: u32 = 10;

impl Default for Config {
    fn default() -> Self {
        let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Config {
            port: 9003,
            port_range_end: 9010,
            connection_timeout: Duration::from_secs(30),
            watchdog_timeout: Duration::from_secs(5 * 60),
            max_depth: 3,
            default_max_children: 20,
            data_dir: cwd.join(".xdebug-mcp"),
            project_root: cwd,
            debug: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable. A parse failure is logged
    /// and the default is kept, mirroring the teacher's permissive handling
    /// of unrecognized header fields rather than aborting.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(v) = env_u16("XDEBUG_BRIDGE_PORT") {
            config.port = v;
        }
        if let Some(v) = env_u16("XDEBUG_BRIDGE_PORT_RANGE_END") {
            config.port_range_end = v;
        }
        if let Some(v) = env_u64("XDEBUG_BRIDGE_CONNECTION_TIMEOUT_MS") {
            config.connection_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("XDEBUG_BRIDGE_WATCHDOG_TIMEOUT_MS") {
            config.watchdog_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_u32("XDEBUG_BRIDGE_MAX_DEPTH") {
            config.max_depth = v.min(ABSOLUTE_MAX_DEPTH);
        }
        if let Some(v) = env_u32("XDEBUG_BRIDGE_DEFAULT_MAX_CHILDREN") {
            config.default_max_children = v;
        }
        if let Ok(v) = env::var("XDEBUG_BRIDGE_DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("XDEBUG_BRIDGE_PROJECT_ROOT") {
            config.project_root = PathBuf::from(v);
        }
        if let Ok(v) = env::var("XDEBUG_BRIDGE_DEBUG") {
            config.debug = v == "1" || v.eq_ignore_ascii_case("true");
        }

        config
    }
}

fn env_u16(name: &str) -> Option<u16> {
    match env::var(name) {
        Ok(v) => match v.parse() {
            Ok(n) => Some(n),
            Err(_) => {
                log::warn!("{name}={v:?} is not a valid port number, ignoring");
                None
            }
        },
        Err(_) => None,
    }
}

fn env_u32(name: &str) -> Option<u32> {
    match env::var(name) {
        Ok(v) => match v.parse() {
            Ok(n) => Some(n),
            Err(_) => {
                log::warn!("{name}={v:?} is not a valid integer, ignoring");
                None
            }
        },
        Err(_) => None,
    }
}

fn env_u64(name: &str) -> Option<u64> {
    match env::var(name) {
        Ok(v) => match v.parse() {
            Ok(n) => Some(n),
            Err(_) => {
                log::warn!("{name}={v:?} is not a valid integer, ignoring");
                None
            }
        },
        Err(_) => None,
    }
}

/// Install a simple console `log4rs` config. Standalone binaries and
/// examples embedding this crate can call this instead of rolling their own;
/// the library never installs a logger implicitly.
pub fn init_logging(level: log::LevelFilter) {
    use log4rs::append::console::ConsoleAppender;
    use log4rs::config::{Appender, Config as LogConfig, Root};
    use log4rs::encode::pattern::PatternEncoder;

    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d(%H:%M:%S)} {l} {t} - {m}\n")))
        .build();

    let config = LogConfig::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(level));

    if let Ok(config) = config {
        let _ = log4rs::init_config(config);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_matches_spec_table() {
        let config = Config::default();
        assert_eq!(config.port, 9003);
        assert_eq!(config.port_range_end, 9010);
        assert_eq!(config.connection_timeout, Duration::from_secs(30));
        assert_eq!(config.watchdog_timeout, Duration::from_secs(300));
        assert_eq!(config.max_depth, 3);
        assert_eq!(config.default_max_children, 20);
        assert!(!config.debug);
    }

    #[test]
    fn max_depth_is_clamped_to_absolute_bound() {
        // simulate what from_env would do without touching process env in a
        // test that may run concurrently with others
        let mut config = Config::default();
        let requested: u32 = 99;
        config.max_depth = requested.min(ABSOLUTE_MAX_DEPTH);
        assert_eq!(config.max_depth, ABSOLUTE_MAX_DEPTH);
    }
}
