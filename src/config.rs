//! Engine-level configuration, loaded from an optional TOML file. Mirrors
//! the `#[serde(default)]` + `load`/fallback shape used elsewhere in the
//! corpus for small operator-editable config files.

use anyhow::Context;
use serde::Deserialize;

fn default_tick_interval_ms() -> u64 {
    250
}

fn default_safety_seconds() -> u64 {
    crate::relay::DEFAULT_SAFETY_SECONDS
}

fn default_read_timeout_ms() -> u64 {
    1500
}

fn default_serial_glob() -> String {
    crate::connection::DEFAULT_SERIAL_GLOB.to_string()
}

fn default_baud() -> u32 {
    115_200
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Minimum spacing between tick starts. There's no hard requirement for
    /// an inter-tick delay; this bounds serial bandwidth as it permits.
    pub tick_interval_ms: u64,
    /// Default debounce window for relays that don't override it.
    pub safety_seconds: u64,
    /// Bound on a single serial read (1-2s is typical).
    pub read_timeout_ms: u64,
    /// Device glob matched against enumerated serial ports.
    pub serial_glob: String,
    /// Serial baud rate (115200 8N1 by default).
    pub baud: u32,
    /// Seconds east of UTC used to derive "local wall time" for schedule
    /// evaluation. `time::OffsetDateTime::now_local()` is unsound to call
    /// from a multi-threaded process, so the offset is configured
    /// explicitly instead of read from the OS.
    pub utc_offset_seconds: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            safety_seconds: default_safety_seconds(),
            read_timeout_ms: default_read_timeout_ms(),
            serial_glob: default_serial_glob(),
            baud: default_baud(),
            utc_offset_seconds: 0,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {path}"))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing config file {path}"))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert_eq!(c.safety_seconds, 10);
        assert!(c.tick_interval_ms > 0);
        assert_eq!(c.baud, 115_200);
        assert_eq!(c.serial_glob, crate::connection::DEFAULT_SERIAL_GLOB);
    }

    #[test]
    fn parse_overrides_serial_settings() {
        let c: Config = toml::from_str("serial_glob = \"/dev/ttyUSB[0-9]+\"\nbaud = 9600\n").unwrap();
        assert_eq!(c.serial_glob, "/dev/ttyUSB[0-9]+");
        assert_eq!(c.baud, 9600);
    }

    #[test]
    fn parse_partial_config_falls_back_to_defaults() {
        let c: Config = toml::from_str("safety_seconds = 20\n").unwrap();
        assert_eq!(c.safety_seconds, 20);
        assert_eq!(c.tick_interval_ms, default_tick_interval_ms());
    }

    #[test]
    fn parse_empty_config() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.tick_interval_ms, default_tick_interval_ms());
    }
}
