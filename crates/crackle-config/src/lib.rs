use crackle_device_api::DeviceType;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Generic(#[from] anyhow::Error),
    #[error("invalid backoff `{0}` (expected e.g. \"100ms..2s\")")]
    Backoff(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceCfg {
    #[serde(default)]
    pub kind: DeviceType, // "cpu" | "gpu" | "any"
    #[serde(default)]
    pub max_devices: u32, // 0 = all matching devices
    #[serde(default)]
    pub lanes: Option<u32>, // host runtime threads; default = available parallelism
    #[serde(default = "default_workgroup")]
    pub workgroup_size: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Solo,
    Tcp,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterCfg {
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub rank: usize,
    #[serde(default = "default_world_size")]
    pub world_size: usize,
    #[serde(default = "default_coordinator")]
    pub coordinator: String, // host:port rank 0 listens on
    #[serde(default = "default_backoff")]
    pub connect_backoff: String, // human range like "100ms..2s"
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RuntimeCfg {
    #[serde(default)]
    pub telemetry_addr: Option<String>,
    #[serde(default)]
    pub log: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppCfg {
    #[serde(default)]
    pub device: DeviceCfg,
    #[serde(default)]
    pub cluster: ClusterCfg,
    #[serde(default)]
    pub runtime: RuntimeCfg,
}

impl Default for DeviceCfg {
    fn default() -> Self {
        Self {
            kind: DeviceType::Any,
            max_devices: 0,
            lanes: None,
            workgroup_size: default_workgroup(),
        }
    }
}

impl Default for ClusterCfg {
    fn default() -> Self {
        Self {
            transport: Transport::Solo,
            rank: 0,
            world_size: default_world_size(),
            coordinator: default_coordinator(),
            connect_backoff: default_backoff(),
            connect_attempts: default_connect_attempts(),
        }
    }
}

impl ClusterCfg {
    pub fn backoff(&self) -> Result<(Duration, Duration), ConfigError> {
        parse_backoff(&self.connect_backoff)
    }
}

fn default_workgroup() -> u64 {
    64
}
fn default_world_size() -> usize {
    1
}
fn default_coordinator() -> String {
    "127.0.0.1:7700".into()
}
fn default_backoff() -> String {
    "100ms..2s".into()
}
fn default_connect_attempts() -> u32 {
    50
}

/// Parses `"<min>..<max>"` where each side is a number with an `ms` or `s`
/// suffix.
pub fn parse_backoff(s: &str) -> Result<(Duration, Duration), ConfigError> {
    let bad = || ConfigError::Backoff(s.to_string());
    let (lo, hi) = s.split_once("..").ok_or_else(bad)?;
    let lo = parse_duration(lo.trim()).ok_or_else(bad)?;
    let hi = parse_duration(hi.trim()).ok_or_else(bad)?;
    if lo > hi {
        return Err(bad());
    }
    Ok((lo, hi))
}

fn parse_duration(s: &str) -> Option<Duration> {
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse().ok().map(Duration::from_millis);
    }
    s.strip_suffix('s')?.parse().ok().map(Duration::from_secs)
}

/// Loads `path` (optional; any format the `config` crate knows) and then
/// environment overrides such as `CRACKLE__CLUSTER__RANK=2`.
pub fn load_from_path(path: &str) -> Result<AppCfg, ConfigError> {
    let builder = config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(config::Environment::with_prefix("CRACKLE").separator("__"));
    let cfg = builder.build().map_err(|e| anyhow::anyhow!(e))?;
    let app: AppCfg = cfg.try_deserialize().map_err(|e| anyhow::anyhow!(e))?;
    app.cluster.backoff()?;
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn backoff_parses_units() {
        assert_eq!(
            parse_backoff("100ms..2s").unwrap(),
            (Duration::from_millis(100), Duration::from_secs(2))
        );
        assert!(parse_backoff("2s..1s").is_err());
        assert!(parse_backoff("fast").is_err());
        assert!(parse_backoff("1m..2m").is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = load_from_path("/nonexistent/crackle-config").unwrap();
        assert_eq!(cfg.cluster.transport, Transport::Solo);
        assert_eq!(cfg.cluster.world_size, 1);
        assert_eq!(cfg.device.kind, DeviceType::Any);
        assert_eq!(cfg.device.workgroup_size, 64);
        assert!(cfg.runtime.telemetry_addr.is_none());
    }

    #[test]
    fn file_values_override_defaults() {
        let path = std::env::temp_dir().join(format!("crackle-cfg-{}.toml", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "[device]\nkind = \"cpu\"\nlanes = 3\n\n[cluster]\ntransport = \"tcp\"\nrank = 1\nworld_size = 4\n\n[runtime]\ntelemetry_addr = \"127.0.0.1:9100\""
        )
        .unwrap();
        let cfg = load_from_path(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(cfg.device.kind, DeviceType::Cpu);
        assert_eq!(cfg.device.lanes, Some(3));
        assert_eq!(cfg.cluster.transport, Transport::Tcp);
        assert_eq!(cfg.cluster.rank, 1);
        assert_eq!(cfg.cluster.world_size, 4);
        assert_eq!(cfg.cluster.connect_attempts, 50);
        assert_eq!(cfg.runtime.telemetry_addr.as_deref(), Some("127.0.0.1:9100"));
    }
}
