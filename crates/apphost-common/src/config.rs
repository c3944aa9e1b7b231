//! Configuration sections
//!
//! Configuration lives in a directory of TOML files, one file per section:
//! `config/servers.toml` becomes the `servers` section, `config/log.toml`
//! the `log` section and so on. The server reads `<root>/config/` and every
//! application reads `<root>/applications/<name>/config/`.
//!
//! A section that is not a table (for example the `hosts` list) is written
//! as a single key named after the file:
//!
//! ```toml
//! # applications/shop/config/hosts.toml
//! hosts = ["shop.example.com", "*.shop.example.com"]
//! ```
//!
//! Durations are human strings (`"5s"`, `"1m 30s"`) parsed with `humantime`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HostError, Result};

/// Keep-alive applied to a listener that does not configure one.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Socket timeout applied to a listener that does not configure one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval of the memory watchdog when `scale.memory_check_interval` is unset.
pub const DEFAULT_MEMORY_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Files not larger than this are served uncompressed.
pub const DEFAULT_COMPRESS_ABOVE: u64 = 256;

/// Name of the service that runs inside the master process.
pub const MASTER_SERVICE: &str = "master";

// ============================================================================
// Server sections
// ============================================================================

/// Sections read from `<root>/config/`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSections {
    /// Listening services by configured name (before port expansion)
    pub servers: BTreeMap<String, ServiceConfig>,
    pub scale: ScaleSection,
    pub log: LogSection,
    /// Sandbox defaults for applications that don't configure their own
    pub sandbox: Option<SandboxSection>,
}

impl ServerSections {
    /// Loads every `*.toml` file in `<root>/config`.
    ///
    /// A missing directory yields the defaults.
    pub fn load(root: &Path) -> Result<Self> {
        let dir = root.join("config");
        let table = load_sections(&dir)?;
        toml::Value::Table(table)
            .try_into()
            .map_err(|e| HostError::config(&dir, e.to_string()))
    }

    /// Expands `servers` into one [`Service`] per listening port.
    ///
    /// Every port of a non-master service becomes its own service named
    /// `<name><port>`; `master` keeps its name. Services are returned in name
    /// order, ports in configured order.
    pub fn services(&self, cpus: usize) -> Result<Vec<Service>> {
        let mut services = Vec::new();
        for (name, config) in &self.servers {
            let ports = config.ports.expand(cpus);
            if ports.is_empty() {
                return Err(HostError::config(
                    "servers",
                    format!("service {} has no ports", name),
                ));
            }
            for port in ports {
                let service_name = if name == MASTER_SERVICE {
                    name.clone()
                } else {
                    format!("{}{}", name, port)
                };
                services.push(Service {
                    name: service_name,
                    port,
                    config: config.clone(),
                });
            }
        }
        Ok(services)
    }
}

/// One configured listening service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub transport: Option<String>,
    /// Listen address, `*` for every interface
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default)]
    pub ports: Ports,
    /// Applications hosted by this service; all of `applications/` when unset
    #[serde(default)]
    pub applications: Option<Vec<String>>,
    #[serde(default, with = "duration_opt")]
    pub keep_alive: Option<Duration>,
    #[serde(default, with = "duration_opt")]
    pub timeout: Option<Duration>,
    /// When false, `TCP_NODELAY` is set on every accepted connection
    #[serde(default)]
    pub nagle: bool,
    #[serde(default, with = "duration_opt")]
    pub slow_time: Option<Duration>,
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_address() -> String {
    "*".to_string()
}

/// Port declaration of a service.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Ports {
    Single(u16),
    List(Vec<u16>),
    /// `count` ports starting at `from`; a negative count means `cpus + count`
    Sequence { from: u16, count: i32 },
    /// Closed range `from..=to`
    Range { from: u16, to: u16 },
}

impl Default for Ports {
    fn default() -> Self {
        Ports::List(Vec::new())
    }
}

impl Ports {
    /// Resolves the declaration to concrete port numbers.
    pub fn expand(&self, cpus: usize) -> Vec<u16> {
        match self {
            Ports::Single(port) => vec![*port],
            Ports::List(ports) => ports.clone(),
            Ports::Sequence { from, count } => {
                let count = if *count < 0 {
                    (cpus as i64 + *count as i64).max(1)
                } else {
                    *count as i64
                };
                (0..count)
                    .filter_map(|i| u16::try_from(*from as i64 + i).ok())
                    .collect()
            }
            Ports::Range { from, to } => (*from..=*to).collect(),
        }
    }
}

/// A service after port expansion.
#[derive(Debug, Clone, Serialize)]
pub struct Service {
    pub name: String,
    pub port: u16,
    #[serde(flatten)]
    pub config: ServiceConfig,
}

impl Service {
    pub fn is_master(&self) -> bool {
        self.name == MASTER_SERVICE
    }

    /// `address:port` as written in logs and bind errors.
    pub fn address(&self) -> String {
        format!("{}:{}", self.config.address, self.port)
    }

    pub fn keep_alive(&self) -> Duration {
        self.config.keep_alive.unwrap_or(DEFAULT_KEEP_ALIVE)
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScaleSection {
    /// Server id, the prefix of every node id
    pub server: String,
    /// `server` or `controller`
    pub instance: String,
    /// Resident memory limit in bytes
    pub memory_limit: Option<u64>,
    #[serde(with = "duration")]
    pub memory_check_interval: Duration,
}

impl Default for ScaleSection {
    fn default() -> Self {
        Self {
            server: "S1".to_string(),
            instance: "server".to_string(),
            memory_limit: None,
            memory_check_interval: DEFAULT_MEMORY_CHECK_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogSection {
    pub to_stdout: bool,
    pub to_file: bool,
    pub keep_days: u32,
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            to_stdout: true,
            to_file: true,
            keep_days: 10,
            level: "info".to_string(),
        }
    }
}

// ============================================================================
// Application sections
// ============================================================================

/// Sections read from `<app>/config/`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppSections {
    /// Virtual host patterns; an empty list never matches
    pub hosts: Vec<String>,
    pub sandbox: Option<SandboxSection>,
    pub application: ApplicationSection,
    /// Opaque database declarations handed to the database opener
    pub databases: toml::Table,
    pub files: FilesSection,
}

impl AppSections {
    /// Loads every `*.toml` file in `<app_dir>/config`.
    pub fn load(app_dir: &Path) -> Result<Self> {
        let dir = app_dir.join("config");
        let table = load_sections(&dir)?;
        toml::Value::Table(table)
            .try_into()
            .map_err(|e| HostError::config(&dir, e.to_string()))
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SandboxSection {
    /// Global names copied into the sandbox; the built-in list when unset
    pub global: Option<Vec<String>>,
    /// API module names; the built-in list when unset
    pub api: Option<Vec<String>>,
    /// `{ <app> = { <exported name> = "<local.path>" } }`
    pub import: BTreeMap<String, BTreeMap<String, String>>,
    /// Global names other applications may import
    pub export: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ApplicationSection {
    #[serde(with = "duration_opt")]
    pub slow_time: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FilesSection {
    pub gzip: bool,
    pub compress_above: u64,
}

impl Default for FilesSection {
    fn default() -> Self {
        Self {
            gzip: true,
            compress_above: DEFAULT_COMPRESS_ABOVE,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Reads every `*.toml` file of `dir` into one table keyed by file stem.
fn load_sections(dir: &Path) -> Result<toml::Table> {
    let mut sections = toml::Table::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sections),
        Err(e) => return Err(HostError::config(dir, e.to_string())),
    };

    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let name = name.to_string();
        let content = std::fs::read_to_string(&path)?;
        let mut table: toml::Table =
            toml::from_str(&content).map_err(|e| HostError::config(&path, e.to_string()))?;

        // `hosts = [...]` inside hosts.toml is the section itself
        let value = match table.remove(&name) {
            Some(inner) if table.is_empty() => inner,
            Some(inner) => {
                table.insert(name.clone(), inner);
                toml::Value::Table(table)
            }
            None => toml::Value::Table(table),
        };
        sections.insert(name, value);
    }

    Ok(sections)
}

mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

mod duration_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        raw.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_missing_config_dir_yields_defaults() {
        let root = TempDir::new().unwrap();
        let sections = ServerSections::load(root.path()).unwrap();
        assert!(sections.servers.is_empty());
        assert_eq!(sections.scale.server, "S1");
        assert_eq!(sections.scale.memory_check_interval, Duration::from_secs(5));
        assert!(sections.log.to_file);
    }

    #[test]
    fn test_servers_section_with_durations() {
        let root = TempDir::new().unwrap();
        write(
            &root.path().join("config"),
            "servers.toml",
            r#"
            [master]
            address = "127.0.0.1"
            ports = [2500]

            [www]
            ports = { from = 8001, to = 8003 }
            keep_alive = "10s"
            nagle = false
            "#,
        );
        let sections = ServerSections::load(root.path()).unwrap();
        let www = &sections.servers["www"];
        assert_eq!(www.protocol, "http");
        assert_eq!(www.keep_alive, Some(Duration::from_secs(10)));
        assert_eq!(www.timeout, None);

        let services = sections.services(4).unwrap();
        let names: Vec<_> = services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["master", "www8001", "www8002", "www8003"]);
        assert!(services[0].is_master());
        assert_eq!(services[0].address(), "127.0.0.1:2500");
        assert_eq!(services[1].keep_alive(), Duration::from_secs(10));
        assert_eq!(services[1].timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_negative_sequence_count_is_relative_to_cpus() {
        let ports = Ports::Sequence { from: 9000, count: -2 };
        assert_eq!(ports.expand(8), vec![9000, 9001, 9002, 9003, 9004, 9005]);
        assert_eq!(ports.expand(1), vec![9000]);
    }

    #[test]
    fn test_service_without_ports_is_rejected() {
        let mut sections = ServerSections::default();
        sections.servers.insert(
            "www".into(),
            toml::from_str::<ServiceConfig>("protocol = \"http\"").unwrap(),
        );
        assert!(sections.services(2).is_err());
    }

    #[test]
    fn test_hosts_file_unwraps_single_key() {
        let app = TempDir::new().unwrap();
        let config = app.path().join("config");
        write(&config, "hosts.toml", r#"hosts = ["a.example.com", "*"]"#);
        write(&config, "application.toml", r#"slow_time = "2s""#);
        write(
            &config,
            "sandbox.toml",
            r#"
            global = ["setTimeout"]
            export = ["shared"]
            [import.billing]
            rates = "billing.rates"
            "#,
        );
        write(&config, "notes.txt", "ignored");

        let sections = AppSections::load(app.path()).unwrap();
        assert_eq!(sections.hosts, vec!["a.example.com", "*"]);
        assert_eq!(sections.application.slow_time, Some(Duration::from_secs(2)));
        let sandbox = sections.sandbox.unwrap();
        assert_eq!(sandbox.global, Some(vec!["setTimeout".to_string()]));
        assert_eq!(sandbox.import["billing"]["rates"], "billing.rates");
        assert!(sections.files.gzip);
    }

    #[test]
    fn test_malformed_file_reports_its_path() {
        let app = TempDir::new().unwrap();
        write(&app.path().join("config"), "files.toml", "gzip = ");
        let err = AppSections::load(app.path()).unwrap_err();
        assert!(err.to_string().contains("files.toml"));
    }
}
