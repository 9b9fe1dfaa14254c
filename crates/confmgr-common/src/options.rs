//! Backend option set and XML config-file loading.
//!
//! Options are read in three layers, later layers overriding earlier ones:
//! built-in defaults, the XML config file named by `-f`, and `-o key=val`
//! command-line overrides. Keys are the kebab-case element names of the
//! config file.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use confmgr_types::{parse_xml, XmlNode};

use crate::error::{BackendError, BackendResult};

/// Socket family for the backend control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SockFamily {
    /// Unix domain socket.
    #[default]
    Unix,
    /// IPv4 TCP socket.
    Ipv4,
    /// IPv6 TCP socket.
    Ipv6,
}

impl FromStr for SockFamily {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNIX" => Ok(SockFamily::Unix),
            "IPv4" => Ok(SockFamily::Ipv4),
            "IPv6" => Ok(SockFamily::Ipv6),
            other => Err(BackendError::config(
                "sock-family",
                format!("expected UNIX|IPv4|IPv6, got '{other}'"),
            )),
        }
    }
}

/// Backend startup mode (`-s`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartupMode {
    /// Use running as persisted; no validation or commit.
    #[default]
    None,
    /// Validate and commit the persisted startup datastore.
    Startup,
    /// Validate and commit a copy of running as if it were startup.
    Running,
    /// Wipe running and start from empty.
    Init,
}

impl FromStr for StartupMode {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(StartupMode::None),
            "startup" => Ok(StartupMode::Startup),
            "running" => Ok(StartupMode::Running),
            "init" => Ok(StartupMode::Init),
            other => Err(BackendError::config(
                "startup-mode",
                format!("expected none|startup|running|init, got '{other}'"),
            )),
        }
    }
}

/// NACM operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NacmMode {
    /// Access control disabled; everything permitted.
    #[default]
    Disabled,
    /// NACM config read from the running datastore.
    Internal,
    /// NACM config read from a standalone file at startup.
    External,
}

impl FromStr for NacmMode {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(NacmMode::Disabled),
            "internal" => Ok(NacmMode::Internal),
            "external" => Ok(NacmMode::External),
            other => Err(BackendError::config(
                "nacm-mode",
                format!("expected disabled|internal|external, got '{other}'"),
            )),
        }
    }
}

/// On-disk datastore format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DbFormat {
    /// Rendered XML text.
    #[default]
    Xml,
    /// Compact JSON encoding of the tree.
    Json,
}

impl FromStr for DbFormat {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "xml" => Ok(DbFormat::Xml),
            "json" => Ok(DbFormat::Json),
            other => Err(BackendError::config(
                "db-format",
                format!("expected xml|json, got '{other}'"),
            )),
        }
    }
}

/// Log destination (`-l`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogDest {
    /// System log.
    Syslog,
    /// Standard error.
    #[default]
    Stderr,
    /// Standard output.
    Stdout,
    /// Append to a file.
    File(PathBuf),
}

impl LogDest {
    /// Parses the `-l` argument: `s`, `e`, `o`, or `f<path>`.
    pub fn parse_flag(s: &str) -> BackendResult<Self> {
        match s.chars().next() {
            Some('s') => Ok(LogDest::Syslog),
            Some('e') => Ok(LogDest::Stderr),
            Some('o') => Ok(LogDest::Stdout),
            Some('f') if s.len() > 1 => Ok(LogDest::File(PathBuf::from(&s[1..]))),
            _ => Err(BackendError::config(
                "log-dest",
                format!("expected s|e|o|f<file>, got '{s}'"),
            )),
        }
    }
}

/// The complete backend option set.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// YANG module search path (kept for schema providers).
    pub yang_dir: Option<PathBuf>,
    /// Main YANG module file override.
    pub yang_main_file: Option<PathBuf>,
    /// Backend plugin directory.
    pub plugin_dir: Option<PathBuf>,
    /// Datastore directory.
    pub db_dir: PathBuf,
    /// Datastore plugin name.
    pub datastore_plugin: Option<String>,
    /// Control socket family.
    pub sock_family: SockFamily,
    /// Socket path (Unix) or address (IP).
    pub sock: String,
    /// Group required for clients connecting to the Unix socket.
    pub sock_group: String,
    /// Pidfile path.
    pub pidfile: PathBuf,
    /// Startup mode.
    pub startup_mode: StartupMode,
    /// Extra XML merged into running after startup, without a commit.
    pub extra_config: Option<PathBuf>,
    /// NACM mode.
    pub nacm_mode: NacmMode,
    /// External NACM config file.
    pub nacm_file: Option<PathBuf>,
    /// Verify client credentials against NACM users (external mode may
    /// disable this).
    pub nacm_credentials: bool,
    /// Datastore cache enabled.
    pub db_cache: bool,
    /// Pretty-print persisted datastores.
    pub db_pretty: bool,
    /// Persisted datastore format.
    pub db_format: DbFormat,
    /// Per-RPC processing deadline; `None` disables.
    pub rpc_timeout: Option<Duration>,
    /// Default confirmed-commit timeout in seconds.
    pub confirmed_commit_timeout: u64,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            yang_dir: None,
            yang_main_file: None,
            plugin_dir: None,
            db_dir: PathBuf::from("/usr/local/var/confmgr"),
            datastore_plugin: None,
            sock_family: SockFamily::Unix,
            sock: "/usr/local/var/confmgr/confmgr.sock".to_string(),
            sock_group: "confmgr".to_string(),
            pidfile: PathBuf::from("/usr/local/var/confmgr/confmgrd.pid"),
            startup_mode: StartupMode::None,
            extra_config: None,
            nacm_mode: NacmMode::Disabled,
            nacm_file: None,
            nacm_credentials: true,
            db_cache: true,
            db_pretty: false,
            db_format: DbFormat::Xml,
            rpc_timeout: None,
            confirmed_commit_timeout: 600,
        }
    }
}

impl BackendOptions {
    /// Loads options from an XML config file, overriding defaults.
    ///
    /// The file is a flat element list:
    /// `<confmgr-config><db-dir>/var/db</db-dir>…</confmgr-config>`.
    pub fn from_file(path: &Path) -> BackendResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BackendError::io(format!("reading config file {}", path.display()), e))?;
        let tree = parse_xml(&text)?;
        let mut opts = Self::default();
        opts.apply_tree(&tree)?;
        Ok(opts)
    }

    /// Applies every child element of a parsed config tree.
    pub fn apply_tree(&mut self, tree: &XmlNode) -> BackendResult<()> {
        for child in tree.children() {
            let value = child.body().unwrap_or_default();
            self.set(child.name(), value)?;
        }
        Ok(())
    }

    /// Sets one option by its kebab-case key (the `-o key=val` path).
    pub fn set(&mut self, key: &str, value: &str) -> BackendResult<()> {
        match key {
            "yang-dir" => self.yang_dir = Some(PathBuf::from(value)),
            "yang-main-file" => self.yang_main_file = Some(PathBuf::from(value)),
            "plugin-dir" => self.plugin_dir = Some(PathBuf::from(value)),
            "db-dir" => self.db_dir = PathBuf::from(value),
            "datastore-plugin" => self.datastore_plugin = Some(value.to_string()),
            "sock-family" => self.sock_family = value.parse()?,
            "sock" => self.sock = value.to_string(),
            "sock-group" => self.sock_group = value.to_string(),
            "pidfile" => self.pidfile = PathBuf::from(value),
            "startup-mode" => self.startup_mode = value.parse()?,
            "extra-config" => self.extra_config = Some(PathBuf::from(value)),
            "nacm-mode" => self.nacm_mode = value.parse()?,
            "nacm-file" => self.nacm_file = Some(PathBuf::from(value)),
            "nacm-credentials" => self.nacm_credentials = parse_bool(key, value)?,
            "db-cache" => self.db_cache = parse_bool(key, value)?,
            "db-pretty" => self.db_pretty = parse_bool(key, value)?,
            "db-format" => self.db_format = value.parse()?,
            "rpc-timeout" => {
                let secs: u64 = value
                    .parse()
                    .map_err(|_| BackendError::config(key, "expected seconds"))?;
                self.rpc_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
            "confirmed-commit-timeout" => {
                self.confirmed_commit_timeout = value
                    .parse()
                    .map_err(|_| BackendError::config(key, "expected seconds"))?;
            }
            other => {
                return Err(BackendError::config(other, "unknown option"));
            }
        }
        Ok(())
    }

    /// Path of the persisted file for a named datastore.
    pub fn db_file(&self, name: &str) -> PathBuf {
        self.db_dir.join(format!("{name}_db"))
    }
}

fn parse_bool(key: &str, value: &str) -> BackendResult<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(BackendError::config(
            key,
            format!("expected true|false, got '{other}'"),
        )),
    }
}
