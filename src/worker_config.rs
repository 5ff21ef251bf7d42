//! Worker configuration documents
//!
//! A [`WorkerConfig`] describes a single forwarding service. It renders to
//! the JSON document the worker reads with `-C <path>`, and
//! [`WorkerConfigBuilder`] writes it to a per-profile scratch file.

use crate::db::Profile;
use crate::handler::{resolve_handler, HandlerType};
use serde::{Serialize, Serializer};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Both fields must be non-empty
    pub fn from_parts(username: &str, password: &str) -> Option<Self> {
        if username.is_empty() || password.is_empty() {
            return None;
        }
        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// Handler section of a service. Only socks5 and http carry credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerSpec {
    Socks5 { auth: Option<Credentials> },
    Http { auth: Option<Credentials> },
    Tcp,
    Udp,
    Ss,
}

impl HandlerSpec {
    /// Build the handler for a type; credentials are dropped where unsupported
    pub fn new(handler: HandlerType, auth: Option<Credentials>) -> Self {
        match handler {
            HandlerType::Socks5 => HandlerSpec::Socks5 { auth },
            HandlerType::Http => HandlerSpec::Http { auth },
            HandlerType::Tcp => HandlerSpec::Tcp,
            HandlerType::Udp => HandlerSpec::Udp,
            HandlerType::Ss => HandlerSpec::Ss,
        }
    }

    pub fn handler_type(&self) -> HandlerType {
        match self {
            HandlerSpec::Socks5 { .. } => HandlerType::Socks5,
            HandlerSpec::Http { .. } => HandlerType::Http,
            HandlerSpec::Tcp => HandlerType::Tcp,
            HandlerSpec::Udp => HandlerType::Udp,
            HandlerSpec::Ss => HandlerType::Ss,
        }
    }

    pub fn auth(&self) -> Option<&Credentials> {
        match self {
            HandlerSpec::Socks5 { auth } | HandlerSpec::Http { auth } => auth.as_ref(),
            _ => None,
        }
    }
}

/// Whether the document carries a `log` section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigVariant {
    Minimal,
    #[default]
    WithLogging,
}

/// A single-service worker configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub name: String,
    pub listen: String,
    pub handler: HandlerSpec,
    pub target: String,
    pub variant: ConfigVariant,
}

impl WorkerConfig {
    pub fn from_profile(profile: &Profile, variant: ConfigVariant) -> Self {
        let handler_type = resolve_handler(&profile.profile_type);
        let auth = Credentials::from_parts(&profile.username, &profile.password);
        Self {
            name: profile.name.clone(),
            listen: profile.listen.clone(),
            handler: HandlerSpec::new(handler_type, auth),
            target: profile.remote.clone(),
            variant,
        }
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

// Wire shapes, borrowed from a WorkerConfig at serialization time

#[derive(Serialize)]
struct WireDocument<'a> {
    services: [WireService<'a>; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    log: Option<WireLog>,
}

#[derive(Serialize)]
struct WireService<'a> {
    name: &'a str,
    addr: &'a str,
    handler: WireHandler<'a>,
    forwarder: WireForwarder<'a>,
}

#[derive(Serialize)]
struct WireHandler<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<WireAuth<'a>>,
}

#[derive(Serialize)]
struct WireAuth<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct WireForwarder<'a> {
    nodes: [WireNode<'a>; 1],
}

#[derive(Serialize)]
struct WireNode<'a> {
    addr: &'a str,
}

#[derive(Serialize)]
struct WireLog {
    level: &'static str,
    format: &'static str,
    output: &'static str,
}

impl Serialize for WorkerConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let auth = self.handler.auth().map(|c| WireAuth {
            username: &c.username,
            password: &c.password,
        });
        let log = match self.variant {
            ConfigVariant::WithLogging => Some(WireLog {
                level: "info",
                format: "json",
                output: "stderr",
            }),
            ConfigVariant::Minimal => None,
        };

        WireDocument {
            services: [WireService {
                name: &self.name,
                addr: &self.listen,
                handler: WireHandler {
                    kind: self.handler.handler_type().as_str(),
                    auth,
                },
                forwarder: WireForwarder {
                    nodes: [WireNode { addr: &self.target }],
                },
            }],
            log,
        }
        .serialize(serializer)
    }
}

/// Handle to a written config file
#[derive(Debug)]
pub struct ScratchConfig {
    path: PathBuf,
}

impl ScratchConfig {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file. A file that is already gone is not an error.
    pub fn remove(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Writes `config_<id>.json` files into a scratch directory
#[derive(Debug, Clone)]
pub struct WorkerConfigBuilder {
    scratch_dir: PathBuf,
    variant: ConfigVariant,
}

impl WorkerConfigBuilder {
    pub fn new(scratch_dir: impl Into<PathBuf>, variant: ConfigVariant) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            variant,
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn config_path(&self, profile_id: i64) -> PathBuf {
        self.scratch_dir.join(format!("config_{}.json", profile_id))
    }

    pub fn build(&self, profile: &Profile) -> WorkerConfig {
        WorkerConfig::from_profile(profile, self.variant)
    }

    /// Render and write the profile's config, replacing any stale file
    pub fn write(&self, profile: &Profile) -> io::Result<ScratchConfig> {
        let config = self.build(profile);
        let json = config
            .to_json_pretty()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        std::fs::create_dir_all(&self.scratch_dir)?;
        let path = self.config_path(profile.id);
        std::fs::write(&path, json)?;

        debug!(
            profile_id = profile.id,
            handler = %config.handler.handler_type(),
            path = %path.display(),
            "Wrote worker config"
        );
        Ok(ScratchConfig { path })
    }
}
