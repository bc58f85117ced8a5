//! Gateway configuration.
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! environment variables and command-line arguments.

use std::ffi::OsString;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use url::{Host, Url};

/// Port the gateway listens on when none is given.
pub const DEFAULT_LISTEN_PORT: u16 = 1234;

/// Well-known Gopher port.
pub const DEFAULT_GOPHER_PORT: u16 = 70;

/// Command-line interface.
#[derive(Debug, Parser)]
#[command(name = "idigna", version, about = "Serve a Gopher server to HTTP clients")]
pub struct Cli {
    /// Local port to accept HTTP requests on
    #[arg(short, long, value_name = "server_port", env = "IDIGNA_PORT")]
    pub port: Option<u16>,

    /// Local host or address to bind instead of every wildcard address
    #[arg(long, value_name = "addr", env = "IDIGNA_BIND")]
    pub bind: Option<String>,

    /// YAML configuration file
    #[arg(short, long, value_name = "file")]
    pub config: Option<PathBuf>,

    /// Remote Gopher host, or a gopher:// URL
    pub remote: Option<String>,

    /// Remote Gopher port
    pub remote_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen_port: u16,
    /// `None` binds every wildcard address for `listen_port`.
    pub bind: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            bind: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    pub host: String,
    #[serde(default = "default_gopher_port")]
    pub port: u16,
}

fn default_gopher_port() -> u16 {
    DEFAULT_GOPHER_PORT
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub server: ServerConfig,
    pub remote: RemoteConfig,
}

/// On-disk layout. Every section is optional so the command line can fill gaps.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    server: ServerConfig,
    remote: Option<RemoteConfig>,
}

impl FileConfig {
    fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }
}

impl Config {
    /// Parse the process arguments. Usage errors exit through clap.
    pub fn load() -> Result<Self> {
        Self::from_cli(Cli::parse())
    }

    /// Parse an explicit argument list; the first item is the program name.
    pub fn load_from<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args)?;
        Self::from_cli(cli)
    }

    pub fn from_cli(cli: Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::from_path(path)?,
            None => FileConfig::default(),
        };

        let mut server = file.server;
        if let Some(port) = cli.port {
            server.listen_port = port;
        }
        if let Some(bind) = cli.bind {
            server.bind = Some(bind);
        }

        let remote = match cli.remote {
            Some(remote) => {
                let (host, url_port) = parse_remote(&remote)?;
                RemoteConfig {
                    host,
                    port: cli
                        .remote_port
                        .or(url_port)
                        .unwrap_or(DEFAULT_GOPHER_PORT),
                }
            }
            None => {
                let mut remote = file
                    .remote
                    .context("No remote Gopher host given (argument or `remote.host` in config)")?;
                if let Some(port) = cli.remote_port {
                    remote.port = port;
                }
                remote
            }
        };

        if remote.host.is_empty() {
            anyhow::bail!("Remote Gopher host is empty");
        }

        Ok(Self { server, remote })
    }
}

/// Split a remote argument into host and optional port.
///
/// Accepts a bare host name or address, or a `gopher://host[:port]/` URL.
pub fn parse_remote(remote: &str) -> Result<(String, Option<u16>)> {
    if !remote.contains("://") {
        return Ok((remote.to_string(), None));
    }

    let url = Url::parse(remote).with_context(|| format!("Invalid remote URL {remote}"))?;
    if url.scheme() != "gopher" {
        anyhow::bail!("Unsupported remote scheme `{}`", url.scheme());
    }

    let host = match url.host().context("Remote URL missing host")? {
        Host::Domain(domain) => domain.to_string(),
        Host::Ipv4(addr) => IpAddr::V4(addr).to_string(),
        Host::Ipv6(addr) => IpAddr::V6(addr).to_string(),
    };

    Ok((host, url.port()))
}
