//! Command line surface and the validated configuration built from it.

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_SCRIPT_EXTENSION: &str = "php";

#[derive(Debug, Parser)]
#[command(name = "devhttpd", version, about = "Built-in development web server")]
pub struct Cli {
    /// Run with built-in web server on <addr>[:<port>].
    #[arg(short = 'S', long = "server", value_name = "ADDR[:PORT]")]
    pub server: String,

    /// Specify document root for built-in web server.
    #[arg(short = 't', long = "docroot", value_name = "DOCROOT", default_value = ".")]
    pub docroot: PathBuf,

    /// Run scripts through this interpreter instead of executing them directly.
    #[arg(short = 'i', long = "interpreter", value_name = "PATH")]
    pub interpreter: Option<PathBuf>,

    /// Router script consulted before every request.
    #[arg(value_name = "ROUTER")]
    pub router: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub document_root: PathBuf,
    pub router: Option<PathBuf>,
    pub interpreter: Option<PathBuf>,
    /// Requests for files with this extension are run as scripts.
    pub script_extension: String,
}

impl Config {
    pub fn from_command_line() -> Result<Self> {
        Self::from_cli(Cli::parse())
    }

    /// Validate parsed arguments. The document root and router must exist.
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let (host, port) = parse_bind_address(&cli.server)?;
        let document_root = existing(cli.docroot, true)?;
        let router = cli
            .router
            .map(|router| existing(router, false))
            .transpose()?;
        Ok(Self {
            host,
            port,
            document_root,
            router,
            interpreter: cli.interpreter,
            script_extension: DEFAULT_SCRIPT_EXTENSION.to_string(),
        })
    }

    /// Index file names tried for directory requests, in order.
    pub fn index_files(&self) -> Vec<String> {
        vec![
            "index.html".to_string(),
            format!("index.{}", self.script_extension),
        ]
    }
}

fn existing(path: PathBuf, want_dir: bool) -> Result<PathBuf> {
    let found = std::fs::metadata(&path)
        .map(|meta| !want_dir || meta.is_dir())
        .unwrap_or(false);
    if !found {
        bail!("Directory or script {} does not exist.", path.display());
    }
    path.canonicalize()
        .with_context(|| format!("failed to resolve {}", path.display()))
}

/// Split `host[:port]`, defaulting the port. IPv6 literals need brackets to carry a port.
pub fn parse_bind_address(address: &str) -> Result<(String, u16)> {
    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("Invalid address: {}", address))?;
        match rest {
            "" => (host, None),
            rest => match rest.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => bail!("Invalid address: {}", address),
            },
        }
    } else if address.matches(':').count() > 1 {
        (address, None)
    } else {
        match address.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (address, None),
        }
    };
    if host.is_empty() {
        bail!("Invalid address: {}", address);
    }
    let port = match port {
        Some(port) => port
            .parse()
            .with_context(|| format!("Invalid port: {}", port))?,
        None => DEFAULT_PORT,
    };
    Ok((host.to_string(), port))
}
