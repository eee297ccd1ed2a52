//! Server configuration and on-disk layout.
//!
//! Two concerns live here:
//!
//! - [`ServerConfig`] — everything the event loop needs to start, assembled
//!   by the CLI layer (port, bind address, TLS material, idle timings).
//! - [`RuntimeDir`] — the per-uid scratch directory `/tmp/dullahan-<uid>/`
//!   (mode 0700) holding the control socket, pid file, and logs.
//!
//! Layout templates are read from `~/.config/dullahan/layouts.json` when
//! present; a missing or malformed file falls back to the built-in single
//! template.

use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_COLS, DEFAULT_PORT, DEFAULT_ROWS, IDLE_PING_INTERVAL, PONG_DEADLINE};

/// Everything the event loop needs to start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP listening port.
    pub port: u16,
    /// Bind address; loopback unless `--bind-all` was given.
    pub bind_addr: IpAddr,
    /// PEM certificate chain path; TLS is enabled when both paths are set.
    pub tls_cert: Option<PathBuf>,
    /// PEM private key path.
    pub tls_key: Option<PathBuf>,
    /// Idle interval before a protocol ping is sent to a silent client.
    pub idle_ping: Duration,
    /// Grace after a ping before a silent client is closed.
    pub pong_deadline: Duration,
    /// Default dimensions for newly created panes.
    pub default_dims: (u16, u16),
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            tls_cert: None,
            tls_key: None,
            idle_ping: IDLE_PING_INTERVAL,
            pong_deadline: PONG_DEADLINE,
            default_dims: (DEFAULT_COLS, DEFAULT_ROWS),
        }
    }
}

impl ServerConfig {
    /// Whether TLS is enabled (both cert and key paths present).
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}

/// The per-uid runtime directory and the well-known files inside it.
#[derive(Debug, Clone)]
pub struct RuntimeDir {
    root: PathBuf,
}

impl RuntimeDir {
    /// Create (or reuse) `/tmp/dullahan-<uid>/` with mode 0700.
    ///
    /// Failure here is process-fatal: without the directory there is no
    /// control socket, pid file, or log destination.
    pub fn create() -> Result<Self> {
        // SAFETY: getuid cannot fail.
        let uid = unsafe { libc::getuid() };
        let root = PathBuf::from(format!("/tmp/dullahan-{uid}"));
        fs::create_dir_all(&root)
            .with_context(|| format!("cannot create runtime dir {}", root.display()))?;
        fs::set_permissions(&root, fs::Permissions::from_mode(0o700))
            .with_context(|| format!("cannot chmod runtime dir {}", root.display()))?;
        Ok(Self { root })
    }

    /// Construct without touching the filesystem. Tests only.
    #[cfg(test)]
    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    /// Directory root.
    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// Unix control socket path.
    pub fn socket_path(&self) -> PathBuf {
        self.root.join("dullahan.sock")
    }

    /// PID file path.
    pub fn pid_path(&self) -> PathBuf {
        self.root.join("dullahan.pid")
    }

    /// Main log file path.
    pub fn log_path(&self) -> PathBuf {
        self.root.join("dullahan.log")
    }

    /// Debug log file path.
    pub fn dlog_path(&self) -> PathBuf {
        self.root.join("dullahan-dlog.log")
    }

    /// Write the current pid into the pid file.
    pub fn write_pid(&self) -> Result<()> {
        let pid = std::process::id();
        fs::write(self.pid_path(), format!("{pid}\n"))
            .with_context(|| format!("cannot write {}", self.pid_path().display()))?;
        Ok(())
    }

    /// Remove the pid file and control socket, ignoring errors.
    pub fn cleanup(&self) {
        let _ = fs::remove_file(self.pid_path());
        let _ = fs::remove_file(self.socket_path());
    }
}

// ============================================================================
// Layout templates
// ============================================================================

/// A named window layout template from `layouts.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LayoutTemplate {
    /// Number of shell panes the window opens with.
    #[serde(default = "default_pane_count")]
    pub panes: u16,
    /// Free-form layout descriptor interpreted by the browser client.
    #[serde(default)]
    pub arrangement: String,
}

fn default_pane_count() -> u16 {
    1
}

impl Default for LayoutTemplate {
    fn default() -> Self {
        Self { panes: 1, arrangement: String::new() }
    }
}

/// Load layout templates from `~/.config/dullahan/layouts.json`.
///
/// A missing file is normal (empty map); a malformed file logs a warning
/// and is treated as missing rather than failing startup.
pub fn load_layouts() -> HashMap<String, LayoutTemplate> {
    let Some(path) = layouts_path() else {
        return HashMap::new();
    };
    load_layouts_from(&path)
}

fn layouts_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("dullahan").join("layouts.json"))
}

fn load_layouts_from(path: &PathBuf) -> HashMap<String, LayoutTemplate> {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(_) => return HashMap::new(),
    };
    match serde_json::from_slice(&data) {
        Ok(map) => map,
        Err(e) => {
            log::warn!("ignoring malformed {}: {e}", path.display());
            HashMap::new()
        }
    }
}
