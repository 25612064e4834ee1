//! Configuration types and validation for the Cloud Tasks emulator
//!
//! The emulator loads an optional TOML file and merges command-line
//! overrides on top. Validation runs once at startup so that a bad initial
//! queue name or an unparseable App Engine host aborts the process instead
//! of surfacing as confusing dispatch failures later.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;
use url::Url;

use crate::defaults::{default_listen_host, default_listen_port};
use crate::names::validate_queue_name;
use crate::EmulatorError;

/// Main emulator configuration, loaded from emulator.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Host the REST facade binds to
    pub host: String,
    /// Port the REST facade binds to
    pub port: u16,
    /// Fully qualified queue names created before the server starts serving
    pub initial_queues: Vec<String>,
    /// Host used to resolve App Engine task targets, e.g. `localhost:8080`.
    /// When unset, dispatching an App Engine task fails non-retryably.
    pub app_engine_emulator_host: Option<String>,
    /// Issuer claim for minted OIDC tokens; enables the discovery endpoint
    pub openid_issuer: Option<String>,
    /// When enabled, `PurgeQueue` waits for in-flight dispatches and also
    /// forgets the purged queue's task names so they can be reused
    pub hard_reset_on_purge_queue: bool,
    /// Directory for rolling JSON log files; logs go to stdout when unset
    pub log_directory: Option<String>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            host: default_listen_host(),
            port: default_listen_port(),
            initial_queues: Vec::new(),
            app_engine_emulator_host: None,
            openid_issuer: None,
            hard_reset_on_purge_queue: false,
            log_directory: None,
        }
    }
}

impl EmulatorConfig {
    /// Loads the configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            )
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!(
                "Failed to parse config file {}: {}",
                path.as_ref().display(),
                e
            )
        })?;
        debug!(path = %path.as_ref().display(), "Loaded emulator configuration");
        Ok(config)
    }

    /// Validates the configuration, returning the first problem found.
    pub fn validate(&self) -> Result<(), EmulatorError> {
        if self.host.is_empty() {
            return Err(EmulatorError::InvalidArgument(
                "listen host cannot be empty".to_string(),
            ));
        }

        for name in &self.initial_queues {
            validate_queue_name(name)?;
        }

        if let Some(host) = &self.app_engine_emulator_host {
            if host.is_empty() {
                return Err(EmulatorError::InvalidArgument(
                    "app_engine_emulator_host cannot be empty when set".to_string(),
                ));
            }
            // Accept either a bare authority or a full URL; either way the
            // normalized form must yield a usable host.
            let probe = if host.contains("://") {
                host.clone()
            } else {
                format!("http://{}", host)
            };
            let parsed = Url::parse(&probe).map_err(|e| {
                EmulatorError::InvalidArgument(format!(
                    "app_engine_emulator_host '{}' is not a valid host: {}",
                    host, e
                ))
            })?;
            if parsed.host_str().is_none() {
                return Err(EmulatorError::InvalidArgument(format!(
                    "app_engine_emulator_host '{}' has no host component",
                    host
                )));
            }
        }

        if let Some(issuer) = &self.openid_issuer {
            Url::parse(issuer).map_err(|e| {
                EmulatorError::InvalidArgument(format!(
                    "openid_issuer '{}' is not a valid URL: {}",
                    issuer, e
                ))
            })?;
        }

        Ok(())
    }

    /// The App Engine emulator host as a bare authority, scheme stripped.
    ///
    /// Dispatch always talks plain HTTP to the resolved
    /// `<service>.<host>` target, so only the authority part is kept.
    pub fn app_engine_authority(&self) -> Option<String> {
        self.app_engine_emulator_host.as_ref().map(|host| {
            match host.split_once("://") {
                Some((_, rest)) => rest.trim_end_matches('/').to_string(),
                None => host.trim_end_matches('/').to_string(),
            }
        })
    }
}
