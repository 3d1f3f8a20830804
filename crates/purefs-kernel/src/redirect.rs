//! Host path redirection.
//!
//! On a development host, system calls for some native paths are served
//! from the VFS image instead of the host filesystem. Redirection is off
//! unless enabled in the configuration or through [`REDIRECT_ENV`].

use std::path::{Path, PathBuf};

use purefs_types::{VfsPath, VfsResult};
use serde::{Deserialize, Serialize};

/// Environment switch that forces redirection on.
pub const REDIRECT_ENV: &str = "PUREFS_REDIRECT_TO_IMAGE";

fn default_image_root() -> String {
    "/".to_string()
}

/// A host prefix that bypasses the allow list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludeRule {
    /// Host path prefix.
    pub prefix: String,
    /// VFS path the prefix is rewritten to.
    pub translate_to: String,
}

/// `[redirect]` section of the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectConfig {
    pub enabled: bool,
    /// VFS directory that allow-listed host prefixes map onto.
    #[serde(default = "default_image_root")]
    pub image_root: String,
    /// Host prefixes served from the image.
    pub allow: Vec<String>,
    pub exclude: Vec<ExcludeRule>,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image_root: default_image_root(),
            allow: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

/// Where a host path should be served from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// Leave the call to the host.
    Native(PathBuf),
    /// Serve it from this VFS path.
    Image(VfsPath),
}

/// Compiled redirection rules.
#[derive(Debug, Clone)]
pub struct HostRedirect {
    enabled: bool,
    image_root: VfsPath,
    allow: Vec<PathBuf>,
    exclude: Vec<(PathBuf, VfsPath)>,
}

/// True for `1`, `true`, `yes` and `on`, in any case.
fn env_switch(value: Option<&str>) -> bool {
    value.is_some_and(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

/// Append a host remainder to a VFS path.
fn graft(base: &VfsPath, rest: &Path) -> Option<VfsPath> {
    let rest = rest.to_str()?;
    if rest.is_empty() {
        return Some(base.clone());
    }
    base.join(rest).ok()
}

impl HostRedirect {
    /// Compile `config`, honouring [`REDIRECT_ENV`].
    pub fn new(config: &RedirectConfig) -> VfsResult<Self> {
        let env = std::env::var(REDIRECT_ENV).ok();
        Self::with_env(config, env.as_deref())
    }

    /// Compile `config` with an explicit value for the environment switch.
    pub fn with_env(config: &RedirectConfig, env: Option<&str>) -> VfsResult<Self> {
        let exclude = config
            .exclude
            .iter()
            .map(|rule| Ok((PathBuf::from(&rule.prefix), VfsPath::new(&rule.translate_to)?)))
            .collect::<VfsResult<Vec<_>>>()?;
        let enabled = config.enabled || env_switch(env);
        if enabled {
            tracing::info!(allow = config.allow.len(), exclude = exclude.len(), "host redirection enabled");
        }
        Ok(Self {
            enabled,
            image_root: VfsPath::new(&config.image_root)?,
            allow: config.allow.iter().map(PathBuf::from).collect(),
            exclude,
        })
    }

    /// Redirection that never redirects.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            image_root: VfsPath::root(),
            allow: Vec::new(),
            exclude: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Decide where `native` is served from.
    ///
    /// Exclude rules win over the allow list; anything unmatched, relative
    /// or not valid UTF-8 stays native.
    pub fn resolve(&self, native: &Path) -> Redirect {
        if !self.enabled || !native.is_absolute() {
            return Redirect::Native(native.to_path_buf());
        }
        for (prefix, target) in &self.exclude {
            if let Ok(rest) = native.strip_prefix(prefix) {
                if let Some(path) = graft(target, rest) {
                    tracing::trace!(native = %native.display(), %path, "excluded prefix translated");
                    return Redirect::Image(path);
                }
            }
        }
        for prefix in &self.allow {
            if let Ok(rest) = native.strip_prefix(prefix) {
                if let Some(path) = graft(&self.image_root, rest) {
                    return Redirect::Image(path);
                }
            }
        }
        Redirect::Native(native.to_path_buf())
    }
}
