use anyhow::{anyhow, Result};
use std::{
    env,
    path::{Path, PathBuf},
};

/// Server configuration, read from the environment.
///
/// `XDG_CACHE_HOME` (fallback `$HOME/.config`) decides where serialized
/// project databases live; `XDG_RUNTIME_DIR` (fallback `/tmp`) is where the
/// request socket is created.
#[derive(Debug, Clone)]
pub struct Config {
    pub cache_dir: PathBuf,
    pub runtime_dir: PathBuf,
    pub socket_name: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let cache_dir = match optional_env("XDG_CACHE_HOME") {
            Some(cache_home) => PathBuf::from(cache_home),
            None => {
                let home = required_env("HOME")?;
                Path::new(&home).join(".config")
            }
        };

        let runtime_dir = optional_env("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp"));

        let socket_name =
            optional_env("FTAGS_SOCKET_NAME").unwrap_or_else(|| "ftags.socket".to_string());

        Ok(Self {
            cache_dir,
            runtime_dir,
            socket_name,
        })
    }

    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir.join("ftags").join(&self.socket_name)
    }

    /// On-disk location of a project database:
    /// `<cache>/ftags/project/<project-root>/project.data`.
    pub fn project_database_path(&self, project_root: &str) -> PathBuf {
        let mut path = self.cache_dir.join("ftags").join("project");
        for element in project_root.split('/').filter(|element| !element.is_empty()) {
            path.push(element);
        }
        path.join("project.data")
    }
}

fn required_env(key: &str) -> Result<String> {
    env::var(key).map_err(|_| anyhow!("Missing required env var: {key}"))
}

fn optional_env(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}
