use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to resolve home directory for data dir")]
    HomeDirectoryUnavailable,
    #[error("failed to create data dir {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Home-directory layout: everything lives under `~/.shop` unless
/// `SHOP_DATA_DIR` overrides it.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub user_spec_dir: PathBuf,
    pub project_spec_dir: PathBuf,
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        let data_dir = match std::env::var_os("SHOP_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => {
                let home = std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .ok_or(ConfigError::HomeDirectoryUnavailable)?;
                home.join(".shop")
            }
        };
        Ok(Self::with_data_dir(data_dir))
    }

    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            db_path: data_dir.join("shop.db"),
            user_spec_dir: data_dir.join("specs"),
            project_spec_dir: PathBuf::from(".shop/specs"),
            data_dir,
        }
    }

    pub fn ensure_data_dir(&self) -> Result<(), ConfigError> {
        for dir in [&self.data_dir, &self.user_spec_dir] {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::CreateDir {
                path: dir.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.data_dir.join("workspaces")
    }

    /// Resolve a spec name to a `.lua` file, checking the project spec
    /// dir before the user spec dir. Accepts `name` or `name.lua`.
    pub fn find_spec(&self, name: &str) -> Option<PathBuf> {
        for dir in [&self.project_spec_dir, &self.user_spec_dir] {
            if name.ends_with(".lua") {
                let path = dir.join(name);
                if path.is_file() {
                    return Some(path);
                }
            }
            let path = dir.join(format!("{name}.lua"));
            if path.is_file() {
                return Some(path);
            }
        }
        None
    }
}

pub fn is_lua_spec(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("lua")
}
