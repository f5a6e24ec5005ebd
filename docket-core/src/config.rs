use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::TrackerError;

/// Startup configuration, resolved once and treated as immutable.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub service_declarations_path: PathBuf,
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistoryConfig {
    pub snapshots_path: PathBuf,
    pub versions_path: PathBuf,
    /// When false, `publish` is a no-op and version messages reference bare
    /// snapshot ids instead of URLs.
    #[serde(default)]
    pub publish: bool,
    #[serde(default)]
    pub snapshots_base_url: Option<String>,
    #[serde(default)]
    pub remotes: RemotesConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemotesConfig {
    pub snapshots: Option<String>,
    pub versions: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_declarations_path: PathBuf::from("./declarations"),
            history: HistoryConfig {
                snapshots_path: PathBuf::from("./data/snapshots"),
                versions_path: PathBuf::from("./data/versions"),
                publish: false,
                snapshots_base_url: None,
                remotes: RemotesConfig::default(),
            },
        }
    }
}

impl Config {
    /// Load a TOML configuration file. A missing file yields the defaults;
    /// relative paths resolve against the file's own directory.
    pub fn load(path: &Path) -> Result<Self, TrackerError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => return Err(TrackerError::io(path, err)),
        };

        let mut config: Config = toml::from_str(&contents).map_err(|err| TrackerError::Config {
            path: path.display().to_string(),
            detail: err.to_string(),
        })?;

        let base = path.parent().unwrap_or(Path::new("."));
        config.service_declarations_path = resolve(base, &config.service_declarations_path);
        config.history.snapshots_path = resolve(base, &config.history.snapshots_path);
        config.history.versions_path = resolve(base, &config.history.versions_path);

        Ok(config)
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
