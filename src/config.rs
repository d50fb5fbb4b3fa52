//! Configuration for hblib.
//!
//! Precedence, strongest first:
//! 1. HBLIB_HOME, HBLIB_LIBRARY and HBLIB_MANIFEST_URL from the environment
//! 2. `.hblib/config.yaml`, found in the working directory or the nearest parent
//! 3. Built-in defaults with client state under ~/.hblib
//!
//! - `paths.home` is relative to the .hblib/ directory, other paths to the
//!   project root (the parent of .hblib/)

pub mod paths;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::manifest::{DEFAULT_LIBRARY_ID, DEFAULT_MIN_APP_VERSION};

/// Loaded once per process; a load error is kept as its message
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Default byte budget of the asset cache
pub const DEFAULT_CACHE_MAX_BYTES: u64 = 64 * 1024 * 1024;

/// `.hblib/config.yaml` as written on disk
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub library: Option<LibraryConfig>,
    #[serde(default)]
    pub client: Option<ClientConfig>,
    #[serde(default)]
    pub extractor: Option<ExtractorConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Client state directory (relative to .hblib/)
    pub home: Option<String>,
    /// Published library snapshot (relative to the project root)
    pub library: Option<String>,
    /// Directory with source PDFs and session records
    pub sources: Option<String>,
    /// Directory with images in the logical layout (`drill_images/...`)
    pub images: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LibraryConfig {
    pub library_id: Option<String>,
    pub min_app_version: Option<String>,
    /// Base URL images are published under
    pub image_base_url: Option<String>,
    /// Default changelog note for new versions
    pub changelog_note: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    pub manifest_url: Option<String>,
    pub app_version: Option<String>,
    pub cache_max_bytes: Option<u64>,
    pub http_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractorConfig {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub timeout_seconds: Option<u64>,
}

/// Publishing settings
#[derive(Debug, Clone, Serialize)]
pub struct PublishSettings {
    pub library_id: String,
    pub min_app_version: String,
    pub image_base_url: Option<String>,
    pub changelog_note: Option<String>,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            library_id: DEFAULT_LIBRARY_ID.to_string(),
            min_app_version: DEFAULT_MIN_APP_VERSION.to_string(),
            image_base_url: None,
            changelog_note: None,
        }
    }
}

/// Client sync settings
#[derive(Debug, Clone, Serialize)]
pub struct ClientSettings {
    pub manifest_url: Option<String>,
    pub app_version: String,
    pub cache_max_bytes: u64,
    pub http_timeout_seconds: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            manifest_url: None,
            app_version: DEFAULT_MIN_APP_VERSION.to_string(),
            cache_max_bytes: DEFAULT_CACHE_MAX_BYTES,
            http_timeout_seconds: 30,
        }
    }
}

/// External extractor settings
#[derive(Debug, Clone, Serialize)]
pub struct ExtractorSettings {
    pub command: String,
    pub args: Vec<String>,
    pub timeout_seconds: u64,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            command: "hb-extract".to_string(),
            args: Vec::new(),
            timeout_seconds: 300,
        }
    }
}

/// Effective settings after merging every source
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Client state (installed library, cache, journal)
    pub home: PathBuf,
    /// Published library snapshot
    pub library_file: PathBuf,
    /// Source PDFs and records
    pub sources_dir: PathBuf,
    /// Images in the logical layout
    pub images_dir: PathBuf,
    /// The discovered `.hblib/config.yaml`, if any
    pub config_file: Option<PathBuf>,
    pub publish: PublishSettings,
    pub client: ClientSettings,
    pub extractor: ExtractorSettings,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    cwd.ancestors()
        .map(|dir| dir.join(".hblib").join("config.yaml"))
        .find(|candidate| candidate.is_file())
}

fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let yaml = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read {}", path.display()))?;

    serde_yaml::from_str(&yaml).with_context(|| format!("Invalid config in {}", path.display()))
}

/// Absolute paths pass through; relative ones are joined onto `base`
fn resolve_path(base: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let joined = base.join(path);
    joined.canonicalize().unwrap_or(joined)
}

/// Combine the config file, environment and defaults
fn build_config(
    file: Option<(PathBuf, ConfigFile)>,
    env: impl Fn(&str) -> Option<String>,
    default_home: PathBuf,
) -> ResolvedConfig {
    let (config_file, config) = match file {
        Some((path, config)) => (Some(path), Some(config)),
        None => (None, None),
    };

    // .hblib/ and the project root around it
    let hblib_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf);
    let base_dir = hblib_dir
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let paths = config.as_ref().map(|c| c.paths.clone()).unwrap_or_default();

    let home = if let Some(env_home) = env("HBLIB_HOME") {
        PathBuf::from(env_home)
    } else if let (Some(dir), Some(home)) = (&hblib_dir, &paths.home) {
        resolve_path(dir, home)
    } else {
        default_home
    };

    let library_file = if let Some(env_lib) = env("HBLIB_LIBRARY") {
        PathBuf::from(env_lib)
    } else if let Some(library) = &paths.library {
        resolve_path(&base_dir, library)
    } else {
        base_dir.join("library.json")
    };

    let sources_dir = paths
        .sources
        .as_deref()
        .map(|p| resolve_path(&base_dir, p))
        .unwrap_or_else(|| base_dir.join("sources"));
    let images_dir = paths
        .images
        .as_deref()
        .map(|p| resolve_path(&base_dir, p))
        .unwrap_or_else(|| base_dir.clone());

    let library = config.as_ref().and_then(|c| c.library.clone()).unwrap_or_default();
    let defaults = PublishSettings::default();
    let publish = PublishSettings {
        library_id: library.library_id.unwrap_or(defaults.library_id),
        min_app_version: library.min_app_version.unwrap_or(defaults.min_app_version),
        image_base_url: library.image_base_url,
        changelog_note: library.changelog_note,
    };

    let client_file = config.as_ref().and_then(|c| c.client.clone()).unwrap_or_default();
    let defaults = ClientSettings::default();
    let client = ClientSettings {
        manifest_url: env("HBLIB_MANIFEST_URL").or(client_file.manifest_url),
        app_version: client_file.app_version.unwrap_or(defaults.app_version),
        cache_max_bytes: client_file.cache_max_bytes.unwrap_or(defaults.cache_max_bytes),
        http_timeout_seconds: client_file
            .http_timeout_seconds
            .unwrap_or(defaults.http_timeout_seconds),
    };

    let extractor_file = config.and_then(|c| c.extractor).unwrap_or_default();
    let defaults = ExtractorSettings::default();
    let extractor = ExtractorSettings {
        command: extractor_file.command.unwrap_or(defaults.command),
        args: extractor_file.args,
        timeout_seconds: extractor_file
            .timeout_seconds
            .unwrap_or(defaults.timeout_seconds),
    };

    ResolvedConfig {
        home,
        library_file,
        sources_dir,
        images_dir,
        config_file,
        publish,
        client,
        extractor,
    }
}

fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("No home directory for the default ~/.hblib")?
        .join(".hblib");

    let file = find_config_file()
        .map(|path| load_config_file(&path).map(|config| (path, config)))
        .transpose()?;

    Ok(build_config(file, |key| std::env::var(key).ok(), default_home))
}

/// Process-wide configuration
pub fn config() -> Result<&'static ResolvedConfig> {
    CONFIG
        .get_or_init(|| load_config().map_err(|e| format!("{:#}", e)))
        .as_ref()
        .map_err(|message| anyhow::anyhow!("{}", message))
}

/// Load again, bypassing the process-wide cache
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the hblib home directory (client state).
pub fn hblib_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_without_file() {
        let config = build_config(None, no_env, PathBuf::from("/home/u/.hblib"));

        assert_eq!(config.home, PathBuf::from("/home/u/.hblib"));
        assert!(config.config_file.is_none());
        assert_eq!(config.publish.library_id, "handball-training-library");
        assert_eq!(config.client.cache_max_bytes, DEFAULT_CACHE_MAX_BYTES);
        assert!(config.client.manifest_url.is_none());
        assert_eq!(config.extractor.command, "hb-extract");
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let hblib_dir = temp.path().join(".hblib");
        std::fs::create_dir_all(&hblib_dir).unwrap();

        let config_path = hblib_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  home: ./state
  library: data/library.json
  sources: pdfs
library:
  image_base_url: https://cdn.example/handball
  changelog_note: Neue Einheiten
client:
  manifest_url: https://cdn.example/handball/manifest.json
  cache_max_bytes: 1048576
extractor:
  command: python3
  args: ["extract.py"]
"#
        )
        .unwrap();

        let parsed = load_config_file(&config_path).unwrap();
        assert_eq!(parsed.version, "1.0");
        assert_eq!(parsed.paths.home.as_deref(), Some("./state"));

        let config = build_config(
            Some((config_path.clone(), parsed)),
            no_env,
            PathBuf::from("/unused"),
        );
        assert_eq!(config.home, hblib_dir.join("./state"));
        assert_eq!(config.library_file, temp.path().join("data/library.json"));
        assert_eq!(config.sources_dir, temp.path().join("pdfs"));
        assert_eq!(config.images_dir, temp.path().to_path_buf());
        assert_eq!(
            config.publish.image_base_url.as_deref(),
            Some("https://cdn.example/handball")
        );
        assert_eq!(config.client.cache_max_bytes, 1_048_576);
        assert_eq!(config.client.app_version, "1.0.0");
        assert_eq!(config.extractor.args, vec!["extract.py".to_string()]);
        assert_eq!(config.config_file, Some(config_path));
    }

    #[test]
    fn test_env_overrides_file() {
        let parsed: ConfigFile = serde_yaml::from_str(
            r#"
version: "1.0"
client:
  manifest_url: https://from-file/manifest.json
"#,
        )
        .unwrap();

        let env: HashMap<&str, &str> = [
            ("HBLIB_HOME", "/srv/hblib"),
            ("HBLIB_MANIFEST_URL", "https://from-env/manifest.json"),
        ]
        .into_iter()
        .collect();

        let config = build_config(
            Some((PathBuf::from("/project/.hblib/config.yaml"), parsed)),
            |key| env.get(key).map(|v| v.to_string()),
            PathBuf::from("/unused"),
        );

        assert_eq!(config.home, PathBuf::from("/srv/hblib"));
        assert_eq!(
            config.client.manifest_url.as_deref(),
            Some("https://from-env/manifest.json")
        );
        assert_eq!(config.library_file, PathBuf::from("/project/library.json"));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
