//! Cache configuration and cache directory resolution

use crate::codec::{Codec, DEFAULT_COMPRESSION_LEVEL};
use crate::store::CacheStore;
use crate::{Error, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable that pins the cache root
pub const CACHE_DIR_ENV: &str = "SQLCACHE_CACHE_DIR";

/// Settings for one logical cache
///
/// ```toml
/// root = "/var/cache/analytics"
/// name = "warehouse"
/// max_total_size = 1073741824
/// max_age_secs = 86400
/// compression_level = 3
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Cache root; resolved from the environment when absent
    pub root: Option<PathBuf>,
    /// Logical cache name, a sub-directory of the root
    pub name: Option<String>,
    /// Size budget in bytes applied when pruning
    pub max_total_size: Option<u64>,
    /// Age limit in seconds applied when pruning
    pub max_age_secs: Option<u64>,
    /// zstd level for new entries
    pub compression_level: i32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: None,
            name: None,
            max_total_size: None,
            max_age_secs: None,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl CacheConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::configuration(format!("Invalid cache configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(e, path, "read"))?;
        Self::from_toml_str(&content).map_err(|e| match e {
            Error::Configuration { message } => {
                Error::configuration(format!("{}: {message}", path.display()))
            }
            other => other,
        })
    }

    /// Reject values that cannot be acted on
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        if !zstd::compression_level_range().contains(&self.compression_level) {
            return Err(Error::configuration(format!(
                "compression_level {} is outside the supported range {:?}",
                self.compression_level,
                zstd::compression_level_range()
            )));
        }
        if self.max_age_secs.is_some() && self.max_age().is_none() {
            return Err(Error::configuration("max_age_secs is too large"));
        }
        Ok(())
    }

    /// Age limit as a duration
    #[must_use]
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(Duration::try_seconds)
    }

    /// Codec configured with the compression level
    #[must_use]
    pub const fn codec(&self) -> Codec {
        Codec::new(self.compression_level)
    }

    /// Directory holding this cache's entries
    pub fn resolve_dir(&self) -> Result<PathBuf> {
        let root = match &self.root {
            Some(root) => root.clone(),
            None => cache_root()?,
        };
        Ok(match &self.name {
            Some(name) => {
                validate_name(name)?;
                root.join(name)
            }
            None => root,
        })
    }

    /// Open (and create) the store this configuration describes
    pub fn open_store(&self) -> Result<CacheStore> {
        CacheStore::open(self.resolve_dir()?)
    }
}

fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(Error::configuration(format!(
            "cache name {name:?} must be a single non-hidden directory name"
        )))
    }
}

/// Inputs for determining the cache root directory
#[derive(Debug, Clone, Default)]
pub struct CacheInputs {
    /// Explicit override (`SQLCACHE_CACHE_DIR`)
    pub cache_dir_override: Option<PathBuf>,
    /// `XDG_CACHE_HOME`
    pub xdg_cache_home: Option<PathBuf>,
    /// Platform cache directory
    pub os_cache_dir: Option<PathBuf>,
    /// Home directory
    pub home_dir: Option<PathBuf>,
    /// Temporary directory
    pub temp_dir: PathBuf,
}

impl CacheInputs {
    /// Read the inputs from the process environment
    #[must_use]
    pub fn from_env() -> Self {
        let var = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from)
        };
        Self {
            cache_dir_override: var(CACHE_DIR_ENV),
            xdg_cache_home: var("XDG_CACHE_HOME"),
            os_cache_dir: dirs::cache_dir(),
            home_dir: dirs::home_dir(),
            temp_dir: std::env::temp_dir(),
        }
    }
}

/// Pick the first writable cache root
///
/// Resolution order:
/// 1. `SQLCACHE_CACHE_DIR`
/// 2. `$XDG_CACHE_HOME/sqlcache`
/// 3. platform cache dir `/sqlcache`
/// 4. `~/.sqlcache/cache`
/// 5. `$TMPDIR/sqlcache`
pub fn cache_root_from_inputs(inputs: CacheInputs) -> Result<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Some(dir) = inputs
        .cache_dir_override
        .filter(|p| !p.as_os_str().is_empty())
    {
        candidates.push(dir);
    }
    if let Some(xdg) = inputs.xdg_cache_home {
        candidates.push(xdg.join("sqlcache"));
    }
    if let Some(os_cache) = inputs.os_cache_dir {
        candidates.push(os_cache.join("sqlcache"));
    }
    if let Some(home) = inputs.home_dir {
        candidates.push(home.join(".sqlcache/cache"));
    }
    candidates.push(inputs.temp_dir.join("sqlcache"));

    for path in candidates {
        // Nix build sandboxes point HOME at a directory that never exists
        if path.starts_with("/homeless-shelter") {
            continue;
        }
        if is_writable_dir(&path) {
            return Ok(path);
        }
    }
    Err(Error::configuration(
        "Failed to determine a writable cache directory",
    ))
}

/// Resolve the cache root from the process environment
pub fn cache_root() -> Result<PathBuf> {
    cache_root_from_inputs(CacheInputs::from_env())
}

fn is_writable_dir(path: &Path) -> bool {
    if path.exists() {
        // Some CI environments mount read-only cache directories
        let probe = path.join(".write_probe");
        let writable = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&probe)
            .is_ok();
        if writable {
            let _ = fs::remove_file(&probe);
        }
        return writable;
    }
    fs::create_dir_all(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn inputs(tmp: &Path) -> CacheInputs {
        CacheInputs {
            temp_dir: tmp.join("tmp"),
            ..CacheInputs::default()
        }
    }

    #[test]
    fn override_wins() {
        let tmp = TempDir::new().unwrap();
        let dir = cache_root_from_inputs(CacheInputs {
            cache_dir_override: Some(tmp.path().join("pinned")),
            xdg_cache_home: Some(tmp.path().join("xdg")),
            ..inputs(tmp.path())
        })
        .unwrap();
        assert_eq!(dir, tmp.path().join("pinned"));
        assert!(dir.is_dir());
    }

    #[test]
    fn xdg_before_platform_dir() {
        let tmp = TempDir::new().unwrap();
        let dir = cache_root_from_inputs(CacheInputs {
            xdg_cache_home: Some(tmp.path().join("xdg")),
            os_cache_dir: Some(tmp.path().join("os")),
            ..inputs(tmp.path())
        })
        .unwrap();
        assert_eq!(dir, tmp.path().join("xdg/sqlcache"));
    }

    #[test]
    fn empty_override_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let dir = cache_root_from_inputs(CacheInputs {
            cache_dir_override: Some(PathBuf::new()),
            home_dir: Some(tmp.path().join("home")),
            ..inputs(tmp.path())
        })
        .unwrap();
        assert_eq!(dir, tmp.path().join("home/.sqlcache/cache"));
    }

    #[test]
    fn skips_homeless_shelter() {
        let tmp = TempDir::new().unwrap();
        let dir = cache_root_from_inputs(CacheInputs {
            xdg_cache_home: Some(PathBuf::from("/homeless-shelter/.cache")),
            home_dir: Some(PathBuf::from("/homeless-shelter")),
            ..inputs(tmp.path())
        })
        .unwrap();
        assert_eq!(dir, tmp.path().join("tmp/sqlcache"));
    }

    #[cfg(unix)]
    #[test]
    fn read_only_candidate_falls_through() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let locked = tmp.path().join("locked");
        fs::create_dir_all(locked.join("sqlcache")).unwrap();
        fs::set_permissions(locked.join("sqlcache"), fs::Permissions::from_mode(0o555)).unwrap();

        let dir = cache_root_from_inputs(CacheInputs {
            xdg_cache_home: Some(locked.clone()),
            home_dir: Some(tmp.path().join("home")),
            ..inputs(tmp.path())
        })
        .unwrap();

        fs::set_permissions(locked.join("sqlcache"), fs::Permissions::from_mode(0o755)).unwrap();
        // Root ignores permission bits, in which case the first candidate is fine
        assert!(dir == locked.join("sqlcache") || dir == tmp.path().join("home/.sqlcache/cache"));
    }

    #[test]
    fn toml_roundtrip_and_defaults() {
        let config = CacheConfig::from_toml_str(
            r#"
            name = "warehouse"
            max_total_size = 1048576
            max_age_secs = 3600
            "#,
        )
        .unwrap();
        assert_eq!(config.name.as_deref(), Some("warehouse"));
        assert_eq!(config.compression_level, DEFAULT_COMPRESSION_LEVEL);
        assert_eq!(config.max_age(), Some(Duration::hours(1)));
        assert_eq!(config.max_total_size, Some(1_048_576));

        let empty = CacheConfig::from_toml_str("").unwrap();
        assert_eq!(empty, CacheConfig::default());
    }

    #[test]
    fn unknown_keys_and_bad_values_are_rejected() {
        assert!(CacheConfig::from_toml_str("max_size = 3").is_err());
        assert!(CacheConfig::from_toml_str("compression_level = 99").is_err());
        assert!(CacheConfig::from_toml_str("name = \"../escape\"").is_err());
        assert!(CacheConfig::from_toml_str("name = \".hidden\"").is_err());
    }

    #[test]
    fn load_reports_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sqlcache.toml");
        fs::write(&path, "compression_level = \"high\"").unwrap();
        let err = CacheConfig::load(&path).unwrap_err().to_string();
        assert!(err.contains("sqlcache.toml"), "{err}");

        let missing = CacheConfig::load(&tmp.path().join("absent.toml")).unwrap_err();
        assert!(matches!(missing, Error::Io { .. }));
    }

    #[test]
    fn named_cache_is_a_subdirectory() {
        let tmp = TempDir::new().unwrap();
        let config = CacheConfig {
            root: Some(tmp.path().to_path_buf()),
            name: Some("sales".into()),
            ..CacheConfig::default()
        };
        let store = config.open_store().unwrap();
        assert_eq!(store.root(), tmp.path().join("sales"));
        assert!(store.root().is_dir());
    }
}
