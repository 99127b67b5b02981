use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::Level;

const CONFIG_DIR: &str = ".commitvault";
const DEFAULT_AUTHOR: &str = "cli-user";

/// Settings read from `.commitvault/config.toml`. Every key is optional.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub database: Option<PathBuf>,
    pub author: Option<String>,
    pub log_level: Option<String>,
}

impl Config {
    /// Loads `explicit` if given, otherwise the default location when it
    /// exists. A missing explicit file is an error; a missing default is not.
    pub fn load(explicit: Option<&Path>, base: &Path) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let default = base.join(CONFIG_DIR).join("config.toml");
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn database_path(&self, flag: Option<PathBuf>, base: &Path) -> PathBuf {
        flag.or_else(|| self.database.clone())
            .unwrap_or_else(|| base.join(CONFIG_DIR).join("vault.db"))
    }

    pub fn author(&self, flag: Option<String>) -> String {
        flag.or_else(|| self.author.clone())
            .unwrap_or_else(|| DEFAULT_AUTHOR.to_string())
    }

    /// `-v` raises the level to info, `-vv` to debug, `-vvv` to trace.
    pub fn log_level(&self, verbose: u8) -> Result<Level> {
        let configured = match &self.log_level {
            Some(level) => level
                .parse::<Level>()
                .map_err(|_| anyhow::anyhow!("Unknown log level '{}'", level))?,
            None => Level::WARN,
        };

        let from_flag = match verbose {
            0 => return Ok(configured),
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };
        // `Level` orders more verbose levels as greater
        Ok(configured.max(from_flag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        let base = Path::new("/work");

        assert_eq!(
            config.database_path(None, base),
            PathBuf::from("/work/.commitvault/vault.db")
        );
        assert_eq!(config.author(None), "cli-user");
        assert_eq!(config.log_level(0).unwrap(), Level::WARN);
    }

    #[test]
    fn test_flags_override_file() {
        let config = Config::parse(
            r#"
            database = "/data/thesis.db"
            author = "advisor-3"
            log_level = "info"
            "#,
        )
        .unwrap();
        let base = Path::new("/work");

        assert_eq!(
            config.database_path(None, base),
            PathBuf::from("/data/thesis.db")
        );
        assert_eq!(
            config.database_path(Some(PathBuf::from("/tmp/x.db")), base),
            PathBuf::from("/tmp/x.db")
        );
        assert_eq!(config.author(Some("student-9".into())), "student-9");
        assert_eq!(config.log_level(0).unwrap(), Level::INFO);
        assert_eq!(config.log_level(2).unwrap(), Level::DEBUG);
    }

    #[test]
    fn test_rejects_unknown_keys_and_levels() {
        assert!(Config::parse("colour = true").is_err());

        let config = Config::parse("log_level = \"loud\"").unwrap();
        assert!(config.log_level(0).is_err());
    }

    #[test]
    fn test_load_from_default_location() {
        let dir = TempDir::new().unwrap();
        assert_eq!(Config::load(None, dir.path()).unwrap(), Config::default());

        std::fs::create_dir_all(dir.path().join(CONFIG_DIR)).unwrap();
        std::fs::write(
            dir.path().join(CONFIG_DIR).join("config.toml"),
            "author = \"ta-1\"\n",
        )
        .unwrap();

        let config = Config::load(None, dir.path()).unwrap();
        assert_eq!(config.author(None), "ta-1");
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Config::load(Some(&missing), dir.path()).is_err());
    }
}
