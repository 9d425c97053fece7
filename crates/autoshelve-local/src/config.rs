use std::path::PathBuf;

use anyhow::Context;
use autoshelve_core::EngineConfig;
use clap::Parser;

/// Configuration for the autoshelve daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "autoshelve")]
#[command(about = "Periodically shelve pending changes of local git working copies")]
pub struct Config {
    /// Working copy to shelve (repeatable)
    #[arg(long = "workspace", env = "AUTOSHELVE_WORKSPACES", value_delimiter = ',')]
    pub workspaces: Vec<PathBuf>,

    /// Base directory of the shelveset store
    #[arg(long, env = "AUTOSHELVE_STORE_DIR")]
    pub store_dir: Option<PathBuf>,

    /// Owner identity in `domain\login` form
    #[arg(long, env = "AUTOSHELVE_OWNER")]
    pub owner: Option<String>,

    /// JSON options file, reloaded when it changes
    #[arg(long, env = "AUTOSHELVE_OPTIONS_FILE")]
    pub options_file: Option<PathBuf>,

    /// Shelveset name pattern ({0} workspace, {1} owner, {2} time, {3} domain, {4} login)
    #[arg(long, env = "AUTOSHELVE_NAME")]
    pub name: Option<String>,

    /// Minutes between attempts
    #[arg(long, env = "AUTOSHELVE_INTERVAL")]
    pub interval: Option<f64>,

    /// Shelvesets to keep (only with a timestamped name pattern; 0 keeps all)
    #[arg(long, env = "AUTOSHELVE_MAX_SHELVESETS")]
    pub max_shelvesets: Option<u16>,

    /// Stop shelving while a debugging session is running
    #[arg(long, env = "AUTOSHELVE_PAUSE_ON_DEBUG")]
    pub pause_on_debug: bool,

    /// Shelve once and exit
    #[arg(long)]
    pub once: bool,
}

impl Config {
    /// Get the effective shelveset store directory.
    pub fn effective_store_dir(&self) -> PathBuf {
        self.store_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("autoshelve")
                .join("shelvesets")
        })
    }

    /// Get the effective owner identity.
    pub fn effective_owner(&self) -> String {
        if let Some(owner) = &self.owner {
            return owner.clone();
        }
        let login = std::env::var("USERNAME")
            .or_else(|_| std::env::var("USER"))
            .unwrap_or_else(|_| "unknown".to_string());
        match std::env::var("USERDOMAIN") {
            Ok(domain) if !domain.is_empty() => format!("{}\\{}", domain, login),
            _ => login,
        }
    }

    /// Engine options: defaults, then the options file, then flags.
    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let base = match &self.options_file {
            Some(path) if path.exists() => EngineConfig::from_json_file(path)
                .with_context(|| format!("loading options from {}", path.display()))?,
            _ => EngineConfig::default(),
        };
        let config = self.apply_flags(base).sanitized();
        config.validate()?;
        Ok(config)
    }

    /// Overlay command-line options on `config`.
    pub fn apply_flags(&self, mut config: EngineConfig) -> EngineConfig {
        if let Some(name) = &self.name {
            config.name_pattern = name.clone();
        }
        if let Some(interval) = self.interval {
            config.interval_minutes = interval;
        }
        if let Some(max) = self.max_shelvesets {
            config.maximum_shelvesets = max;
        }
        if self.pause_on_debug {
            config.pause_on_debug = true;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["autoshelve"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_repeated_workspaces() {
        let config = parse(&["--workspace", "/src/a", "--workspace", "/src/b,/src/c"]);
        assert_eq!(
            config.workspaces,
            vec![
                PathBuf::from("/src/a"),
                PathBuf::from("/src/b"),
                PathBuf::from("/src/c")
            ]
        );
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["--owner", "CORP\\jdoe"]);
        assert_eq!(config.effective_owner(), "CORP\\jdoe");
        assert!(config.effective_store_dir().ends_with("autoshelve/shelvesets"));
        assert_eq!(config.engine_config().unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_flags_override_options_file() {
        let dir = TempDir::new().unwrap();
        let options = dir.path().join("options.json");
        std::fs::write(
            &options,
            r#"{"name_pattern": "File {0} {2}", "maximum_shelvesets": 3, "interval_minutes": 10}"#,
        )
        .unwrap();

        let config = parse(&[
            "--options-file",
            options.to_str().unwrap(),
            "--interval",
            "2",
            "--pause-on-debug",
        ]);
        let engine = config.engine_config().unwrap();

        assert_eq!(engine.name_pattern, "File {0} {2}");
        assert_eq!(engine.maximum_shelvesets, 3);
        assert_eq!(engine.interval_minutes, 2.0);
        assert!(engine.pause_on_debug);
    }

    #[test]
    fn test_invalid_interval_rejected() {
        let config = parse(&["--interval", "0"]);
        assert!(config.engine_config().is_err());
    }

    #[test]
    fn test_name_flag_is_sanitized() {
        let config = parse(&["--name", "Auto: {0}"]);
        assert_eq!(config.engine_config().unwrap().name_pattern, "Auto {0}");
    }
}
