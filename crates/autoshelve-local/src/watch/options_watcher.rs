use std::path::{Path, PathBuf};
use std::sync::Arc;

use autoshelve_core::{EngineConfig, HostController, ShelveError, ShelveResult};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;

/// Load the options file, overlay command-line flags and apply the result.
///
/// Invalid options are rejected as a whole and the engine keeps its
/// current options.
pub fn reload(path: &Path, flags: &Config, controller: &HostController) -> ShelveResult<EngineConfig> {
    let options = flags
        .apply_flags(EngineConfig::from_json_file(path)?)
        .sanitized();
    options.validate()?;
    controller.apply_options(&options)?;
    Ok(options)
}

/// Reloads engine options whenever the options file changes.
///
/// The watch stops when this value is dropped.
pub struct OptionsWatcher {
    _watcher: RecommendedWatcher,
}

impl OptionsWatcher {
    /// Start watching `path`. Must be called from within a Tokio runtime.
    pub fn spawn(path: PathBuf, flags: Config, controller: Arc<HostController>) -> ShelveResult<Self> {
        // One pending reload is enough; bursts of events coalesce into it
        let (tx, mut rx) = mpsc::channel::<()>(1);

        let target = path.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let relevant = matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
                        && event.paths.iter().any(|p| p.file_name() == target.file_name());
                    if relevant {
                        let _ = tx.try_send(());
                    }
                }
                Err(e) => {
                    warn!("Watch error: {}", e);
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|e| ShelveError::Internal(format!("Failed to create watcher: {}", e)))?;

        // Watch the file's parent directory so replaced files are seen too
        let watch_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                ShelveError::Internal(format!("Failed to watch {}: {}", watch_dir.display(), e))
            })?;

        let reload_path = path.clone();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                match reload(&reload_path, &flags, &controller) {
                    Ok(options) => info!(
                        "Reloaded options from {}: pattern '{}', interval {} min, maximum {}",
                        reload_path.display(),
                        options.name_pattern,
                        options.interval_minutes,
                        options.maximum_shelvesets
                    ),
                    Err(e) => warn!(
                        "Ignoring options in {}: {}",
                        reload_path.display(),
                        e
                    ),
                }
            }
        });

        info!("Watching options file {}", path.display());
        Ok(Self { _watcher: watcher })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoshelve_core::memory::{MemoryBackend, StaticContext};
    use autoshelve_core::AutoShelve;
    use clap::Parser;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup() -> (Arc<HostController>, TempDir) {
        let engine = AutoShelve::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(StaticContext::new("https://tfs.example.com/tfs")),
            EngineConfig::default(),
        )
        .unwrap();
        (Arc::new(HostController::new(engine)), TempDir::new().unwrap())
    }

    fn no_flags() -> Config {
        Config::try_parse_from(["autoshelve"]).unwrap()
    }

    #[tokio::test]
    async fn test_reload_applies_options() {
        let (controller, dir) = setup();
        let path = dir.path().join("options.json");
        std::fs::write(&path, r#"{"name_pattern": "Auto/{0} {2}", "maximum_shelvesets": 2}"#).unwrap();

        let options = reload(&path, &no_flags(), &controller).unwrap();

        assert_eq!(options.name_pattern, "Auto{0} {2}");
        assert_eq!(controller.engine().maximum_shelvesets(), 2);
    }

    #[tokio::test]
    async fn test_reload_keeps_previous_on_error() {
        let (controller, dir) = setup();
        let path = dir.path().join("options.json");

        std::fs::write(&path, r#"{"interval_minutes": 0}"#).unwrap();
        assert!(reload(&path, &no_flags(), &controller).is_err());

        std::fs::write(&path, "{ broken").unwrap();
        assert!(reload(&path, &no_flags(), &controller).is_err());

        assert_eq!(controller.engine().config(), EngineConfig::default());
    }

    #[tokio::test]
    async fn test_flags_win_over_reloaded_file() {
        let (controller, dir) = setup();
        let path = dir.path().join("options.json");
        std::fs::write(&path, r#"{"interval_minutes": 9}"#).unwrap();
        let flags = Config::try_parse_from(["autoshelve", "--interval", "3"]).unwrap();

        reload(&path, &flags, &controller).unwrap();
        assert_eq!(controller.engine().interval(), 3.0);
    }

    #[tokio::test]
    async fn test_watcher_picks_up_changes() {
        let (controller, dir) = setup();
        let path = dir.path().join("options.json");
        std::fs::write(&path, "{}").unwrap();

        let _watcher = OptionsWatcher::spawn(path.clone(), no_flags(), controller.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(&path, r#"{"interval_minutes": 7.5}"#).unwrap();

        let reloaded = tokio::time::timeout(Duration::from_secs(5), async {
            while controller.engine().interval() != 7.5 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(reloaded.is_ok(), "options were not reloaded");
    }
}
