//! Config file watcher driving hot reload.

use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{ConfigError, ConfigResult};

/// Watches the configuration file and signals modifications.
///
/// The watcher only signals; the owner decides when to re-read the file and
/// publish a snapshot. Signals are coalesced through a capacity-1 channel,
/// so an editor writing the file several times in a burst produces a single
/// pending reload.
pub struct ConfigWatcher {
    path: PathBuf,
    // Dropping the watcher uninstalls the OS hooks.
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Installs a watcher on `path`, sending `()` on `tx` whenever the file
    /// is written or replaced.
    pub fn spawn(path: impl AsRef<Path>, tx: mpsc::Sender<()>) -> ConfigResult<Self> {
        let path = path.as_ref().to_path_buf();
        let watched = path.clone();

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    let relevant = matches!(
                        event.kind,
                        EventKind::Modify(_) | EventKind::Create(_)
                    ) && event.paths.iter().any(|p| same_file_name(p, &watched));
                    if relevant {
                        debug!(path = %watched.display(), "config file changed");
                        // A pending signal already queued is enough.
                        let _ = tx.try_send(());
                    }
                }
                Err(e) => warn!(error = %e, "config watch error"),
            }
        })
        .map_err(|e| ConfigError::Watch {
            message: e.to_string(),
        })?;

        // Watch the parent directory: editors that replace the file would
        // otherwise detach the watch on every save.
        let target = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        watcher
            .watch(target, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::Watch {
                message: e.to_string(),
            })?;

        Ok(Self {
            path,
            _watcher: watcher,
        })
    }

    /// Path being watched.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn same_file_name(a: &Path, b: &Path) -> bool {
    match (a.file_name(), b.file_name()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
