use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::cdb::Cdb;

/// Watch `path` and swap a freshly opened database into `db` whenever the
/// file changes. Readers holding the old handle keep using it.
pub fn spawn(path: PathBuf, db: Arc<ArcSwap<Cdb>>) {
    // 使用阻塞线程持有watcher，避免异步生命周期问题。
    thread::spawn(move || {
        if let Err(err) = run_watcher(&path, db) {
            error!(target = "watcher", error = %err, "database watcher exited with error");
        }
    });
}

fn run_watcher(path: &Path, db: Arc<ArcSwap<Cdb>>) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    // Databases are replaced by rename, so watch the directory, not the inode.
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    watcher.watch(dir, RecursiveMode::NonRecursive)?;

    info!(target = "watcher", path = %path.display(), "database watcher started");

    for res in rx {
        match res {
            Ok(event) => {
                if !event.paths.iter().any(|p| p.file_name() == path.file_name()) {
                    continue;
                }
                reload(path, &db);
            }
            Err(err) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}

/// Reopen the database, retrying briefly to ride out a replace in progress.
pub fn reload(path: &Path, db: &ArcSwap<Cdb>) -> bool {
    let mut retries = 3;
    loop {
        match Cdb::open(path) {
            Ok(fresh) => {
                db.store(Arc::new(fresh));
                info!(target = "watcher", path = %path.display(), "database reloaded");
                return true;
            }
            Err(err) => {
                retries -= 1;
                if retries == 0 {
                    warn!(target = "watcher", path = %path.display(), error = %err, "database reload failed, keeping old handle");
                    return false;
                }
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}
