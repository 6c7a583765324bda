//! Recursive directory watching
//!
//! [`DirectoryWatcher`] keeps one non-recursive watch per directory of every
//! configured source tree and answers a single question each cycle: which
//! trees changed since the last [`poll`](DirectoryWatcher::poll)?
//!
//! The watch set is dynamic. Directories created after startup are picked up
//! by re-enumerating their tree at the end of the poll that saw the creation,
//! which also covers directories nested inside the new one that were created
//! before a watch could be placed on their parent. Deleted or moved-out
//! directories are retired together with their watched descendants.
//!
//! When events were lost (the kernel queue overflowed, the event channel was
//! full, or the backend reported an error) every tree is reported as changed
//! and re-enumerated, and watches on directories that no longer exist are
//! dropped.
//!
//! ## Architecture
//!
//! ```text
//! inotify / kqueue
//!       │
//!       ▼
//!  NotifyBackend  ──→  mpsc::channel(1024)  ──→  DirectoryWatcher::poll  ──→  changed tree names
//! ```
//!
//! The OS side sits behind [`WatchBackend`] so that event handling can be
//! driven by a scripted backend in tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use notify::event::{CreateKind, Flag, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::scanner::list_directories;
use crate::SyncError;

// ============================================================================
// WatchBackend
// ============================================================================

/// OS notification source driven by [`DirectoryWatcher`]
pub trait WatchBackend: Send {
    /// Starts a non-recursive watch on `dir`
    fn watch(&mut self, dir: &Path) -> notify::Result<()>;

    /// Stops watching `dir`
    fn unwatch(&mut self, dir: &Path) -> notify::Result<()>;

    /// Returns the next pending event without blocking
    fn try_next(&mut self) -> Option<notify::Result<Event>>;
}

/// Events buffered between two polls before the backend reports an overflow
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// [`WatchBackend`] over the platform's recommended `notify` watcher
pub struct NotifyBackend {
    watcher: RecommendedWatcher,
    events: mpsc::Receiver<notify::Result<Event>>,
    overflowed: Arc<AtomicBool>,
}

impl NotifyBackend {
    /// Creates the OS watcher and its bounded event channel
    pub fn new() -> Result<Self, SyncError> {
        let (tx, events) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let overflowed = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&overflowed);
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match tx.try_send(res) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => flag.store(true, Ordering::Release),
                // Receiver dropped during shutdown
                Err(TrySendError::Closed(_)) => {}
            },
            notify::Config::default(),
        )?;

        Ok(Self {
            watcher,
            events,
            overflowed,
        })
    }
}

impl WatchBackend for NotifyBackend {
    fn watch(&mut self, dir: &Path) -> notify::Result<()> {
        self.watcher.watch(dir, RecursiveMode::NonRecursive)
    }

    fn unwatch(&mut self, dir: &Path) -> notify::Result<()> {
        self.watcher.unwatch(dir)
    }

    fn try_next(&mut self) -> Option<notify::Result<Event>> {
        if let Ok(event) = self.events.try_recv() {
            return Some(event);
        }
        // Dropped events surface once the queue is drained
        if self.overflowed.swap(false, Ordering::AcqRel) {
            warn!(capacity = EVENT_QUEUE_CAPACITY, "Watcher event queue overflowed");
            return Some(Ok(Event::new(EventKind::Other).set_flag(Flag::Rescan)));
        }
        None
    }
}

// ============================================================================
// Event classification
// ============================================================================

/// Opaque handle of one registered directory watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

#[derive(Debug)]
struct WatchedDir {
    handle: WatchId,
    tree: String,
}

/// What a raw event means for the watch set
#[derive(Debug, Clone, PartialEq, Eq)]
enum WatchAction {
    /// Something inside a watched directory changed
    Changed(PathBuf),
    /// A directory appeared (created or moved in)
    DirAppeared(PathBuf),
    /// A path disappeared (deleted or moved out)
    Gone(PathBuf),
}

/// Converts a `notify::Event` into the actions it implies
///
/// Access and metadata-only events are ignored.
fn classify_event(event: &Event) -> Vec<WatchAction> {
    let paths = &event.paths;

    match &event.kind {
        EventKind::Create(kind) => paths
            .iter()
            .map(|p| {
                if *kind == CreateKind::Folder || (*kind != CreateKind::File && p.is_dir()) {
                    WatchAction::DirAppeared(p.clone())
                } else {
                    WatchAction::Changed(p.clone())
                }
            })
            .collect(),

        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.iter().cloned().map(WatchAction::Gone).collect()
        }

        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
            let mut actions = vec![WatchAction::Gone(paths[0].clone())];
            actions.push(appeared(&paths[1]));
            actions
        }

        EventKind::Modify(ModifyKind::Name(_)) => paths.iter().map(|p| appeared(p)).collect(),

        EventKind::Modify(ModifyKind::Metadata(_)) | EventKind::Access(_) => Vec::new(),

        EventKind::Modify(_) | EventKind::Any => {
            paths.iter().cloned().map(WatchAction::Changed).collect()
        }

        EventKind::Other => {
            debug!(kind = ?event.kind, "Ignoring event kind");
            Vec::new()
        }
    }
}

/// A path touched by a rename whose direction the backend did not report
fn appeared(path: &Path) -> WatchAction {
    if path.is_dir() {
        WatchAction::DirAppeared(path.to_path_buf())
    } else if !path.exists() {
        WatchAction::Gone(path.to_path_buf())
    } else {
        WatchAction::Changed(path.to_path_buf())
    }
}

// ============================================================================
// DirectoryWatcher
// ============================================================================

/// Watches every directory of the configured source trees
pub struct DirectoryWatcher<B: WatchBackend> {
    backend: B,
    roots: BTreeMap<String, PathBuf>,
    dirs: BTreeMap<PathBuf, WatchedDir>,
    handles: HashMap<WatchId, PathBuf>,
    next_handle: u64,
}

impl DirectoryWatcher<NotifyBackend> {
    /// Creates a watcher on the OS notification backend
    pub fn new() -> Result<Self, SyncError> {
        Ok(Self::with_backend(NotifyBackend::new()?))
    }
}

impl<B: WatchBackend> DirectoryWatcher<B> {
    /// Creates a watcher over an arbitrary backend
    pub fn with_backend(backend: B) -> Self {
        Self {
            backend,
            roots: BTreeMap::new(),
            dirs: BTreeMap::new(),
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    /// Registers every directory under each tree root, roots included
    ///
    /// Directories that cannot be enumerated or watched are logged and
    /// skipped; configuration never fails.
    pub fn configure(&mut self, trees: &BTreeMap<String, PathBuf>) {
        for (name, root) in trees {
            self.roots.insert(name.clone(), root.clone());
            let added = self.register_tree(name);
            info!(tree = %name, root = %root.display(), directories = added, "Watching source tree");
        }
    }

    /// Drains pending events and returns the names of the trees they touched
    ///
    /// Never blocks. Trees in which a directory appeared are re-enumerated
    /// before returning, so every directory that exists at that point is
    /// watched. A backend error or an event flagged for rescan marks every
    /// tree as changed.
    pub fn poll(&mut self) -> BTreeSet<String> {
        let mut changed = BTreeSet::new();
        let mut rescan = BTreeSet::new();
        let mut events_lost = false;

        while let Some(result) = self.backend.try_next() {
            let event = match result {
                Ok(event) if event.need_rescan() => {
                    events_lost = true;
                    continue;
                }
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "Directory watcher error");
                    events_lost = true;
                    continue;
                }
            };

            for action in classify_event(&event) {
                self.apply(action, &mut changed, &mut rescan);
            }
        }

        if events_lost {
            warn!(trees = self.roots.len(), "Watcher events lost, rescanning every tree");
            self.prune_missing();
            changed.extend(self.roots.keys().cloned());
            rescan.extend(self.roots.keys().cloned());
        }

        for tree in &rescan {
            let added = self.register_tree(tree);
            if added > 0 {
                debug!(tree = %tree, directories = added, "Registered new directories");
            }
        }

        changed
    }

    /// Number of directories currently watched
    pub fn watched_count(&self) -> usize {
        self.dirs.len()
    }

    /// Returns true if `dir` has a live watch
    pub fn is_watched(&self, dir: &Path) -> bool {
        self.dirs.contains_key(dir)
    }

    #[cfg(test)]
    fn handle_of(&self, dir: &Path) -> Option<WatchId> {
        self.dirs.get(dir).map(|w| w.handle)
    }

    #[cfg(test)]
    fn path_of(&self, handle: WatchId) -> Option<&Path> {
        self.handles.get(&handle).map(PathBuf::as_path)
    }

    fn apply(
        &mut self,
        action: WatchAction,
        changed: &mut BTreeSet<String>,
        rescan: &mut BTreeSet<String>,
    ) {
        let path = match &action {
            WatchAction::Changed(p) | WatchAction::DirAppeared(p) | WatchAction::Gone(p) => p,
        };

        let tree = match self.owner_tree(path) {
            Some(tree) => tree.to_string(),
            None => {
                debug!(path = %path.display(), "Event outside of any watched directory");
                return;
            }
        };

        match &action {
            WatchAction::Changed(_) => {}
            WatchAction::DirAppeared(dir) => {
                // A directory reappearing at a registered path carries a dead watch
                if self.dirs.contains_key(dir) {
                    self.retire(dir);
                }
                rescan.insert(tree.clone());
            }
            WatchAction::Gone(dir) => {
                if self.dirs.contains_key(dir) {
                    self.retire(dir);
                }
            }
        }

        changed.insert(tree);
    }

    /// Tree of the nearest watched directory at or above `path`
    fn owner_tree(&self, path: &Path) -> Option<&str> {
        path.ancestors()
            .find_map(|p| self.dirs.get(p))
            .map(|w| w.tree.as_str())
    }

    /// Watches every not-yet-watched directory of `tree`; returns how many were added
    fn register_tree(&mut self, tree: &str) -> usize {
        let root = match self.roots.get(tree) {
            Some(root) => root.clone(),
            None => return 0,
        };

        list_directories(&root)
            .into_iter()
            .filter(|dir| self.register(dir, tree))
            .count()
    }

    fn register(&mut self, dir: &Path, tree: &str) -> bool {
        if self.dirs.contains_key(dir) {
            return false;
        }

        if let Err(e) = self.backend.watch(dir) {
            warn!(path = %dir.display(), error = %e, "Failed to watch directory");
            return false;
        }

        let handle = WatchId(self.next_handle);
        self.next_handle += 1;
        self.handles.insert(handle, dir.to_path_buf());
        self.dirs.insert(
            dir.to_path_buf(),
            WatchedDir {
                handle,
                tree: tree.to_string(),
            },
        );
        true
    }

    /// Drops the watch on `dir` and on every watched directory below it
    fn retire(&mut self, dir: &Path) {
        let retired: Vec<WatchId> = self
            .dirs
            .range(dir.to_path_buf()..)
            .take_while(|(p, _)| p.starts_with(dir))
            .map(|(_, w)| w.handle)
            .collect();

        for handle in retired {
            self.release(handle);
        }
    }

    /// Drops every watch whose directory no longer exists
    fn prune_missing(&mut self) {
        let stale: Vec<WatchId> = self
            .handles
            .iter()
            .filter(|(_, path)| !path.is_dir())
            .map(|(handle, _)| *handle)
            .collect();

        for handle in stale {
            self.release(handle);
        }
    }

    /// Removes one registration from both maps and stops the OS watch
    fn release(&mut self, handle: WatchId) {
        let Some(path) = self.handles.remove(&handle) else {
            return;
        };
        self.dirs.remove(&path);

        // The OS usually drops the watch of a deleted directory on its own
        if let Err(e) = self.backend.unwatch(&path) {
            debug!(path = %path.display(), error = %e, "Unwatch failed");
        }
        debug!(path = %path.display(), handle = handle.0, "Retired directory watch");
    }
}
