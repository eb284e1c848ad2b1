//! Background change detection for plugin hot reload.
//!
//! The watcher polls the modification time of every loaded auto-reload
//! plugin and reports stable changes over a channel. It never touches the
//! configs or the registry; the update thread republishes a snapshot of the
//! [`WatchTarget`]s after every tick.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};

use crate::config::{ConfigId, LoaderSettings, PluginLoadConfig};
use crate::error::Result;

/// Configuration for the change watcher.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Delay between polling passes, and before the first pass.
    pub interval: Duration,
    /// Window a new timestamp must stay unchanged for before it is reported.
    pub settle: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            settle: Duration::from_millis(500),
        }
    }
}

impl WatchConfig {
    /// Create a new watch configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the polling interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the settle window.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }
}

/// Watcher thread state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatcherState {
    /// Not started yet.
    Idle,
    /// Polling.
    Running,
    /// Cancelled, or its receiver went away.
    Stopped,
}

impl std::fmt::Display for WatcherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// Notification sent from the watcher to the update thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A load-at-startup plugin should be loaded.
    StartupLoad {
        /// Config to load.
        config: ConfigId,
    },
    /// A loaded auto-reload plugin's file changed and settled.
    Changed {
        /// Config whose file changed.
        config: ConfigId,
        /// New modification time.
        modified: SystemTime,
    },
}

impl WatchEvent {
    /// Config the event is about.
    pub fn config(&self) -> ConfigId {
        match self {
            Self::StartupLoad { config } => *config,
            Self::Changed { config, .. } => *config,
        }
    }
}

/// Read-only view of one config, as seen by the watcher thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    /// Config the target mirrors.
    pub config: ConfigId,
    /// Plugin file path.
    pub path: PathBuf,
    /// Load when the host starts.
    pub load_at_startup: bool,
    /// Whether the plugin is loaded.
    pub loaded: bool,
    /// Whether file changes trigger a reload.
    pub auto_reload: bool,
    /// Modification time at the last successful load.
    pub file_changed: Option<SystemTime>,
}

impl From<&PluginLoadConfig> for WatchTarget {
    fn from(config: &PluginLoadConfig) -> Self {
        Self {
            config: config.id(),
            path: config.file_path.clone(),
            load_at_startup: config.load_at_startup,
            loaded: config.is_loaded(),
            auto_reload: config.auto_reload,
            file_changed: config.file_changed(),
        }
    }
}

/// Snapshot of watch targets shared with the watcher thread.
#[derive(Debug, Clone, Default)]
pub struct WatchTargets {
    inner: Arc<RwLock<Vec<WatchTarget>>>,
}

impl WatchTargets {
    /// Create an empty target set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the targets with the current state of `settings`.
    pub fn publish(&self, settings: &LoaderSettings) {
        let targets = settings.iter().map(WatchTarget::from).collect();
        *self.inner.write() = targets;
    }

    /// Copy of the current targets.
    pub fn snapshot(&self) -> Vec<WatchTarget> {
        self.inner.read().clone()
    }

    /// Number of targets.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Check if there are no targets.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// Reads a file's modification time; `None` when missing or unreadable.
pub type ModifiedProbe = Arc<dyn Fn(&Path) -> Option<SystemTime> + Send + Sync>;

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Decide whether `target` changed and settled.
///
/// Returns the new modification time when it differs from the stored one
/// and reads the same again after `wait` returns. `wait` returns false when
/// the watcher was cancelled while waiting.
pub fn settle_change<W>(
    target: &WatchTarget,
    probe: &dyn Fn(&Path) -> Option<SystemTime>,
    wait: W,
) -> Option<SystemTime>
where
    W: FnOnce() -> bool,
{
    if !(target.loaded && target.auto_reload) {
        return None;
    }

    let first = probe(&target.path)?;
    if target.file_changed == Some(first) {
        return None;
    }

    if !wait() {
        return None;
    }

    let second = probe(&target.path)?;
    if second != first {
        tracing::trace!("{} is still being written", target.path.display());
        return None;
    }

    Some(second)
}

/// Polls plugin files on a dedicated thread.
pub struct ChangeWatcher {
    config: WatchConfig,
    targets: WatchTargets,
    events: Sender<WatchEvent>,
    probe: ModifiedProbe,
    state: Arc<Mutex<WatcherState>>,
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ChangeWatcher {
    /// Create a watcher over `targets` that reports on `events`.
    pub fn new(config: WatchConfig, targets: WatchTargets, events: Sender<WatchEvent>) -> Self {
        Self {
            config,
            targets,
            events,
            probe: Arc::new(modified_time),
            state: Arc::new(Mutex::new(WatcherState::Idle)),
            cancel: None,
            handle: None,
        }
    }

    /// Replace how modification times are read.
    pub fn with_probe(mut self, probe: ModifiedProbe) -> Self {
        self.probe = probe;
        self
    }

    /// Get the watcher configuration.
    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> WatcherState {
        *self.state.lock()
    }

    /// Start the watcher thread. Only an idle watcher starts.
    pub fn start(&mut self) -> Result<()> {
        if self.state() != WatcherState::Idle {
            tracing::debug!("Change watcher is {}, not starting", self.state());
            return Ok(());
        }

        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded(0);
        let worker = WatchLoop {
            config: self.config.clone(),
            targets: self.targets.clone(),
            events: self.events.clone(),
            probe: self.probe.clone(),
            cancel: cancel_rx,
        };
        let state = self.state.clone();

        // Running must be set before the thread can finish and mark Stopped.
        *self.state.lock() = WatcherState::Running;
        let spawned = std::thread::Builder::new()
            .name("live-plugin-watcher".to_string())
            .spawn(move || {
                worker.run();
                *state.lock() = WatcherState::Stopped;
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                *self.state.lock() = WatcherState::Idle;
                return Err(e.into());
            }
        };

        self.cancel = Some(cancel_tx);
        self.handle = Some(handle);

        tracing::info!("Change watcher started");
        Ok(())
    }

    /// Cancel the watcher and wait for its thread to exit.
    pub fn stop(&mut self) {
        drop(self.cancel.take());

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Change watcher thread panicked");
            }
            tracing::info!("Change watcher stopped");
        }

        *self.state.lock() = WatcherState::Stopped;
    }
}

impl std::fmt::Debug for ChangeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeWatcher")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("targets", &self.targets.len())
            .finish()
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WatchLoop {
    config: WatchConfig,
    targets: WatchTargets,
    events: Sender<WatchEvent>,
    probe: ModifiedProbe,
    cancel: Receiver<()>,
}

impl WatchLoop {
    fn run(self) {
        if !self.sleep(self.config.interval) {
            return;
        }

        for target in self.targets.snapshot() {
            if !target.load_at_startup {
                continue;
            }
            if !self.send(WatchEvent::StartupLoad {
                config: target.config,
            }) {
                return;
            }
        }

        #[cfg(feature = "watch")]
        let (mut nudger, nudges) = match nudge::DirectoryNudger::new() {
            Ok((nudger, nudges)) => (Some(nudger), nudges),
            Err(e) => {
                tracing::warn!("Falling back to polling only: {}", e);
                (None, crossbeam_channel::never())
            }
        };
        #[cfg(not(feature = "watch"))]
        let nudges = crossbeam_channel::never::<()>();

        loop {
            if !self.wait_for_poll(&nudges) {
                return;
            }

            let targets = self.targets.snapshot();

            #[cfg(feature = "watch")]
            if let Some(nudger) = nudger.as_mut() {
                nudger.sync(&targets);
            }

            for target in &targets {
                if self.is_cancelled() {
                    return;
                }
                let changed = settle_change(target, self.probe.as_ref(), || {
                    self.sleep(self.config.settle)
                });
                if let Some(modified) = changed {
                    tracing::debug!("{} changed", target.path.display());
                    if !self.send(WatchEvent::Changed {
                        config: target.config,
                        modified,
                    }) {
                        return;
                    }
                }
            }
        }
    }

    /// Sleep for `duration`. Returns false once cancelled.
    fn sleep(&self, duration: Duration) -> bool {
        matches!(
            self.cancel.recv_timeout(duration),
            Err(RecvTimeoutError::Timeout)
        )
    }

    /// Wait out the interval before a polling pass. Returns false once
    /// cancelled.
    fn wait_for_poll(&self, nudges: &Receiver<()>) -> bool {
        crossbeam_channel::select! {
            recv(self.cancel) -> _ => false,
            recv(nudges) -> _ => {
                while nudges.try_recv().is_ok() {}
                true
            }
            default(self.config.interval) => true,
        }
    }

    fn is_cancelled(&self) -> bool {
        !matches!(self.cancel.try_recv(), Err(TryRecvError::Empty))
    }

    fn send(&self, event: WatchEvent) -> bool {
        if self.is_cancelled() {
            return false;
        }
        if self.events.send(event).is_err() {
            tracing::debug!("Watch event receiver dropped, stopping");
            return false;
        }
        true
    }
}

#[cfg(feature = "watch")]
mod nudge {
    use std::collections::HashSet;
    use std::path::{Path, PathBuf};

    use crossbeam_channel::Receiver;
    use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};

    use super::WatchTarget;
    use crate::error::{Error, Result};

    /// Wakes the polling loop early when a watched directory changes.
    pub(super) struct DirectoryNudger {
        watcher: RecommendedWatcher,
        watched: HashSet<PathBuf>,
    }

    impl DirectoryNudger {
        pub(super) fn new() -> Result<(Self, Receiver<()>)> {
            let (tx, rx) = crossbeam_channel::bounded(1);
            let watcher = notify::recommended_watcher(
                move |res: std::result::Result<notify::Event, notify::Error>| {
                    if let Ok(event) = res {
                        if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                            let _ = tx.try_send(());
                        }
                    }
                },
            )
            .map_err(|e| Error::Watch(e.to_string()))?;

            Ok((
                Self {
                    watcher,
                    watched: HashSet::new(),
                },
                rx,
            ))
        }

        pub(super) fn sync(&mut self, targets: &[WatchTarget]) {
            for target in targets.iter().filter(|t| t.loaded && t.auto_reload) {
                let dir = match target.path.parent() {
                    Some(dir) if !dir.as_os_str().is_empty() => dir,
                    _ => Path::new("."),
                };
                if self.watched.contains(dir) {
                    continue;
                }
                match self.watcher.watch(dir, RecursiveMode::NonRecursive) {
                    Ok(()) => {
                        tracing::debug!("Watching directory: {}", dir.display());
                        self.watched.insert(dir.to_path_buf());
                    }
                    Err(e) => tracing::debug!("Cannot watch {}: {}", dir.display(), e),
                }
            }
        }
    }
}
