//! Pending load, unload and reload requests, drained on the host's update
//! tick.

use crossbeam_channel::Receiver;

use crate::config::{ConfigId, LoaderSettings};
use crate::error::Error;
use crate::lifecycle::{LifecycleManager, LoadReport};
use crate::watcher::WatchEvent;

/// A pending action, in the order they are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Request {
    /// Unload, then load on a later tick.
    Reload(ConfigId),
    /// Unload.
    Unload(ConfigId),
    /// Load.
    Load(ConfigId),
}

impl Request {
    /// Config the request is for.
    pub fn config(&self) -> ConfigId {
        match self {
            Self::Reload(id) | Self::Unload(id) | Self::Load(id) => *id,
        }
    }
}

/// What one tick did.
#[derive(Debug)]
pub enum TickOutcome {
    /// Nothing was pending.
    Idle,
    /// The unload half of a reload ran; the load follows on a later tick.
    Reloading {
        /// Config being reloaded.
        config: ConfigId,
        /// Whether the previous instance disposed cleanly.
        clean: bool,
    },
    /// An unload ran.
    Unloaded {
        /// Config unloaded.
        config: ConfigId,
        /// Whether the instance disposed cleanly.
        clean: bool,
    },
    /// A load ran.
    Loaded {
        /// Config loaded.
        config: ConfigId,
        /// Load result.
        report: LoadReport,
    },
    /// A load was attempted and failed before any plugin was registered.
    LoadFailed {
        /// Config that failed.
        config: ConfigId,
        /// Failure.
        error: Error,
    },
}

impl TickOutcome {
    /// Check if the tick did nothing.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// Turns watcher events into pending flags and serves one flag per tick.
#[derive(Debug)]
pub struct RequestQueue {
    events: Receiver<WatchEvent>,
}

impl RequestQueue {
    /// Create a queue fed by `events`.
    pub fn new(events: Receiver<WatchEvent>) -> Self {
        Self { events }
    }

    /// Apply every watcher event received so far. Returns how many became
    /// requests.
    pub fn absorb(&self, settings: &mut LoaderSettings) -> usize {
        let mut requested = 0;
        for event in self.events.try_iter() {
            let Some(config) = settings.get_mut(event.config()) else {
                tracing::debug!("Ignoring event for removed config {}", event.config());
                continue;
            };
            match event {
                WatchEvent::StartupLoad { .. } => {
                    if !config.is_loaded() && !config.has_pending() {
                        config.request_load();
                        requested += 1;
                    }
                }
                WatchEvent::Changed { modified, .. } => {
                    if config.is_loaded()
                        && config.auto_reload
                        && !config.has_pending()
                        && config.file_changed() != Some(modified)
                    {
                        tracing::info!("{} changed, reloading", config.file_path.display());
                        config.request_reload();
                        requested += 1;
                    }
                }
            }
        }
        requested
    }

    /// The request served next, if any.
    pub fn next_request(settings: &LoaderSettings) -> Option<Request> {
        let find = |pred: fn(&crate::config::PluginLoadConfig) -> bool| {
            settings.iter().find(|c| pred(c)).map(|c| c.id())
        };

        find(|c| c.pending_reload())
            .map(Request::Reload)
            .or_else(|| find(|c| c.pending_unload()).map(Request::Unload))
            .or_else(|| find(|c| c.pending_load()).map(Request::Load))
    }

    /// Absorb watcher events, then perform at most one pending action.
    pub fn tick(&self, settings: &mut LoaderSettings, lifecycle: &LifecycleManager) -> TickOutcome {
        self.absorb(settings);

        let Some(request) = Self::next_request(settings) else {
            return TickOutcome::Idle;
        };
        let Some(config) = settings.get_mut(request.config()) else {
            return TickOutcome::Idle;
        };
        config.clear_pending();

        match request {
            Request::Reload(id) => {
                let key = config.unload_key();
                let clean = lifecycle.unload(&key, Some(&mut *config));
                config.pending_load = true;
                TickOutcome::Reloading { config: id, clean }
            }
            Request::Unload(id) => {
                let key = config.unload_key();
                let clean = lifecycle.unload(&key, Some(config));
                TickOutcome::Unloaded { config: id, clean }
            }
            Request::Load(id) => {
                let path = config.file_path.clone();
                match lifecycle.load(&path, Some(config)) {
                    Ok(report) => TickOutcome::Loaded { config: id, report },
                    Err(error) => {
                        tracing::error!("Failed to load {}: {}", path.display(), error);
                        TickOutcome::LoadFailed { config: id, error }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginLoadConfig;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_priority_is_reload_unload_load() {
        let mut settings = LoaderSettings::new();
        let load = settings.add("A.plug");
        let unload = settings.add("B.plug");
        let reload = settings.add("C.plug");

        settings.get_mut(load).unwrap().request_load();
        settings.get_mut(unload).unwrap().request_unload();
        settings.get_mut(reload).unwrap().request_reload();

        assert_eq!(RequestQueue::next_request(&settings), Some(Request::Reload(reload)));
        settings.get_mut(reload).unwrap().clear_pending();
        assert_eq!(RequestQueue::next_request(&settings), Some(Request::Unload(unload)));
        settings.get_mut(unload).unwrap().clear_pending();
        assert_eq!(RequestQueue::next_request(&settings), Some(Request::Load(load)));
        settings.get_mut(load).unwrap().clear_pending();
        assert_eq!(RequestQueue::next_request(&settings), None);
    }

    #[test]
    fn test_absorb_startup_load() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let queue = RequestQueue::new(rx);
        let mut settings = LoaderSettings::new();
        let id = settings.add("Foo.plug");

        tx.send(WatchEvent::StartupLoad { config: id }).unwrap();
        tx.send(WatchEvent::StartupLoad { config: id }).unwrap();

        assert_eq!(queue.absorb(&mut settings), 1);
        assert!(settings.get(id).unwrap().pending_load());
    }

    #[test]
    fn test_absorb_change_requires_loaded_auto_reload() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let queue = RequestQueue::new(rx);
        let mut settings = LoaderSettings::new();
        let manual = settings.push(PluginLoadConfig::new("A.plug"));
        let auto = settings.push(PluginLoadConfig::new("B.plug").with_auto_reload(true));
        settings.get_mut(manual).unwrap().mark_loaded("A", 1, Some(at(1)));
        settings.get_mut(auto).unwrap().mark_loaded("B", 1, Some(at(1)));

        for config in [manual, auto] {
            tx.send(WatchEvent::Changed {
                config,
                modified: at(2),
            })
            .unwrap();
        }
        tx.send(WatchEvent::Changed {
            config: auto,
            modified: at(1),
        })
        .unwrap();

        assert_eq!(queue.absorb(&mut settings), 1);
        assert!(!settings.get(manual).unwrap().has_pending());
        assert!(settings.get(auto).unwrap().pending_reload());
    }

    #[test]
    fn test_events_for_removed_configs_are_ignored() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let queue = RequestQueue::new(rx);
        let mut settings = LoaderSettings::new();
        let id = settings.add("Foo.plug");
        settings.remove(id).unwrap();

        tx.send(WatchEvent::StartupLoad { config: id }).unwrap();
        assert_eq!(queue.absorb(&mut settings), 0);
    }
}
