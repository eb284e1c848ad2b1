//! Load failures kept for display until the user dismisses them.

use parking_lot::Mutex;

use crate::config::ConfigId;

/// Identifier of one ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoadErrorId(usize);

/// One failed plugin construction or initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadError {
    /// Entry id.
    pub id: LoadErrorId,
    /// Config the load was issued for, if any.
    pub config: Option<ConfigId>,
    /// Display name of the plugin that failed.
    pub plugin_name: String,
    /// Failure detail.
    pub detail: String,
    /// Whether the entry was dismissed.
    pub closed: bool,
}

/// Open entries sharing one plugin name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorGroup {
    /// Plugin display name.
    pub plugin_name: String,
    /// Open entries, oldest first.
    pub errors: Vec<LoadError>,
}

/// Append-only list of load failures.
#[derive(Debug, Default)]
pub struct ErrorLedger {
    entries: Mutex<Vec<LoadError>>,
}

impl ErrorLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a failure.
    pub fn record(
        &self,
        config: Option<ConfigId>,
        plugin_name: impl Into<String>,
        detail: impl Into<String>,
    ) -> LoadErrorId {
        let mut entries = self.entries.lock();
        let id = LoadErrorId(entries.len());
        entries.push(LoadError {
            id,
            config,
            plugin_name: plugin_name.into(),
            detail: detail.into(),
            closed: false,
        });
        id
    }

    /// Close an entry and every open entry with the same plugin name.
    /// Returns the number of entries closed.
    pub fn close(&self, id: LoadErrorId) -> usize {
        let mut entries = self.entries.lock();
        let Some(name) = entries.get(id.0).map(|e| e.plugin_name.clone()) else {
            return 0;
        };
        let mut closed = 0;
        for entry in entries.iter_mut().filter(|e| !e.closed && e.plugin_name == name) {
            entry.closed = true;
            closed += 1;
        }
        closed
    }

    /// Open entries, oldest first.
    pub fn open(&self) -> Vec<LoadError> {
        self.entries
            .lock()
            .iter()
            .filter(|e| !e.closed)
            .cloned()
            .collect()
    }

    /// Open entries grouped by plugin name, in order of first appearance.
    pub fn open_groups(&self) -> Vec<ErrorGroup> {
        let mut groups: Vec<ErrorGroup> = Vec::new();
        for entry in self.open() {
            match groups.iter_mut().find(|g| g.plugin_name == entry.plugin_name) {
                Some(group) => group.errors.push(entry),
                None => groups.push(ErrorGroup {
                    plugin_name: entry.plugin_name.clone(),
                    errors: vec![entry],
                }),
            }
        }
        groups
    }

    /// Number of open entries.
    pub fn open_count(&self) -> usize {
        self.entries.lock().iter().filter(|e| !e.closed).count()
    }

    /// Total number of entries ever recorded.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if nothing was ever recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_dismisses_whole_group() {
        let ledger = ErrorLedger::new();
        let first = ledger.record(None, "Foo", "init failed");
        ledger.record(None, "Bar", "init failed");
        ledger.record(None, "Foo", "init failed again");

        assert_eq!(ledger.open_count(), 3);
        assert_eq!(ledger.close(first), 2);

        let open = ledger.open();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].plugin_name, "Bar");
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn test_open_groups_preserve_first_appearance() {
        let ledger = ErrorLedger::new();
        ledger.record(None, "Foo", "a");
        ledger.record(None, "Bar", "b");
        ledger.record(None, "Foo", "c");

        let groups = ledger.open_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].plugin_name, "Foo");
        assert_eq!(groups[0].errors.len(), 2);
        assert_eq!(groups[1].plugin_name, "Bar");
    }

    #[test]
    fn test_closing_twice_is_harmless() {
        let ledger = ErrorLedger::new();
        let id = ledger.record(None, "Foo", "a");
        assert_eq!(ledger.close(id), 1);
        assert_eq!(ledger.close(id), 0);
        assert_eq!(ledger.close(LoadErrorId(42)), 0);
    }
}
