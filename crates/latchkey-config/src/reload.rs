//! Change-driven reloads for registered schemas.
//!
//! # Design
//! - One `notify` watcher per source directory, filtered to the source file
//!   names, so atomic rename-based writes are observed.
//! - Notifications feed a debouncer thread that waits for a quiet window
//!   before invoking the rebuild callback; every new notification re-arms
//!   the window.
//! - Dropping the subscription stops the watchers and signals the debouncer
//!   to exit. Threads are never joined from drop.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, trace, warn};

use crate::error::{ConfigError, ConfigResult};
use crate::schema::SchemaId;

/// Callback invoked once per quiet window.
pub(crate) type ReloadCallback = Box<dyn Fn() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Changed,
    Stop,
}

/// Live change subscription for one schema's sources.
pub(crate) struct ReloadSubscription {
    schema: SchemaId,
    watchers: Mutex<Vec<RecommendedWatcher>>,
    signals: Sender<Signal>,
}

impl ReloadSubscription {
    /// Watch `sources` and invoke `callback` after `debounce` of quiet.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Watch`] if a watcher cannot be installed and
    /// [`ConfigError::Io`] if the debouncer thread cannot be spawned.
    pub(crate) fn start(
        schema: SchemaId,
        sources: &[&Path],
        debounce: Duration,
        callback: ReloadCallback,
    ) -> ConfigResult<Self> {
        let (signals, receiver) = mpsc::channel();
        thread::Builder::new()
            .name(format!("latchkey-reload-{schema}"))
            .spawn(move || run_debouncer(&receiver, debounce, &*callback))
            .map_err(|err| ConfigError::io("reload.spawn", PathBuf::new(), err))?;

        let subscription = Self {
            schema,
            watchers: Mutex::new(Vec::new()),
            signals,
        };
        let mut watchers = Vec::new();
        for (directory, names) in group_by_directory(sources) {
            watchers.push(subscription.watch_directory(&directory, names)?);
        }
        debug!(schema = %schema, watchers = watchers.len(), "reload subscription armed");
        *subscription.lock_watchers() = watchers;
        Ok(subscription)
    }

    fn watch_directory(
        &self,
        directory: &Path,
        names: BTreeSet<OsString>,
    ) -> ConfigResult<RecommendedWatcher> {
        let signals = self.signals.clone();
        let schema = self.schema;
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) if is_relevant(&event, &names) => {
                    trace!(schema = %schema, kind = ?event.kind, "source change observed");
                    let _ = signals.send(Signal::Changed);
                }
                Ok(_) => {}
                Err(err) => warn!(schema = %schema, error = %err, "source watcher reported an error"),
            },
            Config::default(),
        )
        .map_err(|source| ConfigError::Watch {
            path: directory.to_path_buf(),
            source,
        })?;
        watcher
            .watch(directory, RecursiveMode::NonRecursive)
            .map_err(|source| ConfigError::Watch {
                path: directory.to_path_buf(),
                source,
            })?;
        Ok(watcher)
    }

    fn lock_watchers(&self) -> std::sync::MutexGuard<'_, Vec<RecommendedWatcher>> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ReloadSubscription {
    fn drop(&mut self) {
        self.lock_watchers().clear();
        let _ = self.signals.send(Signal::Stop);
        debug!(schema = %self.schema, "reload subscription released");
    }
}

fn group_by_directory(sources: &[&Path]) -> Vec<(PathBuf, BTreeSet<OsString>)> {
    let mut groups: Vec<(PathBuf, BTreeSet<OsString>)> = Vec::new();
    for source in sources {
        let (Some(directory), Some(name)) = (source.parent(), source.file_name()) else {
            continue;
        };
        match groups.iter_mut().find(|(existing, _)| existing == directory) {
            Some((_, names)) => {
                names.insert(name.to_os_string());
            }
            None => groups.push((directory.to_path_buf(), BTreeSet::from([name.to_os_string()]))),
        }
    }
    groups
}

fn is_relevant(event: &Event, names: &BTreeSet<OsString>) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event
        .paths
        .iter()
        .filter_map(|path| path.file_name())
        .any(|name| names.contains(name))
}

fn run_debouncer(receiver: &mpsc::Receiver<Signal>, window: Duration, callback: &dyn Fn()) {
    loop {
        match receiver.recv() {
            Ok(Signal::Changed) => {}
            Ok(Signal::Stop) | Err(_) => return,
        }
        loop {
            match receiver.recv_timeout(window) {
                Ok(Signal::Changed) => {}
                Err(RecvTimeoutError::Timeout) => {
                    callback();
                    break;
                }
                Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}
