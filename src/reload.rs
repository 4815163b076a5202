//! Reload supervisor (component I): watches hook definition files/directories
//! for changes, debounces bursts of editor-style writes, and runs the reload
//! protocol against the [`HookStore`] (spec §4.6).
//!
//! Grounded on the `notify`-over-`tokio::sync::mpsc` bridging pattern used in
//! `Talus-Network-nexus-sdk/toolkit-rust/src/config.rs`, generalized from a
//! single watched file to a set of tracked hook files with per-path debounce
//! and the store's duplicate-ID guard wired in.

use crate::hook;
use crate::store::HookStore;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(200);
const RENAME_SETTLE: Duration = Duration::from_millis(50);

pub struct ReloadSupervisor {
    store: Arc<HookStore>,
    template_mode: bool,
    verbose: bool,
    no_panic: bool,
    _watcher: RecommendedWatcher,
}

impl ReloadSupervisor {
    /// Start watching `paths`; each is loaded once before the watcher task is
    /// spawned, so the store is populated before the server starts accepting
    /// connections.
    pub async fn start(
        paths: Vec<PathBuf>,
        store: Arc<HookStore>,
        template_mode: bool,
        verbose: bool,
        no_panic: bool,
    ) -> notify::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<Event>();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })?;

        for path in &paths {
            watcher.watch(path, RecursiveMode::NonRecursive)?;
        }

        for path in &paths {
            load_initial(path, &store, template_mode, verbose, no_panic).await;
        }

        let supervisor = ReloadSupervisor {
            store: store.clone(),
            template_mode,
            verbose,
            no_panic,
            _watcher: watcher,
        };
        supervisor.spawn_debouncer(rx);
        Ok(supervisor)
    }

    fn spawn_debouncer(&self, mut rx: mpsc::UnboundedReceiver<Event>) {
        let store = self.store.clone();
        let template_mode = self.template_mode;
        let verbose = self.verbose;
        let no_panic = self.no_panic;

        tokio::spawn(async move {
            let pending: Arc<Mutex<HashMap<PathBuf, tokio::task::JoinHandle<()>>>> =
                Arc::new(Mutex::new(HashMap::new()));

            while let Some(event) = rx.recv().await {
                for path in event.paths {
                    let store = store.clone();
                    let pending = pending.clone();
                    let kind = event.kind;
                    let path_for_task = path.clone();

                    let mut guard = pending.lock().await;
                    if let Some(old) = guard.remove(&path) {
                        old.abort();
                    }
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep(DEBOUNCE_WINDOW).await;
                        handle_event(kind, &path_for_task, &store, template_mode, verbose, no_panic)
                            .await;
                    });
                    guard.insert(path, handle);
                }
            }
        });
    }
}

async fn handle_event(
    kind: EventKind,
    path: &Path,
    store: &HookStore,
    template_mode: bool,
    verbose: bool,
    no_panic: bool,
) {
    if kind.is_remove() {
        on_remove(path, store, verbose, no_panic).await;
        return;
    }
    if kind.is_create() || kind.is_modify() {
        // Rename sequences land as create/remove pairs on most platforms;
        // settle briefly and check existence, matching spec §4.6's
        // Rename-as-Write-or-Remove rule.
        tokio::time::sleep(RENAME_SETTLE).await;
        if path.exists() {
            on_write(path, store, template_mode).await;
        } else {
            on_remove(path, store, verbose, no_panic).await;
        }
    }
}

async fn on_write(path: &Path, store: &HookStore, template_mode: bool) {
    match hook::parse_hooks_file(path, template_mode) {
        Ok(hooks) => match store.replace_file(path.to_path_buf(), hooks).await {
            Ok(()) => log::info!(target: "hookforge::reload", "reloaded {}", path.display()),
            Err(e) => log::error!(target: "hookforge::reload", "rejected reload of {}: {e}", path.display()),
        },
        Err(e) => log::error!(target: "hookforge::reload", "failed to parse {}: {e}", path.display()),
    }
}

async fn on_remove(path: &Path, store: &HookStore, verbose: bool, no_panic: bool) {
    let remaining = store.remove_file(path).await;
    log::info!(target: "hookforge::reload", "removed {} ({remaining} hooks remain)", path.display());
    if remaining == 0 && !(verbose && no_panic) {
        log::error!(target: "hookforge::reload", "no hooks remain after removing {}, exiting", path.display());
        std::process::exit(1);
    }
}

async fn load_initial(
    path: &Path,
    store: &HookStore,
    template_mode: bool,
    verbose: bool,
    no_panic: bool,
) {
    match hook::parse_hooks_file(path, template_mode) {
        Ok(hooks) => {
            if let Err(e) = store.replace_file(path.to_path_buf(), hooks).await {
                log::error!(target: "hookforge::reload", "rejected {}: {e}", path.display());
                if !(verbose && no_panic) {
                    std::process::exit(1);
                }
            }
        }
        Err(e) => {
            log::error!(target: "hookforge::reload", "failed to load {}: {e}", path.display());
            if !(verbose && no_panic) {
                std::process::exit(1);
            }
        }
    }
}
