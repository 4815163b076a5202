//! Hook store (component F): a `file_path -> hooks` mapping with a
//! process-wide duplicate-ID guard, swapped atomically on reload.
//!
//! Grounded on the teacher's `RouteConfig` (`config.rs`) — a flat
//! `HashMap<String, Vec<Hook>>` read by the router — generalized so the map
//! is keyed by the owning file path instead of the HTTP path, per spec §3/§4.6.

use crate::hook::Hook;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate hook id {id:?} already defined in {existing_file}")]
    DuplicateId { id: String, existing_file: String },
    #[error("duplicate hook id {id:?} appears twice within the same file")]
    DuplicateWithinFile { id: String },
}

#[derive(Debug, Default, Clone)]
struct Snapshot {
    by_file: HashMap<PathBuf, Vec<Hook>>,
    file_order: Vec<PathBuf>,
}

impl Snapshot {
    fn total_hooks(&self) -> usize {
        self.by_file.values().map(Vec::len).sum()
    }
}

/// The live hook store. Reads take a shared lock against an `Arc<Snapshot>`
/// (cheap to clone, so handlers never hold the lock across their own work);
/// writes replace the whole `Arc` under an exclusive lock — never an in-place
/// mutation visible to a concurrent reader (spec §9).
pub struct HookStore {
    inner: RwLock<Arc<Snapshot>>,
}

impl HookStore {
    pub fn new() -> Self {
        HookStore {
            inner: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    /// First hook across all files (in insertion order) whose `id == id`.
    pub async fn match_by_id(&self, id: &str) -> Option<Hook> {
        let snapshot = self.inner.read().await.clone();
        for file in &snapshot.file_order {
            if let Some(hooks) = snapshot.by_file.get(file) {
                if let Some(hook) = hooks.iter().find(|h| h.id == id) {
                    return Some(hook.clone());
                }
            }
        }
        None
    }

    pub async fn total_hooks(&self) -> usize {
        self.inner.read().await.total_hooks()
    }

    pub async fn tracked_files(&self) -> Vec<PathBuf> {
        self.inner.read().await.file_order.clone()
    }

    /// Replace the hooks owned by `path` with `hooks`. Rejects the whole
    /// batch (leaving the store unchanged) if any id collides with a hook
    /// owned by a *different* file, or is repeated within `hooks` itself
    /// (spec §3 invariant, §4.6 step 3).
    pub async fn replace_file(&self, path: PathBuf, hooks: Vec<Hook>) -> Result<(), StoreError> {
        check_internal_duplicates(&hooks)?;

        let mut guard = self.inner.write().await;
        check_cross_file_duplicates(&guard, &path, &hooks)?;

        let mut next = (**guard).clone();
        if !next.by_file.contains_key(&path) {
            next.file_order.push(path.clone());
        }
        next.by_file.insert(path, hooks);
        *guard = Arc::new(next);
        Ok(())
    }

    /// Remove the entry for `path`, returning the total hook count remaining.
    pub async fn remove_file(&self, path: &std::path::Path) -> usize {
        let mut guard = self.inner.write().await;
        let mut next = (**guard).clone();
        next.by_file.remove(path);
        next.file_order.retain(|p| p != path);
        let remaining = next.total_hooks();
        *guard = Arc::new(next);
        remaining
    }
}

impl Default for HookStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check_internal_duplicates(hooks: &[Hook]) -> Result<(), StoreError> {
    let mut seen = std::collections::HashSet::new();
    for hook in hooks {
        if !seen.insert(hook.id.clone()) {
            return Err(StoreError::DuplicateWithinFile {
                id: hook.id.clone(),
            });
        }
    }
    Ok(())
}

fn check_cross_file_duplicates(
    snapshot: &Snapshot,
    incoming_path: &std::path::Path,
    hooks: &[Hook],
) -> Result<(), StoreError> {
    for (file, existing_hooks) in &snapshot.by_file {
        if file == incoming_path {
            continue;
        }
        for existing in existing_hooks {
            if hooks.iter().any(|h| h.id == existing.id) {
                return Err(StoreError::DuplicateId {
                    id: existing.id.clone(),
                    existing_file: file.display().to_string(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(id: &str) -> Hook {
        Hook {
            id: id.to_string(),
            execute_command: "/bin/true".to_string(),
            command_working_directory: None,
            http_methods: vec![],
            response_message: String::new(),
            response_headers: vec![],
            capture_output: false,
            capture_output_on_error: false,
            stream_output: false,
            success_http_code: None,
            trigger_rule_mismatch_http_code: None,
            incoming_content_type: None,
            trigger_signature_soft_failures: false,
            pass_arguments: vec![],
            pass_environment: vec![],
            pass_file: vec![],
            json_string_parameters: vec![],
            trigger_rule: None,
        }
    }

    #[tokio::test]
    async fn duplicate_id_across_files_is_rejected_and_store_unchanged() {
        let store = HookStore::new();
        store
            .replace_file(PathBuf::from("a.json"), vec![hook("x")])
            .await
            .unwrap();

        let err = store
            .replace_file(PathBuf::from("b.json"), vec![hook("x")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId { .. }));

        assert_eq!(store.total_hooks().await, 1);
        assert!(store.match_by_id("x").await.is_some());
        assert_eq!(
            store.match_by_id("x").await.unwrap().execute_command,
            "/bin/true"
        );
    }

    #[tokio::test]
    async fn duplicate_id_within_same_file_is_rejected() {
        let store = HookStore::new();
        let err = store
            .replace_file(PathBuf::from("a.json"), vec![hook("x"), hook("x")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateWithinFile { .. }));
        assert_eq!(store.total_hooks().await, 0);
    }

    #[tokio::test]
    async fn replacing_same_file_is_allowed() {
        let store = HookStore::new();
        store
            .replace_file(PathBuf::from("a.json"), vec![hook("x")])
            .await
            .unwrap();
        store
            .replace_file(PathBuf::from("a.json"), vec![hook("x"), hook("y")])
            .await
            .unwrap();
        assert_eq!(store.total_hooks().await, 2);
    }

    #[tokio::test]
    async fn remove_file_reports_remaining_count() {
        let store = HookStore::new();
        store
            .replace_file(PathBuf::from("a.json"), vec![hook("x")])
            .await
            .unwrap();
        let remaining = store.remove_file(&PathBuf::from("a.json")).await;
        assert_eq!(remaining, 0);
    }
}
