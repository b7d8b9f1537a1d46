//! Script Store: CRUD and normalization over persisted script records.
//!
//! The store owns no runtime state. Every call takes the store mutex for its
//! whole read-modify-write so concurrent callers never observe a torn list.
//! File-backed stores rewrite `scripts.json` through a temp file + rename.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use super::{ManagedScript, ScriptDraft, SCRIPT_LANGUAGE};
use crate::error::ScriptError;

/// Name given to scripts saved without one.
pub const DEFAULT_SCRIPT_NAME: &str = "Untitled script";
/// Maximum script name length (characters).
const MAX_NAME_LEN: usize = 120;
/// Maximum description length (characters).
const MAX_DESCRIPTION_LEN: usize = 2000;
/// Maximum source length (bytes).
const MAX_SOURCE_BYTES: usize = 512 * 1024;
/// Maximum id length.
const MAX_ID_LEN: usize = 128;
/// On-disk format version.
const STORE_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    scripts: Vec<ManagedScript>,
}

#[derive(Debug)]
struct StoreInner {
    scripts: Vec<ManagedScript>,
    path: Option<PathBuf>,
}

/// Persisted collection of [`ManagedScript`] records.
#[derive(Debug)]
pub struct ScriptStore {
    inner: Mutex<StoreInner>,
}

impl ScriptStore {
    /// Store that lives only in memory (tests, dry runs).
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                scripts: Vec::new(),
                path: None,
            }),
        }
    }

    /// Open (or create on first write) a JSON-file-backed store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let scripts = read_scripts(&path)?;
        log::debug!("[store] Opened {} ({} scripts)", path.display(), scripts.len());
        Ok(Self {
            inner: Mutex::new(StoreInner {
                scripts,
                path: Some(path),
            }),
        })
    }

    /// Re-read the backing file, picking up edits made by other processes.
    ///
    /// Returns whether the contents changed. In-memory stores never do. A
    /// missing file reads as an empty store.
    ///
    /// # Errors
    ///
    /// Returns an error if the file can't be read or parsed. The current
    /// contents are kept.
    pub fn reload(&self) -> Result<bool> {
        let mut inner = self.inner.lock().expect("ScriptStore mutex poisoned");
        let Some(path) = inner.path.clone() else {
            return Ok(false);
        };
        let scripts = read_scripts(&path)?;
        if scripts == inner.scripts {
            return Ok(false);
        }
        log::info!("[store] Reloaded {} ({} scripts)", path.display(), scripts.len());
        inner.scripts = scripts;
        Ok(true)
    }

    /// All scripts, in insertion order.
    pub fn list(&self) -> Result<Vec<ManagedScript>> {
        let inner = self.inner.lock().expect("ScriptStore mutex poisoned");
        Ok(inner.scripts.clone())
    }

    /// Look up one script by id.
    pub fn get(&self, id: &str) -> Result<Option<ManagedScript>> {
        let inner = self.inner.lock().expect("ScriptStore mutex poisoned");
        Ok(inner.scripts.iter().find(|s| s.id == id).cloned())
    }

    /// Insert or update by id, returning the normalized record.
    ///
    /// The returned value is authoritative: callers must replace their draft
    /// with it.
    pub fn save(&self, draft: ScriptDraft) -> Result<ManagedScript> {
        let mut inner = self.inner.lock().expect("ScriptStore mutex poisoned");
        let now = chrono::Utc::now().timestamp_millis();

        let id = draft
            .id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        if let Some(ref id) = id {
            if id.len() > MAX_ID_LEN {
                return Err(ScriptError::validation(format!(
                    "script id exceeds {MAX_ID_LEN} bytes"
                ))
                .into());
            }
        }

        let existing_idx = id
            .as_ref()
            .and_then(|id| inner.scripts.iter().position(|s| &s.id == id));
        let existing = existing_idx.map(|idx| inner.scripts[idx].clone());

        let record = normalize(draft, id, existing.as_ref(), now)?;

        let previous = match existing_idx {
            Some(idx) => Some(std::mem::replace(&mut inner.scripts[idx], record.clone())),
            None => {
                inner.scripts.push(record.clone());
                None
            }
        };

        if let Err(e) = persist(&inner) {
            // Keep memory consistent with disk.
            match (existing_idx, previous) {
                (Some(idx), Some(prev)) => inner.scripts[idx] = prev,
                _ => {
                    inner.scripts.pop();
                }
            }
            return Err(e);
        }

        log::debug!("[store] Saved script {} ({})", record.id, record.name);
        Ok(record)
    }

    /// Remove a script. Returns whether a record was deleted.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().expect("ScriptStore mutex poisoned");
        let Some(idx) = inner.scripts.iter().position(|s| s.id == id) else {
            return Ok(false);
        };
        let removed = inner.scripts.remove(idx);
        if let Err(e) = persist(&inner) {
            inner.scripts.insert(idx, removed);
            return Err(e);
        }
        log::debug!("[store] Deleted script {id}");
        Ok(true)
    }
}

fn read_scripts(path: &Path) -> Result<Vec<ManagedScript>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read script store {}", path.display()))?;
    let file: StoreFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse script store {}", path.display()))?;
    Ok(file.scripts)
}

/// Merge a draft over an existing record (or defaults) and enforce limits.
fn normalize(
    draft: ScriptDraft,
    id: Option<String>,
    existing: Option<&ManagedScript>,
    now: i64,
) -> Result<ManagedScript> {
    let name = draft
        .name
        .map(|n| n.trim().to_string())
        .or_else(|| existing.map(|e| e.name.clone()))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| DEFAULT_SCRIPT_NAME.to_string());
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ScriptError::validation(format!(
            "script name exceeds {MAX_NAME_LEN} characters"
        ))
        .into());
    }

    let description = draft
        .description
        .map(|d| d.trim().to_string())
        .or_else(|| existing.map(|e| e.description.clone()))
        .unwrap_or_default();
    if description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(ScriptError::validation(format!(
            "script description exceeds {MAX_DESCRIPTION_LEN} characters"
        ))
        .into());
    }

    let source = draft
        .source
        .or_else(|| existing.map(|e| e.source.clone()))
        .unwrap_or_default();
    if source.len() > MAX_SOURCE_BYTES {
        return Err(ScriptError::validation(format!(
            "script source exceeds {MAX_SOURCE_BYTES} bytes"
        ))
        .into());
    }

    if let Some(ref lang) = draft.language {
        if !lang.eq_ignore_ascii_case(SCRIPT_LANGUAGE) {
            log::warn!("[store] Unsupported language tag '{lang}', storing as {SCRIPT_LANGUAGE}");
        }
    }

    let created_at = existing.map_or(now, |e| e.created_at);
    // updatedAt must move forward even when two saves land in the same millisecond.
    let updated_at = existing.map_or(now, |e| now.max(e.updated_at + 1));

    Ok(ManagedScript {
        id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        name,
        description,
        language: SCRIPT_LANGUAGE.to_string(),
        source,
        enabled: draft
            .enabled
            .or_else(|| existing.map(|e| e.enabled))
            .unwrap_or(true),
        trusted: draft
            .trusted
            .or_else(|| existing.map(|e| e.trusted))
            .unwrap_or(false),
        auto_start: draft
            .auto_start
            .or_else(|| existing.map(|e| e.auto_start))
            .unwrap_or(false),
        permissions: draft
            .permissions
            .or_else(|| existing.map(|e| e.permissions))
            .unwrap_or_default(),
        created_at,
        updated_at,
    })
}

fn persist(inner: &StoreInner) -> Result<()> {
    let Some(ref path) = inner.path else {
        return Ok(());
    };
    let file = StoreFile {
        version: STORE_VERSION,
        scripts: inner.scripts.clone(),
    };
    write_atomic(path, &serde_json::to_string_pretty(&file)?)
}

/// Write `content` to `path` through a sibling temp file, owner-only on Unix.
pub(crate) fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;

    #[cfg(unix)]
    fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;

    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ScriptPermissions;
    use tempfile::TempDir;

    fn draft(name: &str) -> ScriptDraft {
        ScriptDraft {
            name: Some(name.to_string()),
            source: Some("log.info('hi')".to_string()),
            ..ScriptDraft::default()
        }
    }

    #[test]
    fn test_save_inserts_with_defaults() {
        let store = ScriptStore::in_memory();
        let saved = store.save(ScriptDraft::default()).expect("save");

        assert!(!saved.id.is_empty());
        assert_eq!(saved.name, DEFAULT_SCRIPT_NAME);
        assert_eq!(saved.language, SCRIPT_LANGUAGE);
        assert!(saved.enabled);
        assert!(!saved.trusted);
        assert!(!saved.auto_start);
        assert_eq!(saved.permissions, ScriptPermissions::default());
        assert_eq!(saved.created_at, saved.updated_at);
    }

    #[test]
    fn test_update_preserves_created_and_bumps_updated() {
        let store = ScriptStore::in_memory();
        let first = store.save(draft("one")).expect("save");

        let second = store
            .save(ScriptDraft {
                id: Some(first.id.clone()),
                name: Some("renamed".to_string()),
                ..ScriptDraft::default()
            })
            .expect("update");

        assert_eq!(second.id, first.id);
        assert_eq!(second.name, "renamed");
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);
        // Fields absent from the draft come from the existing record.
        assert_eq!(second.source, first.source);
        assert_eq!(store.list().expect("list").len(), 1);
    }

    #[test]
    fn test_language_is_normalized() {
        let store = ScriptStore::in_memory();
        let saved = store
            .save(ScriptDraft {
                language: Some("javascript".to_string()),
                ..ScriptDraft::default()
            })
            .expect("save");
        assert_eq!(saved.language, SCRIPT_LANGUAGE);
    }

    #[test]
    fn test_oversized_name_is_rejected() {
        let store = ScriptStore::in_memory();
        let err = store
            .save(ScriptDraft {
                name: Some("x".repeat(MAX_NAME_LEN + 1)),
                ..ScriptDraft::default()
            })
            .expect_err("should reject");
        let script_err = err.downcast_ref::<ScriptError>().expect("typed error");
        assert_eq!(script_err.kind(), "ValidationError");
        assert!(store.list().expect("list").is_empty());
    }

    #[test]
    fn test_delete() {
        let store = ScriptStore::in_memory();
        let saved = store.save(draft("gone")).expect("save");
        assert!(store.delete(&saved.id).expect("delete"));
        assert!(!store.delete(&saved.id).expect("second delete"));
        assert!(store.get(&saved.id).expect("get").is_none());
    }

    #[test]
    fn test_file_store_persists_across_open() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("scripts.json");

        let id = {
            let store = ScriptStore::open(&path).expect("open");
            store.save(draft("persisted")).expect("save").id
        };

        let reopened = ScriptStore::open(&path).expect("reopen");
        let script = reopened.get(&id).expect("get").expect("present");
        assert_eq!(script.name, "persisted");
    }

    #[test]
    fn test_reload_picks_up_external_edits() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("scripts.json");
        let ours = ScriptStore::open(&path).expect("open");
        let saved = ours.save(draft("shared")).expect("save");
        assert!(!ours.reload().expect("reload unchanged"));

        let theirs = ScriptStore::open(&path).expect("second handle");
        theirs
            .save(ScriptDraft {
                id: Some(saved.id.clone()),
                trusted: Some(true),
                ..ScriptDraft::default()
            })
            .expect("external edit");

        assert!(ours.reload().expect("reload"));
        assert!(ours.get(&saved.id).expect("get").expect("present").trusted);

        fs::write(&path, "not json").expect("corrupt");
        assert!(ours.reload().is_err());
        assert_eq!(ours.list().expect("list").len(), 1);

        assert!(!ScriptStore::in_memory().reload().expect("memory"));
    }
}
