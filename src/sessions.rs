//! Session sidecar store
//!
//! Sessions are mostly derived from their member memories; the only state of
//! their own is a small sidecar record per session under `sessions/`, holding
//! the name and metadata given at creation. Listing merges sidecars with the
//! maintained session index, so sessions created but not yet written to are
//! still visible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::errors::{MemoryError, Result};
use crate::store::index::IndexState;

const META_SUFFIX: &str = ".meta";

/// The sidecar record written at `create_session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub user_id: String,
    pub name: Option<String>,
    #[serde(default, with = "crate::store::types::json_map")]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// A session as reported by `list_sessions`: sidecar fields plus the
/// derived activity statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub user_id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub memory_count: usize,
}

pub(crate) struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn open(root: &Path) -> Result<Self> {
        let dir = root.join("sessions");
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn meta_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}{META_SUFFIX}"))
    }

    pub fn save(&self, meta: &SessionMeta) -> Result<()> {
        let bytes =
            bincode::serialize(meta).map_err(|e| MemoryError::Internal(anyhow::anyhow!(e)))?;
        let tmp = self.dir.join(format!(".{}.tmp", meta.id));
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, self.meta_path(&meta.id))?;
        Ok(())
    }

    pub fn load(&self, session_id: &str) -> Option<SessionMeta> {
        let path = self.meta_path(session_id);
        let bytes = std::fs::read(&path).ok()?;
        match bincode::deserialize(&bytes) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!(session_id, error = %e, "unreadable session sidecar");
                None
            }
        }
    }

    pub fn delete(&self, session_id: &str) -> Result<()> {
        let path = self.meta_path(session_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Who owns a session: the sidecar's creator, or the owner derived from
    /// member memories when no sidecar exists.
    pub fn owner(&self, index: &IndexState, session_id: &str) -> Option<String> {
        if let Some(meta) = self.load(session_id) {
            return Some(meta.user_id);
        }
        index.session_owner(session_id).map(str::to_string)
    }

    /// All of a user's sessions, most recently active first.
    pub fn list_for_user(&self, index: &IndexState, user_id: &str) -> Result<Vec<SessionInfo>> {
        let mut sessions: BTreeMap<String, SessionInfo> = BTreeMap::new();

        // Sessions derived from live memories.
        for (id, count, first, last) in index.sessions_for_user(user_id) {
            sessions.insert(
                id.clone(),
                SessionInfo {
                    id,
                    user_id: user_id.to_string(),
                    name: None,
                    metadata: Map::new(),
                    created_at: first,
                    last_active_at: last,
                    memory_count: count,
                },
            );
        }

        // Sidecars fill in names/metadata and surface empty sessions.
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(session_id) = name.to_string_lossy().strip_suffix(META_SUFFIX).map(str::to_string)
            else {
                continue;
            };
            let Some(meta) = self.load(&session_id) else {
                continue;
            };
            if meta.user_id != user_id {
                continue;
            }
            match sessions.get_mut(&session_id) {
                Some(info) => {
                    info.name = meta.name;
                    info.metadata = meta.metadata;
                    if meta.created_at < info.created_at {
                        info.created_at = meta.created_at;
                    }
                }
                None => {
                    sessions.insert(
                        session_id.clone(),
                        SessionInfo {
                            id: session_id,
                            user_id: meta.user_id,
                            name: meta.name,
                            metadata: meta.metadata,
                            created_at: meta.created_at,
                            last_active_at: meta.created_at,
                            memory_count: 0,
                        },
                    );
                }
            }
        }

        let mut out: Vec<SessionInfo> = sessions.into_values().collect();
        out.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        Ok(out)
    }
}
