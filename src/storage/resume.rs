//! Persistent resume state for interrupted transfers.
//!
//! Keyed by file id; records which chunks completed so a restarted node can
//! request only what is missing. States idle for longer than the cleanup
//! age (default 72 hours) are pruned.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use super::StorageError;

/// Default maximum age before a resume state is discarded (72 hours).
pub const DEFAULT_RESUME_MAX_AGE_SECS: u64 = 72 * 3600;

/// Transfer statistics persisted alongside the chunk set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedStats {
    pub total_bytes: u64,
    pub bytes_transferred: u64,
    pub average_speed_bps: u64,
}

/// Everything needed to resume one interrupted transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeInfo {
    pub file_id: String,
    pub session_id: String,
    pub completed_chunks: BTreeSet<u64>,
    /// Seconds since the epoch.
    pub last_activity: u64,
    pub stats: PersistedStats,
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub struct ResumeStore {
    conn: Connection,
}

impl ResumeStore {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.create_tables()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS resume_states (
                file_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                completed_chunks BLOB NOT NULL,
                last_activity INTEGER NOT NULL,
                stats_blob BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_resume_session ON resume_states(session_id);
            CREATE INDEX IF NOT EXISTS idx_resume_activity ON resume_states(last_activity);",
        )?;
        Ok(())
    }

    pub fn save_resume_state(&self, info: &ResumeInfo) -> Result<(), StorageError> {
        let chunks: Vec<u64> = info.completed_chunks.iter().copied().collect();
        let chunks_blob = postcard::to_allocvec(&chunks)?;
        let stats_blob = postcard::to_allocvec(&info.stats)?;

        self.conn.execute(
            "INSERT OR REPLACE INTO resume_states
             (file_id, session_id, completed_chunks, last_activity, stats_blob)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                info.file_id,
                info.session_id,
                chunks_blob,
                info.last_activity as i64,
                stats_blob,
            ],
        )?;
        Ok(())
    }

    fn row_to_info(
        file_id: String,
        session_id: String,
        chunks_blob: Vec<u8>,
        last_activity: i64,
        stats_blob: Vec<u8>,
    ) -> Result<ResumeInfo, StorageError> {
        let chunks: Vec<u64> = postcard::from_bytes(&chunks_blob)?;
        let stats: PersistedStats = postcard::from_bytes(&stats_blob)?;
        Ok(ResumeInfo {
            file_id,
            session_id,
            completed_chunks: chunks.into_iter().collect(),
            last_activity: last_activity as u64,
            stats,
        })
    }

    pub fn load_resume_state(&self, file_id: &str) -> Result<Option<ResumeInfo>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT file_id, session_id, completed_chunks, last_activity, stats_blob
                 FROM resume_states WHERE file_id = ?1",
                params![file_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((f, s, c, l, st)) => Ok(Some(Self::row_to_info(f, s, c, l, st)?)),
            None => Ok(None),
        }
    }

    pub fn load_resume_state_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<ResumeInfo>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT file_id, session_id, completed_chunks, last_activity, stats_blob
                 FROM resume_states WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((f, s, c, l, st)) => Ok(Some(Self::row_to_info(f, s, c, l, st)?)),
            None => Ok(None),
        }
    }

    pub fn remove_resume_state(&self, file_id: &str) -> Result<bool, StorageError> {
        let removed = self.conn.execute(
            "DELETE FROM resume_states WHERE file_id = ?1",
            params![file_id],
        )?;
        Ok(removed > 0)
    }

    /// Mark one chunk completed, creating the state row if necessary.
    pub fn update_chunk_completed(
        &self,
        file_id: &str,
        session_id: &str,
        chunk_index: u64,
    ) -> Result<(), StorageError> {
        let mut info = self
            .load_resume_state(file_id)?
            .unwrap_or_else(|| ResumeInfo {
                file_id: file_id.to_string(),
                session_id: session_id.to_string(),
                completed_chunks: BTreeSet::new(),
                last_activity: 0,
                stats: PersistedStats::default(),
            });
        info.completed_chunks.insert(chunk_index);
        info.last_activity = now_unix_secs();
        self.save_resume_state(&info)
    }

    pub fn get_completed_chunks(&self, file_id: &str) -> Result<BTreeSet<u64>, StorageError> {
        Ok(self
            .load_resume_state(file_id)?
            .map(|info| info.completed_chunks)
            .unwrap_or_default())
    }

    /// `{0..total_chunks} \ completed_chunks`, in order.
    pub fn get_missing_chunks(
        &self,
        file_id: &str,
        total_chunks: u64,
    ) -> Result<Vec<u64>, StorageError> {
        let completed = self.get_completed_chunks(file_id)?;
        Ok((0..total_chunks)
            .filter(|index| !completed.contains(index))
            .collect())
    }

    pub fn update_last_activity(&self, file_id: &str) -> Result<bool, StorageError> {
        let updated = self.conn.execute(
            "UPDATE resume_states SET last_activity = ?2 WHERE file_id = ?1",
            params![file_id, now_unix_secs() as i64],
        )?;
        Ok(updated > 0)
    }

    /// Remove states idle for longer than `max_age_secs`. Returns how many
    /// were pruned.
    pub fn cleanup_old_resume_states(&self, max_age_secs: u64) -> Result<usize, StorageError> {
        let threshold = now_unix_secs().saturating_sub(max_age_secs) as i64;
        let removed = self.conn.execute(
            "DELETE FROM resume_states WHERE last_activity < ?1",
            params![threshold],
        )?;
        Ok(removed)
    }

    pub fn list_resumable_transfers(&self) -> Result<Vec<ResumeInfo>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT file_id, session_id, completed_chunks, last_activity, stats_blob
             FROM resume_states ORDER BY last_activity DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Vec<u8>>(4)?,
            ))
        })?;

        let mut infos = Vec::new();
        for row in rows {
            let (f, s, c, l, st) = row?;
            infos.push(Self::row_to_info(f, s, c, l, st)?);
        }
        Ok(infos)
    }

    pub fn resume_state_count(&self) -> Result<u64, StorageError> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM resume_states", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn is_resumable(&self, file_id: &str) -> Result<bool, StorageError> {
        Ok(self.load_resume_state(file_id)?.is_some())
    }
}

impl std::fmt::Debug for ResumeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumeStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> ResumeInfo {
        ResumeInfo {
            file_id: "file-1".to_string(),
            session_id: "sess-1".to_string(),
            completed_chunks: [0u64, 1, 5].into_iter().collect(),
            last_activity: now_unix_secs(),
            stats: PersistedStats {
                total_bytes: 1024,
                bytes_transferred: 384,
                average_speed_bps: 128,
            },
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let store = ResumeStore::open_in_memory().unwrap();
        let info = sample_info();

        store.save_resume_state(&info).unwrap();
        let loaded = store.load_resume_state("file-1").unwrap().unwrap();
        assert_eq!(loaded, info);
    }

    #[test]
    fn test_load_by_session() {
        let store = ResumeStore::open_in_memory().unwrap();
        store.save_resume_state(&sample_info()).unwrap();

        let loaded = store.load_resume_state_by_session("sess-1").unwrap().unwrap();
        assert_eq!(loaded.file_id, "file-1");
        assert!(store
            .load_resume_state_by_session("missing")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_missing_chunks_complement() {
        let store = ResumeStore::open_in_memory().unwrap();
        store.save_resume_state(&sample_info()).unwrap();

        let missing = store.get_missing_chunks("file-1", 8).unwrap();
        assert_eq!(missing, vec![2, 3, 4, 6, 7]);
    }

    #[test]
    fn test_missing_chunks_unknown_file_is_everything() {
        let store = ResumeStore::open_in_memory().unwrap();
        assert_eq!(store.get_missing_chunks("nope", 3).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_update_chunk_completed_creates_state() {
        let store = ResumeStore::open_in_memory().unwrap();

        store.update_chunk_completed("f", "s", 2).unwrap();
        store.update_chunk_completed("f", "s", 4).unwrap();

        let completed = store.get_completed_chunks("f").unwrap();
        assert_eq!(completed, [2u64, 4].into_iter().collect());
        assert!(store.is_resumable("f").unwrap());
    }

    #[test]
    fn test_remove_resume_state() {
        let store = ResumeStore::open_in_memory().unwrap();
        store.save_resume_state(&sample_info()).unwrap();

        assert!(store.remove_resume_state("file-1").unwrap());
        assert!(!store.remove_resume_state("file-1").unwrap());
        assert!(store.load_resume_state("file-1").unwrap().is_none());
    }

    #[test]
    fn test_cleanup_old_states() {
        let store = ResumeStore::open_in_memory().unwrap();

        let mut stale = sample_info();
        stale.file_id = "stale".to_string();
        stale.last_activity = 1000; // long ago
        store.save_resume_state(&stale).unwrap();

        let fresh = sample_info();
        store.save_resume_state(&fresh).unwrap();

        let pruned = store
            .cleanup_old_resume_states(DEFAULT_RESUME_MAX_AGE_SECS)
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(store.load_resume_state("stale").unwrap().is_none());
        assert!(store.load_resume_state("file-1").unwrap().is_some());
    }

    #[test]
    fn test_list_resumable_transfers() {
        let store = ResumeStore::open_in_memory().unwrap();
        assert!(store.list_resumable_transfers().unwrap().is_empty());

        store.save_resume_state(&sample_info()).unwrap();
        let mut other = sample_info();
        other.file_id = "file-2".to_string();
        other.session_id = "sess-2".to_string();
        store.save_resume_state(&other).unwrap();

        assert_eq!(store.list_resumable_transfers().unwrap().len(), 2);
        assert_eq!(store.resume_state_count().unwrap(), 2);
    }
}
