//! SQLite-backed file index.
//!
//! One row per shared or downloading file keyed by file hash, plus one row
//! per chunk carrying its hash and availability bit. The full metadata is
//! persisted alongside as a postcard BLOB so it reloads without loss.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use super::metadata::FileMetadata;
use super::StorageError;

pub struct FileIndex {
    conn: Connection,
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl FileIndex {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let index = Self { conn };
        index.create_tables()?;
        Ok(index)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let index = Self { conn };
        index.create_tables()?;
        Ok(index)
    }

    fn create_tables(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS files (
                file_hash TEXT PRIMARY KEY,
                file_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                modified_at INTEGER NOT NULL,
                chunk_size INTEGER NOT NULL,
                file_type TEXT,
                description TEXT,
                metadata_blob BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS chunks (
                file_hash TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                chunk_hash TEXT NOT NULL,
                is_available INTEGER DEFAULT 0,
                PRIMARY KEY (file_hash, chunk_index)
            );
            CREATE INDEX IF NOT EXISTS idx_files_file_id ON files(file_id);
            CREATE INDEX IF NOT EXISTS idx_files_filename ON files(filename);
            CREATE INDEX IF NOT EXISTS idx_chunks_available ON chunks(is_available);",
        )?;
        Ok(())
    }

    fn insert_file_row(&self, metadata: &FileMetadata, available: bool) -> Result<(), StorageError> {
        let blob = postcard::to_allocvec(metadata)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO files
             (file_hash, file_id, filename, file_size, created_at, modified_at,
              chunk_size, file_type, description, metadata_blob)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                metadata.file_hash,
                metadata.file_id,
                metadata.filename,
                metadata.file_size as i64,
                metadata.created_at as i64,
                metadata.modified_at as i64,
                metadata.chunk_size,
                metadata.file_type,
                metadata.description,
                blob,
            ],
        )?;

        self.conn.execute(
            "DELETE FROM chunks WHERE file_hash = ?1",
            params![metadata.file_hash],
        )?;
        let mut stmt = self.conn.prepare(
            "INSERT INTO chunks (file_hash, chunk_index, chunk_hash, is_available)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (index, chunk_hash) in metadata.chunk_hashes.iter().enumerate() {
            stmt.execute(params![
                metadata.file_hash,
                index as i64,
                chunk_hash,
                available as i64,
            ])?;
        }
        Ok(())
    }

    /// Insert or replace a fully available file. A second insert with the
    /// same hash replaces the previous rows without duplication.
    pub fn add_file(&self, metadata: &FileMetadata) -> Result<(), StorageError> {
        self.insert_file_row(metadata, true)
    }

    /// Insert a file whose chunks are not yet on disk (a download target).
    /// Chunk availability is tracked via [`update_chunk_progress`](Self::update_chunk_progress).
    pub fn add_incomplete_file(&self, metadata: &FileMetadata) -> Result<(), StorageError> {
        self.insert_file_row(metadata, false)
    }

    pub fn get_file(&self, file_hash: &str) -> Result<Option<FileMetadata>, StorageError> {
        let blob: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT metadata_blob FROM files WHERE file_hash = ?1",
                params![file_hash],
                |row| row.get(0),
            )
            .optional()?;
        match blob {
            Some(blob) => Ok(Some(postcard::from_bytes(&blob)?)),
            None => Ok(None),
        }
    }

    pub fn get_by_file_id(&self, file_id: &str) -> Result<Option<FileMetadata>, StorageError> {
        let blob: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT metadata_blob FROM files WHERE file_id = ?1",
                params![file_id],
                |row| row.get(0),
            )
            .optional()?;
        match blob {
            Some(blob) => Ok(Some(postcard::from_bytes(&blob)?)),
            None => Ok(None),
        }
    }

    pub fn list_files(&self) -> Result<Vec<FileMetadata>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT metadata_blob FROM files ORDER BY created_at")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;

        let mut files = Vec::new();
        for blob in rows {
            files.push(postcard::from_bytes(&blob?)?);
        }
        Ok(files)
    }

    /// Substring match over filename, file type, and description.
    pub fn search_files(&self, query: &str) -> Result<Vec<FileMetadata>, StorageError> {
        let pattern = format!("%{}%", query);
        let mut stmt = self.conn.prepare(
            "SELECT metadata_blob FROM files
             WHERE filename LIKE ?1 OR file_type LIKE ?1 OR description LIKE ?1
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![pattern], |row| row.get::<_, Vec<u8>>(0))?;

        let mut files = Vec::new();
        for blob in rows {
            files.push(postcard::from_bytes(&blob?)?);
        }
        Ok(files)
    }

    /// Remove a file and all its chunk rows.
    pub fn remove_file(&self, file_hash: &str) -> Result<bool, StorageError> {
        self.conn
            .execute("DELETE FROM chunks WHERE file_hash = ?1", params![file_hash])?;
        let removed = self
            .conn
            .execute("DELETE FROM files WHERE file_hash = ?1", params![file_hash])?;
        Ok(removed > 0)
    }

    /// Mark one chunk available after a verified download.
    pub fn update_chunk_progress(
        &self,
        file_hash: &str,
        chunk_index: u32,
        chunk_hash: &str,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO chunks (file_hash, chunk_index, chunk_hash, is_available)
             VALUES (?1, ?2, ?3, 1)",
            params![file_hash, chunk_index as i64, chunk_hash],
        )?;
        self.conn.execute(
            "UPDATE files SET modified_at = ?2 WHERE file_hash = ?1",
            params![file_hash, now_unix_secs() as i64],
        )?;
        Ok(())
    }

    /// All chunk indices not yet marked available.
    pub fn get_missing_chunks(&self, file_hash: &str) -> Result<Vec<u32>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT chunk_index FROM chunks
             WHERE file_hash = ?1 AND is_available = 0
             ORDER BY chunk_index",
        )?;
        let rows = stmt.query_map(params![file_hash], |row| row.get::<_, i64>(0))?;

        let mut missing = Vec::new();
        for index in rows {
            missing.push(index? as u32);
        }
        Ok(missing)
    }

    pub fn file_count(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn total_size(&self) -> Result<u64, StorageError> {
        let total: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(file_size), 0) FROM files",
            [],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }

    /// Remove files last modified before the cutoff that still have missing
    /// chunks. Returns the number of files pruned.
    pub fn cleanup_incomplete_files(&self, cutoff_secs: u64) -> Result<usize, StorageError> {
        let threshold = now_unix_secs().saturating_sub(cutoff_secs) as i64;
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT f.file_hash FROM files f
             JOIN chunks c ON c.file_hash = f.file_hash
             WHERE c.is_available = 0 AND f.modified_at < ?1",
        )?;
        let hashes: Vec<String> = stmt
            .query_map(params![threshold], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        for hash in &hashes {
            self.remove_file(hash)?;
        }
        Ok(hashes.len())
    }
}

impl std::fmt::Debug for FileIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileIndex").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::metadata::expected_chunk_count;

    fn sample_metadata(hash: &str, chunks: u32) -> FileMetadata {
        let chunk_size = 256u32;
        let file_size = u64::from(chunks) * u64::from(chunk_size);
        assert_eq!(expected_chunk_count(file_size, chunk_size), chunks);
        FileMetadata {
            file_id: hash.to_string(),
            file_hash: hash.to_string(),
            filename: format!("{}.bin", hash),
            file_path: format!("/tmp/{}.bin", hash),
            file_size,
            chunk_size,
            chunk_count: chunks,
            chunk_hashes: (0..chunks).map(|i| format!("chunk-{}", i)).collect(),
            file_type: "bin".to_string(),
            description: "test file".to_string(),
            tags: vec!["test".to_string()],
            created_at: 1_700_000_000,
            modified_at: 1_700_000_000,
        }
    }

    #[test]
    fn test_add_and_get_file() {
        let index = FileIndex::open_in_memory().unwrap();
        let metadata = sample_metadata("aabb", 4);

        index.add_file(&metadata).unwrap();
        let loaded = index.get_file("aabb").unwrap().unwrap();
        assert_eq!(loaded, metadata);

        assert!(index.get_file("ffff").unwrap().is_none());
    }

    #[test]
    fn test_get_by_file_id() {
        let index = FileIndex::open_in_memory().unwrap();
        let metadata = sample_metadata("ccdd", 2);
        index.add_file(&metadata).unwrap();

        let loaded = index.get_by_file_id("ccdd").unwrap().unwrap();
        assert_eq!(loaded.file_hash, "ccdd");
    }

    #[test]
    fn test_second_add_replaces_without_duplication() {
        let index = FileIndex::open_in_memory().unwrap();
        let mut metadata = sample_metadata("aabb", 4);

        index.add_file(&metadata).unwrap();
        metadata.description = "updated".to_string();
        index.add_file(&metadata).unwrap();

        assert_eq!(index.file_count().unwrap(), 1);
        let loaded = index.get_file("aabb").unwrap().unwrap();
        assert_eq!(loaded.description, "updated");
    }

    #[test]
    fn test_complete_file_has_no_missing_chunks() {
        let index = FileIndex::open_in_memory().unwrap();
        index.add_file(&sample_metadata("aabb", 4)).unwrap();
        assert!(index.get_missing_chunks("aabb").unwrap().is_empty());
    }

    #[test]
    fn test_incomplete_file_progress() {
        let index = FileIndex::open_in_memory().unwrap();
        let metadata = sample_metadata("eeff", 4);
        index.add_incomplete_file(&metadata).unwrap();

        assert_eq!(index.get_missing_chunks("eeff").unwrap(), vec![0, 1, 2, 3]);

        index.update_chunk_progress("eeff", 1, "chunk-1").unwrap();
        index.update_chunk_progress("eeff", 3, "chunk-3").unwrap();
        assert_eq!(index.get_missing_chunks("eeff").unwrap(), vec![0, 2]);
    }

    #[test]
    fn test_remove_file_cascades_to_chunks() {
        let index = FileIndex::open_in_memory().unwrap();
        index.add_file(&sample_metadata("aabb", 4)).unwrap();

        assert!(index.remove_file("aabb").unwrap());
        assert!(index.get_file("aabb").unwrap().is_none());

        let chunk_rows: i64 = index
            .conn
            .query_row(
                "SELECT COUNT(*) FROM chunks WHERE file_hash = 'aabb'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(chunk_rows, 0);

        assert!(!index.remove_file("aabb").unwrap());
    }

    #[test]
    fn test_list_and_search() {
        let index = FileIndex::open_in_memory().unwrap();
        let mut a = sample_metadata("a1", 1);
        a.filename = "report.pdf".to_string();
        let mut b = sample_metadata("b2", 1);
        b.filename = "holiday.jpg".to_string();
        b.description = "beach photos".to_string();
        index.add_file(&a).unwrap();
        index.add_file(&b).unwrap();

        assert_eq!(index.list_files().unwrap().len(), 2);
        let found = index.search_files("report").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].filename, "report.pdf");

        let by_description = index.search_files("beach").unwrap();
        assert_eq!(by_description.len(), 1);
        assert_eq!(by_description[0].file_hash, "b2");
    }

    #[test]
    fn test_counters() {
        let index = FileIndex::open_in_memory().unwrap();
        assert_eq!(index.file_count().unwrap(), 0);
        assert_eq!(index.total_size().unwrap(), 0);

        index.add_file(&sample_metadata("a1", 2)).unwrap();
        index.add_file(&sample_metadata("b2", 4)).unwrap();
        assert_eq!(index.file_count().unwrap(), 2);
        assert_eq!(index.total_size().unwrap(), 6 * 256);
    }

    #[test]
    fn test_cleanup_incomplete_files() {
        let index = FileIndex::open_in_memory().unwrap();

        // Old incomplete file
        let old = sample_metadata("old1", 2);
        index.add_incomplete_file(&old).unwrap();
        index
            .conn
            .execute("UPDATE files SET modified_at = 1000 WHERE file_hash = 'old1'", [])
            .unwrap();

        // Fresh incomplete file and a complete one
        index.add_incomplete_file(&sample_metadata("new1", 2)).unwrap();
        index.add_file(&sample_metadata("done", 2)).unwrap();

        let pruned = index.cleanup_incomplete_files(3600).unwrap();
        assert_eq!(pruned, 1);
        assert!(index.get_file("old1").unwrap().is_none());
        assert!(index.get_file("new1").unwrap().is_some());
        assert!(index.get_file("done").unwrap().is_some());
    }
}
