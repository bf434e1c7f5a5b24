//! Chunking and content-addressed verification.
//!
//! Files are read sequentially in fixed-size blocks. Each block is hashed
//! with BLAKE3 into the chunk hash list, and the same pass feeds a streaming
//! hasher for the whole-file hash, so sharing a file costs a single read of
//! its bytes. Chunking is deterministic: the same bytes always produce the
//! same metadata.
//!
//! Chunk files are written atomically: content goes to a temporary name in
//! the target directory and is renamed into place.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use super::layout::chunk_path;
use super::metadata::{FileMetadata, DEFAULT_CHUNK_SIZE};
use super::StorageError;

#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: u32,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl Chunker {
    pub fn new(chunk_size: u32) -> Self {
        assert!(chunk_size > 0, "chunk size must be nonzero");
        Self { chunk_size }
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Chunk a file: per-chunk BLAKE3 hashes plus the whole-file hash in one
    /// sequential pass. Idempotent and deterministic.
    pub fn chunk_file(&self, path: &Path) -> Result<FileMetadata, StorageError> {
        let mut file = File::open(path)
            .map_err(|_| StorageError::NotFound(format!("file not found: {}", path.display())))?;

        let mut chunk_hashes = Vec::new();
        let mut file_hasher = blake3::Hasher::new();
        let mut file_size: u64 = 0;
        let mut buffer = vec![0u8; self.chunk_size as usize];

        loop {
            let n = read_full(&mut file, &mut buffer)?;
            if n == 0 {
                break;
            }
            let block = &buffer[..n];
            chunk_hashes.push(blake3::hash(block).to_hex().to_string());
            file_hasher.update(block);
            file_size += n as u64;
            if n < buffer.len() {
                break;
            }
        }

        let file_hash = file_hasher.finalize().to_hex().to_string();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_type = path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        let now = now_unix_secs();

        Ok(FileMetadata {
            file_id: file_hash.clone(),
            file_hash,
            filename,
            file_path: path.to_string_lossy().into_owned(),
            file_size,
            chunk_size: self.chunk_size,
            chunk_count: chunk_hashes.len() as u32,
            chunk_hashes,
            file_type,
            description: String::new(),
            tags: vec![],
            created_at: now,
            modified_at: now,
        })
    }

    /// Read one chunk out of a complete file by offset.
    pub fn read_chunk_from_file(
        &self,
        path: &Path,
        metadata: &FileMetadata,
        chunk_index: u32,
    ) -> Result<Vec<u8>, StorageError> {
        if chunk_index >= metadata.chunk_count {
            return Err(StorageError::InvalidInput(format!(
                "chunk index {} out of range ({} chunks)",
                chunk_index, metadata.chunk_count
            )));
        }

        use std::io::{Seek, SeekFrom};
        let mut file = File::open(path)?;
        let offset = u64::from(chunk_index) * u64::from(metadata.chunk_size);
        file.seek(SeekFrom::Start(offset))?;

        let mut data = vec![0u8; metadata.chunk_size_at(chunk_index) as usize];
        file.read_exact(&mut data)?;
        Ok(data)
    }

    /// Write a chunk under the partitioned layout, atomically.
    pub fn write_chunk(
        &self,
        base: &Path,
        file_hash: &str,
        chunk_index: u32,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let target = chunk_path(base, file_hash, chunk_index);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = target.with_extension(format!("tmp.{}", std::process::id()));
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    /// Read a previously written chunk.
    pub fn read_chunk(
        &self,
        base: &Path,
        file_hash: &str,
        chunk_index: u32,
    ) -> Result<Vec<u8>, StorageError> {
        let path = chunk_path(base, file_hash, chunk_index);
        fs::read(&path).map_err(|_| {
            StorageError::NotFound(format!("chunk {} of {} not on disk", chunk_index, file_hash))
        })
    }

    /// Concatenate stored chunks into the output file.
    pub fn merge_chunks(
        &self,
        base: &Path,
        file_hash: &str,
        output: &Path,
        total_chunks: u32,
    ) -> Result<(), StorageError> {
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(output)?;
        for index in 0..total_chunks {
            let data = self.read_chunk(base, file_hash, index)?;
            out.write_all(&data)?;
        }
        out.sync_all()?;
        Ok(())
    }

    /// Remove all stored chunks of a file. Missing chunks are ignored.
    pub fn remove_chunks(&self, base: &Path, file_hash: &str, total_chunks: u32) {
        for index in 0..total_chunks {
            let _ = fs::remove_file(chunk_path(base, file_hash, index));
        }
    }
}

/// Fill as much of `buf` as the reader provides; short only at EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize, StorageError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// A chunk is valid iff its BLAKE3 hash equals the expected hex digest.
pub fn verify_chunk(data: &[u8], expected_hash: &str) -> bool {
    blake3::hash(data).to_hex().to_string() == expected_hash
}

/// Verify a whole file against its metadata: size and file hash must match.
pub fn verify_file(path: &Path, metadata: &FileMetadata) -> Result<bool, StorageError> {
    let actual_size = fs::metadata(path)?.len();
    if actual_size != metadata.file_size {
        return Ok(false);
    }

    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string() == metadata.file_hash)
}

/// Recompute every chunk hash of a file and report the indices that differ
/// from the stored hashes.
pub fn corruption_report(path: &Path, metadata: &FileMetadata) -> Result<Vec<u32>, StorageError> {
    let mut file = File::open(path)?;
    let mut corrupt = Vec::new();
    let mut buffer = vec![0u8; metadata.chunk_size as usize];

    for index in 0..metadata.chunk_count {
        let expected_len = metadata.chunk_size_at(index) as usize;
        let n = read_full(&mut file, &mut buffer[..expected_len])?;
        let block = &buffer[..n];
        if n != expected_len || !verify_chunk(block, &metadata.chunk_hashes[index as usize]) {
            corrupt.push(index);
        }
    }
    Ok(corrupt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(content: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.bin");
        fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_chunk_file_small() {
        let (_dir, path) = write_temp(&[0x42u8; 1000]);
        let chunker = Chunker::new(256);
        let metadata = chunker.chunk_file(&path).unwrap();

        assert_eq!(metadata.file_size, 1000);
        assert_eq!(metadata.chunk_count, 4); // 256+256+256+232
        assert_eq!(metadata.chunk_hashes.len(), 4);
        assert!(metadata.is_consistent());
        assert_eq!(metadata.chunk_size_at(3), 232);
    }

    #[test]
    fn test_chunk_file_empty() {
        let (_dir, path) = write_temp(&[]);
        let metadata = Chunker::default().chunk_file(&path).unwrap();

        assert_eq!(metadata.file_size, 0);
        assert_eq!(metadata.chunk_count, 0);
        assert!(metadata.chunk_hashes.is_empty());
        assert!(metadata.is_consistent());
    }

    #[test]
    fn test_chunk_file_exact_multiple() {
        let (_dir, path) = write_temp(&[7u8; 512]);
        let metadata = Chunker::new(256).chunk_file(&path).unwrap();
        assert_eq!(metadata.chunk_count, 2);
        assert_eq!(metadata.chunk_size_at(1), 256);
    }

    #[test]
    fn test_chunk_file_is_deterministic() {
        let (_dir, path) = write_temp(b"deterministic content");
        let chunker = Chunker::new(8);

        let m1 = chunker.chunk_file(&path).unwrap();
        let m2 = chunker.chunk_file(&path).unwrap();
        assert_eq!(m1.file_hash, m2.file_hash);
        assert_eq!(m1.chunk_hashes, m2.chunk_hashes);
    }

    #[test]
    fn test_file_hash_matches_streaming_hash() {
        let content = vec![0xA5u8; 10_000];
        let (_dir, path) = write_temp(&content);
        let metadata = Chunker::new(1024).chunk_file(&path).unwrap();

        assert_eq!(
            metadata.file_hash,
            blake3::hash(&content).to_hex().to_string()
        );
    }

    #[test]
    fn test_verify_chunk() {
        let chunk = vec![0x42u8; 65536];
        let expected = blake3::hash(&chunk).to_hex().to_string();
        assert!(verify_chunk(&chunk, &expected));

        let mut tampered = chunk.clone();
        tampered[100] ^= 0xFF;
        assert!(!verify_chunk(&tampered, &expected));
    }

    #[test]
    fn test_verify_file() {
        let (_dir, path) = write_temp(b"verify me");
        let metadata = Chunker::default().chunk_file(&path).unwrap();
        assert!(verify_file(&path, &metadata).unwrap());

        fs::write(&path, b"verify mE").unwrap();
        assert!(!verify_file(&path, &metadata).unwrap());
    }

    #[test]
    fn test_verify_file_size_mismatch() {
        let (_dir, path) = write_temp(b"1234");
        let mut metadata = Chunker::default().chunk_file(&path).unwrap();
        metadata.file_size += 1;
        assert!(!verify_file(&path, &metadata).unwrap());
    }

    #[test]
    fn test_corruption_report_identifies_indices() {
        let content = vec![1u8; 1024];
        let (dir, path) = write_temp(&content);
        let metadata = Chunker::new(256).chunk_file(&path).unwrap();

        // Corrupt one byte inside the third chunk
        let mut bytes = content.clone();
        bytes[2 * 256 + 10] ^= 0xFF;
        let corrupted_path = dir.path().join("corrupted.bin");
        fs::write(&corrupted_path, &bytes).unwrap();

        let report = corruption_report(&corrupted_path, &metadata).unwrap();
        assert_eq!(report, vec![2]);
    }

    #[test]
    fn test_corruption_report_clean_file() {
        let (_dir, path) = write_temp(&[9u8; 2000]);
        let metadata = Chunker::new(512).chunk_file(&path).unwrap();
        assert!(corruption_report(&path, &metadata).unwrap().is_empty());
    }

    #[test]
    fn test_write_read_chunk_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let chunker = Chunker::new(256);
        let hash = "abcd1234";
        let data = vec![0x11u8; 256];

        chunker.write_chunk(dir.path(), hash, 3, &data).unwrap();
        assert_eq!(chunker.read_chunk(dir.path(), hash, 3).unwrap(), data);

        // Written into the two-hex-char partition
        assert!(dir.path().join("ab").join("abcd1234.chunk.000003").exists());
    }

    #[test]
    fn test_read_missing_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let err = Chunker::default().read_chunk(dir.path(), "ffff", 0).unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn test_merge_chunks_reassembles_file() {
        let content: Vec<u8> = (0..=255).cycle().take(1000).collect();
        let (dir, path) = write_temp(&content);
        let chunker = Chunker::new(256);
        let metadata = chunker.chunk_file(&path).unwrap();

        let store = dir.path().join("chunks");
        for index in 0..metadata.chunk_count {
            let data = chunker.read_chunk_from_file(&path, &metadata, index).unwrap();
            chunker
                .write_chunk(&store, &metadata.file_hash, index, &data)
                .unwrap();
        }

        let output = dir.path().join("merged.bin");
        chunker
            .merge_chunks(&store, &metadata.file_hash, &output, metadata.chunk_count)
            .unwrap();
        assert_eq!(fs::read(&output).unwrap(), content);
        assert!(verify_file(&output, &metadata).unwrap());
    }

    #[test]
    fn test_read_chunk_from_file_bounds() {
        let (_dir, path) = write_temp(&[1u8; 100]);
        let chunker = Chunker::new(64);
        let metadata = chunker.chunk_file(&path).unwrap();

        let last = chunker.read_chunk_from_file(&path, &metadata, 1).unwrap();
        assert_eq!(last.len(), 36);

        let err = chunker.read_chunk_from_file(&path, &metadata, 2).unwrap_err();
        assert!(matches!(err, StorageError::InvalidInput(_)));
    }
}
