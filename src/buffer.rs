//! Chunk hashing and whole-file tree hash reassembly.
//!
//! Parts finish in any order, so hashes are recorded per file as an unordered
//! list and only reduced once the sorted ranges tile the whole file.

use crate::chunker::{split_ranges, FileSizer};
use crate::error::BufferError;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// A SHA-256 digest.
pub type Sha256Digest = [u8; 32];

/// Positioned reads that do not move a shared cursor.
pub trait ReadAt {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning how many
    /// were read. `Ok(0)` means end of input.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

impl ReadAt for std::fs::File {
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, offset)
    }
}

impl ReadAt for [u8] {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let Ok(offset) = usize::try_from(offset) else {
            return Ok(0);
        };
        if offset >= self.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.len() - offset);
        buf[..n].copy_from_slice(&self[offset..offset + n]);
        Ok(n)
    }
}

/// The digest of one recorded byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHash {
    pub start: u64,
    pub end: u64,
    pub sha256: Sha256Digest,
}

/// The bytes of a chunk alongside their SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub bytes: Vec<u8>,
    pub sha256: Sha256Digest,
}

type HashList = Arc<Mutex<Vec<FileHash>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-file record of chunk hashes.
///
/// The path map and each file's hash list are locked independently, so
/// workers hashing different files never contend.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    files: Mutex<HashMap<PathBuf, HashList>>,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, path: &Path) -> HashList {
        Arc::clone(lock(&self.files).entry(path.to_path_buf()).or_default())
    }

    fn existing(&self, path: &Path) -> Option<HashList> {
        lock(&self.files).get(path).cloned()
    }

    /// Reads `[start, end)` of `path` through `reader`, hashes it and records
    /// the hash against the range.
    ///
    /// A short read fails with [`BufferError::IncompleteBuffer`] and records
    /// nothing.
    pub fn fetch_and_hash<R: ReadAt + ?Sized>(
        &self,
        reader: &R,
        path: &Path,
        start: u64,
        end: u64,
    ) -> Result<FileChunk, BufferError> {
        if end <= start {
            return Err(BufferError::InvalidRange { start, end });
        }
        let expected = usize::try_from(end - start)
            .map_err(|_| BufferError::InvalidRange { start, end })?;

        let mut bytes = vec![0u8; expected];
        let read = read_full_at(reader, &mut bytes, start)?;
        if read < expected {
            return Err(BufferError::IncompleteBuffer { expected, read });
        }

        let sha256: Sha256Digest = Sha256::digest(&bytes).into();
        self.record(
            path,
            FileHash {
                start,
                end,
                sha256,
            },
        );
        Ok(FileChunk { bytes, sha256 })
    }

    /// Records a hash for `path`, replacing any entry for the identical range.
    pub fn record(&self, path: &Path, hash: FileHash) {
        let list = self.entry(path);
        let mut hashes = lock(&list);
        match hashes
            .iter_mut()
            .find(|h| h.start == hash.start && h.end == hash.end)
        {
            Some(existing) => *existing = hash,
            None => hashes.push(hash),
        }
    }

    /// The hashes recorded for `path`, sorted by start byte.
    pub fn hashes(&self, path: &Path) -> Vec<FileHash> {
        let Some(list) = self.existing(path) else {
            return Vec::new();
        };
        let mut hashes = lock(&list).clone();
        hashes.sort_by_key(|h| h.start);
        hashes
    }

    /// Forgets everything recorded for `path`. Returns whether anything was
    /// recorded.
    pub fn discard(&self, path: &Path) -> bool {
        lock(&self.files).remove(path).is_some()
    }

    /// Computes the tree hash of `path` once its recorded ranges exactly tile
    /// `[0, file size)`.
    ///
    /// Returns [`BufferError::MissingFileChunks`] while any range is missing,
    /// overlapping or duplicated.
    pub fn tree_hash<S: FileSizer + ?Sized>(
        &self,
        sizer: &S,
        path: &Path,
    ) -> Result<Sha256Digest, BufferError> {
        let total = sizer.file_size(path)?;
        let list = self
            .existing(path)
            .ok_or_else(|| BufferError::MissingFileChunks(path.to_path_buf()))?;

        let digests = {
            let mut hashes = lock(&list);
            hashes.sort_by_key(|h| h.start);
            ordered_digests(&hashes, total)
        };

        digests
            .map(|digests| tree_hash_root(&digests))
            .ok_or_else(|| BufferError::MissingFileChunks(path.to_path_buf()))
    }
}

/// Reads until `buf` is full or the reader reports end of input.
fn read_full_at<R: ReadAt + ?Sized>(
    reader: &R,
    buf: &mut [u8],
    offset: u64,
) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Returns the digests in file order if the sorted `hashes` tile `[0, total)`
/// with no gap, overlap or duplicate.
fn ordered_digests(hashes: &[FileHash], total: u64) -> Option<Vec<Sha256Digest>> {
    let first = hashes.first()?;
    let last = hashes.last()?;
    if first.start != 0 || last.end != total {
        return None;
    }
    if hashes.windows(2).any(|pair| pair[1].start != pair[0].end) {
        return None;
    }
    Some(hashes.iter().map(|h| h.sha256).collect())
}

/// Reduces leaf digests to a single root by hashing adjacent pairs left to
/// right, carrying an unpaired trailing digest up unchanged.
///
/// An empty input yields the digest of no bytes.
pub fn tree_hash_root(leaves: &[Sha256Digest]) -> Sha256Digest {
    if leaves.is_empty() {
        return Sha256::digest(b"").into();
    }

    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => {
                    let mut hasher = Sha256::new();
                    hasher.update(left);
                    hasher.update(right);
                    hasher.finalize().into()
                }
                _ => pair[0],
            })
            .collect();
    }
    level[0]
}

/// Computes the tree hash of a whole file with `leaf_size` byte leaves.
///
/// With `leaf_size` equal to the upload part size this matches the digest
/// [`ChunkBuffer::tree_hash`] produces for the same file.
pub fn tree_hash_file(path: &Path, leaf_size: u64) -> Result<Sha256Digest, BufferError> {
    if leaf_size == 0 {
        return Err(BufferError::InvalidRange { start: 0, end: 0 });
    }
    let file = std::fs::File::open(path)?;
    let total = file.metadata()?.len();

    let mut leaves: Vec<Sha256Digest> = Vec::new();
    let mut buf = Vec::new();
    for (start, end) in split_ranges(leaf_size, total) {
        let expected = (end - start) as usize;
        buf.resize(expected, 0);
        let read = read_full_at(&file, &mut buf, start)?;
        if read < expected {
            return Err(BufferError::IncompleteBuffer { expected, read });
        }
        leaves.push(Sha256::digest(&buf).into());
    }
    Ok(tree_hash_root(&leaves))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct FixedSize(u64);

    impl FileSizer for FixedSize {
        fn file_size(&self, _path: &Path) -> io::Result<u64> {
            Ok(self.0)
        }
    }

    struct FailingReader;

    impl ReadAt for FailingReader {
        fn read_at(&self, _buf: &mut [u8], _offset: u64) -> io::Result<usize> {
            Err(io::Error::other("error"))
        }
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn hash_of(bytes: &[u8]) -> Sha256Digest {
        Sha256::digest(bytes).into()
    }

    fn pair(left: &Sha256Digest, right: &Sha256Digest) -> Sha256Digest {
        let mut joined = left.to_vec();
        joined.extend_from_slice(right);
        hash_of(&joined)
    }

    fn entry(start: u64, end: u64) -> FileHash {
        FileHash {
            start,
            end,
            sha256: hash_of(&start.to_le_bytes()),
        }
    }

    #[test]
    fn test_fetch_and_hash_covers_range() {
        let data = sample(10);
        let buffer = ChunkBuffer::new();
        let path = Path::new("path/to/file");

        assert!(buffer.hashes(path).is_empty());
        let chunk = buffer.fetch_and_hash(data.as_slice(), path, 0, 10).unwrap();

        assert_eq!(chunk.bytes, data);
        assert_eq!(chunk.sha256, hash_of(&data));
        let hashes = buffer.hashes(path);
        assert_eq!(hashes.len(), 1);
        assert_eq!((hashes[0].start, hashes[0].end), (0, 10));
        assert_eq!(hashes[0].sha256, hash_of(&data));
    }

    #[test]
    fn test_fetch_and_hash_reads_at_offset() {
        let data = sample(30);
        let buffer = ChunkBuffer::new();
        let chunk = buffer
            .fetch_and_hash(data.as_slice(), Path::new("f"), 10, 20)
            .unwrap();
        assert_eq!(chunk.bytes, &data[10..20]);
    }

    #[test]
    fn test_short_read_is_incomplete() {
        let data = sample(9);
        let buffer = ChunkBuffer::new();
        let path = Path::new("path/to/file");

        let err = buffer
            .fetch_and_hash(data.as_slice(), path, 0, 10)
            .unwrap_err();
        assert!(matches!(
            err,
            BufferError::IncompleteBuffer {
                expected: 10,
                read: 9
            }
        ));
        assert!(buffer.hashes(path).is_empty());
    }

    #[test]
    fn test_reader_errors_propagate() {
        let buffer = ChunkBuffer::new();
        let err = buffer
            .fetch_and_hash(&FailingReader, Path::new("f"), 0, 10)
            .unwrap_err();
        assert!(matches!(err, BufferError::Io(_)));
    }

    #[test]
    fn test_invalid_range() {
        let buffer = ChunkBuffer::new();
        let data = sample(10);
        assert!(matches!(
            buffer.fetch_and_hash(data.as_slice(), Path::new("f"), 5, 5),
            Err(BufferError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_tree_hash_is_order_independent() {
        let data = sample(25);
        let path = Path::new("file");
        let ranges = split_ranges(10, 25);
        assert_eq!(ranges, vec![(0, 10), (10, 20), (20, 25)]);

        let mut roots = Vec::new();
        for order in [[0usize, 1, 2], [2, 0, 1]] {
            let buffer = ChunkBuffer::new();
            for i in order {
                let (start, end) = ranges[i];
                buffer
                    .fetch_and_hash(data.as_slice(), path, start, end)
                    .unwrap();
            }
            roots.push(buffer.tree_hash(&FixedSize(25), path).unwrap());
        }
        assert_eq!(roots[0], roots[1]);

        let leaves = [
            hash_of(&data[0..10]),
            hash_of(&data[10..20]),
            hash_of(&data[20..25]),
        ];
        assert_eq!(roots[0], pair(&pair(&leaves[0], &leaves[1]), &leaves[2]));
    }

    #[test]
    fn test_tree_hash_incomplete_until_tiled() {
        let data = sample(25);
        let path = Path::new("file");
        let sizer = FixedSize(25);
        let buffer = ChunkBuffer::new();

        assert!(matches!(
            buffer.tree_hash(&sizer, path),
            Err(BufferError::MissingFileChunks(_))
        ));
        buffer.fetch_and_hash(data.as_slice(), path, 20, 25).unwrap();
        buffer.fetch_and_hash(data.as_slice(), path, 0, 10).unwrap();
        assert!(matches!(
            buffer.tree_hash(&sizer, path),
            Err(BufferError::MissingFileChunks(_))
        ));
        buffer.fetch_and_hash(data.as_slice(), path, 10, 20).unwrap();
        assert!(buffer.tree_hash(&sizer, path).is_ok());
    }

    #[test]
    fn test_tree_hash_rejects_bad_tilings() {
        let path = Path::new("file");
        let sizer = FixedSize(30);
        let cases: Vec<Vec<FileHash>> = vec![
            // missing leading edge
            vec![entry(10, 20), entry(20, 30)],
            // missing trailing edge
            vec![entry(0, 10), entry(10, 20)],
            // gap
            vec![entry(0, 10), entry(15, 30)],
            // overlap
            vec![entry(0, 15), entry(10, 30)],
            // duplicate start
            vec![entry(0, 10), entry(0, 20), entry(10, 30)],
            // past the end
            vec![entry(0, 10), entry(10, 40)],
        ];

        for hashes in cases {
            let buffer = ChunkBuffer::new();
            for hash in &hashes {
                buffer.record(path, *hash);
            }
            assert!(
                matches!(
                    buffer.tree_hash(&sizer, path),
                    Err(BufferError::MissingFileChunks(_))
                ),
                "expected missing chunks for {:?}",
                hashes
            );
        }
    }

    #[test]
    fn test_rehashing_a_range_replaces_it() {
        let data = sample(20);
        let path = Path::new("file");
        let buffer = ChunkBuffer::new();
        buffer.fetch_and_hash(data.as_slice(), path, 0, 10).unwrap();
        buffer.fetch_and_hash(data.as_slice(), path, 0, 10).unwrap();
        buffer.fetch_and_hash(data.as_slice(), path, 10, 20).unwrap();
        assert_eq!(buffer.hashes(path).len(), 2);
        assert!(buffer.tree_hash(&FixedSize(20), path).is_ok());
    }

    #[test]
    fn test_single_chunk_root_is_its_hash() {
        let data = sample(10);
        let path = Path::new("file");
        let buffer = ChunkBuffer::new();
        buffer.fetch_and_hash(data.as_slice(), path, 0, 10).unwrap();
        assert_eq!(
            buffer.tree_hash(&FixedSize(10), path).unwrap(),
            hash_of(&data)
        );
    }

    #[test]
    fn test_discard_forgets_hashes() {
        let data = sample(10);
        let path = Path::new("file");
        let buffer = ChunkBuffer::new();
        buffer.fetch_and_hash(data.as_slice(), path, 0, 10).unwrap();
        assert!(buffer.discard(path));
        assert!(!buffer.discard(path));
        assert!(buffer.hashes(path).is_empty());
    }

    #[test]
    fn test_tree_hash_root_carries_odd_digest() {
        let leaves: Vec<Sha256Digest> = (0u8..5).map(|i| hash_of(&[i])).collect();
        let expected = pair(
            &pair(&pair(&leaves[0], &leaves[1]), &pair(&leaves[2], &leaves[3])),
            &leaves[4],
        );
        assert_eq!(tree_hash_root(&leaves), expected);
        assert_eq!(tree_hash_root(&leaves[..1]), leaves[0]);
        assert_eq!(tree_hash_root(&[]), hash_of(&[]));
    }

    #[test]
    fn test_tree_hash_file_matches_buffer() {
        let data = sample(25);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let buffer = ChunkBuffer::new();
        let reader = std::fs::File::open(file.path()).unwrap();
        for (start, end) in split_ranges(10, 25) {
            buffer
                .fetch_and_hash(&reader, file.path(), start, end)
                .unwrap();
        }
        let sizer = crate::chunker::OsFileSizer;
        assert_eq!(
            buffer.tree_hash(&sizer, file.path()).unwrap(),
            tree_hash_file(file.path(), 10).unwrap()
        );
    }
}
