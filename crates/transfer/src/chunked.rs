use std::io::SeekFrom;
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::types::Chunk;
use crate::{DEFAULT_CHUNK_SIZE, TransferError};

/// Splits `total_size` bytes into consecutive chunks of `chunk_size`.
///
/// The last chunk carries the remainder. An empty source yields no chunks.
/// If `chunk_size` is 0, [`DEFAULT_CHUNK_SIZE`] is used.
pub fn partition(total_size: u64, chunk_size: u64) -> Vec<Chunk> {
    let chunk_size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };

    let count = total_size.div_ceil(chunk_size);
    (0..count)
        .map(|i| {
            let start = i * chunk_size;
            let end = (start + chunk_size).min(total_size);
            Chunk::new(i as u32, start, end)
        })
        .collect()
}

/// Reads the byte range of `chunk` from `path`.
///
/// Fails with [`TransferError::SourceChanged`] if the file no longer
/// covers the range it was partitioned with.
pub async fn read_chunk(path: &Path, chunk: &Chunk) -> Result<Vec<u8>, TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    let actual = file.metadata().await?.len();
    if actual < chunk.end {
        return Err(TransferError::SourceChanged {
            expected: chunk.end,
            actual,
        });
    }

    file.seek(SeekFrom::Start(chunk.start)).await?;
    let mut buf = vec![0u8; chunk.size as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    fn create_test_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    fn assert_covers(chunks: &[Chunk], total: u64) {
        let mut expected_start = 0;
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index as usize, i);
            assert_eq!(c.start, expected_start, "gap or overlap at chunk {i}");
            assert_eq!(c.size, c.end - c.start);
            assert!(c.size > 0);
            expected_start = c.end;
        }
        assert_eq!(expected_start, total);
        assert_eq!(chunks.iter().map(|c| c.size).sum::<u64>(), total);
    }

    #[test]
    fn twelve_mib_in_five_mib_chunks() {
        let chunks = partition(12 * MIB, 5 * MIB);
        let sizes: Vec<u64> = chunks.iter().map(|c| c.size).collect();
        assert_eq!(sizes, vec![5 * MIB, 5 * MIB, 2 * MIB]);
        assert_covers(&chunks, 12 * MIB);
    }

    #[test]
    fn exact_multiple_has_no_runt() {
        let chunks = partition(10 * MIB, 5 * MIB);
        assert_eq!(chunks.len(), 2);
        assert_covers(&chunks, 10 * MIB);
    }

    #[test]
    fn partition_covers_all_sizes() {
        for total in [1u64, 2, 3, 7, 64, 1000, 4097, 65_537] {
            for chunk in [1u64, 2, 3, 5, 64, 4096] {
                let chunks = partition(total, chunk);
                assert_eq!(chunks.len() as u64, total.div_ceil(chunk));
                assert_covers(&chunks, total);
            }
        }
    }

    #[test]
    fn empty_source_has_no_chunks() {
        assert!(partition(0, 5 * MIB).is_empty());
    }

    #[test]
    fn zero_chunk_size_uses_default() {
        let chunks = partition(DEFAULT_CHUNK_SIZE + 1, 0);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].size, DEFAULT_CHUNK_SIZE);
        assert_eq!(chunks[1].size, 1);
    }

    #[tokio::test]
    async fn read_chunk_returns_range() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"AABBCCDDEE");
        let chunks = partition(10, 4);

        assert_eq!(read_chunk(&path, &chunks[0]).await.unwrap(), b"AABB");
        assert_eq!(read_chunk(&path, &chunks[1]).await.unwrap(), b"CCDD");
        assert_eq!(read_chunk(&path, &chunks[2]).await.unwrap(), b"EE");
    }

    #[tokio::test]
    async fn read_chunk_detects_truncated_source() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"AABBCCDDEE");
        let chunks = partition(10, 4);
        std::fs::write(&path, b"AABB").unwrap();

        let err = read_chunk(&path, &chunks[2]).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::SourceChanged {
                expected: 10,
                actual: 4
            }
        ));
    }

    #[tokio::test]
    async fn read_chunk_missing_file() {
        let chunks = partition(10, 4);
        let err = read_chunk(Path::new("/nonexistent/chunkferry.bin"), &chunks[0])
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
    }
}
