//! Preallocated output files with offset-addressed writes.
//!
//! The torrent's files form one virtual byte stream (files concatenated in
//! metainfo order); piece `k` starts at `k * piece_length` in that stream.
//! Writes are addressed by virtual offset and split across whichever files
//! the range intersects.
use crate::torrent::{FilePlan, Metainfo};

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Output directory {0:?} already exists")]
    OutputDirExists(PathBuf),

    #[error("Access past end of torrent: offset {offset}, length {length}")]
    OutOfBounds { offset: u64, length: u64 },
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

fn io_err(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug)]
struct SinkFile {
    plan: FilePlan,
    /// Same-file access is serialized; writes to different files can run
    /// concurrently.
    file: Mutex<File>,
}

/// The on-disk write target for a download run.
#[derive(Debug)]
pub struct FileSink {
    files: Vec<SinkFile>,
    total_length: u64,
}

impl FileSink {
    /// Creates the output tree and preallocates every file.
    ///
    /// The output directory must not exist yet; parent directories for
    /// individual files are created as needed and each file is extended to
    /// its final length up front.
    #[instrument(level = "debug", skip(metainfo), fields(name = %metainfo.name))]
    pub fn create(out_dir: &Path, metainfo: &Metainfo) -> StorageResult<Self> {
        if out_dir.exists() {
            return Err(StorageError::OutputDirExists(out_dir.to_path_buf()));
        }
        fs::create_dir_all(out_dir).map_err(|e| io_err(out_dir, e))?;

        let mut files = Vec::with_capacity(metainfo.files.len());
        for plan in metainfo.layout(out_dir) {
            if let Some(parent) = plan.path.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&plan.path)
                .map_err(|e| io_err(&plan.path, e))?;
            file.set_len(plan.length)
                .map_err(|e| io_err(&plan.path, e))?;
            debug!(path = ?plan.path, length = plan.length, "Preallocated output file");
            files.push(SinkFile {
                plan,
                file: Mutex::new(file),
            });
        }

        Ok(Self {
            files,
            total_length: metainfo.total_length,
        })
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    fn check_bounds(&self, offset: u64, length: usize) -> StorageResult<()> {
        let end = offset
            .checked_add(length as u64)
            .filter(|&end| end <= self.total_length);
        if end.is_none() {
            return Err(StorageError::OutOfBounds {
                offset,
                length: length as u64,
            });
        }
        Ok(())
    }

    /// Writes `data` at virtual offset `offset`, splitting it across every
    /// file the range intersects.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        self.check_bounds(offset, data.len())?;
        let end = offset + data.len() as u64;

        for sink in &self.files {
            let file_start = sink.plan.offset;
            let file_end = file_start + sink.plan.length;
            let overlap_start = offset.max(file_start);
            let overlap_end = end.min(file_end);
            if overlap_start >= overlap_end {
                continue;
            }

            let chunk_start = (overlap_start - offset) as usize;
            let chunk_len = (overlap_end - overlap_start) as usize;
            let chunk = &data[chunk_start..chunk_start + chunk_len];

            let mut file = sink.file.lock().expect("sink file lock poisoned");
            file.seek(SeekFrom::Start(overlap_start - file_start))
                .map_err(|e| io_err(&sink.plan.path, e))?;
            file.write_all(chunk).map_err(|e| io_err(&sink.plan.path, e))?;
        }
        Ok(())
    }

    /// Reads `buf.len()` bytes starting at virtual offset `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        self.check_bounds(offset, buf.len())?;
        let end = offset + buf.len() as u64;

        for sink in &self.files {
            let file_start = sink.plan.offset;
            let file_end = file_start + sink.plan.length;
            let overlap_start = offset.max(file_start);
            let overlap_end = end.min(file_end);
            if overlap_start >= overlap_end {
                continue;
            }

            let chunk_start = (overlap_start - offset) as usize;
            let chunk_len = (overlap_end - overlap_start) as usize;
            let chunk = &mut buf[chunk_start..chunk_start + chunk_len];

            let mut file = sink.file.lock().expect("sink file lock poisoned");
            file.seek(SeekFrom::Start(overlap_start - file_start))
                .map_err(|e| io_err(&sink.plan.path, e))?;
            file.read_exact(chunk).map_err(|e| io_err(&sink.plan.path, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::{FileEntry, InfoHash};

    fn meta(files: Vec<FileEntry>, piece_length: u64) -> Metainfo {
        let total_length = files.iter().map(|f| f.length).sum::<u64>();
        let num_pieces = total_length.div_ceil(piece_length) as usize;
        Metainfo {
            announce: "http://tracker.lan/tr".to_string(),
            info_hash: InfoHash([0; 20]),
            piece_length,
            piece_hashes: vec![[0; 20]; num_pieces],
            name: files[0].path[0].clone(),
            files,
            total_length,
            creation_date: None,
            comment: None,
            created_by: None,
        }
    }

    fn entry(path: &[&str], length: u64) -> FileEntry {
        FileEntry {
            path: path.iter().map(|s| s.to_string()).collect(),
            length,
        }
    }

    #[test]
    fn refuses_existing_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        let meta = meta(vec![entry(&["a.bin"], 8)], 8);
        assert!(matches!(
            FileSink::create(dir.path(), &meta),
            Err(StorageError::OutputDirExists(_))
        ));
    }

    #[test]
    fn preallocates_files_to_final_size() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let meta = meta(
            vec![entry(&["d", "a.bin"], 5), entry(&["d", "sub", "b.bin"], 11)],
            8,
        );
        FileSink::create(&out, &meta).unwrap();
        assert_eq!(fs::metadata(out.join("d/a.bin")).unwrap().len(), 5);
        assert_eq!(fs::metadata(out.join("d/sub/b.bin")).unwrap().len(), 11);
    }

    #[test]
    fn writes_round_trip_within_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let meta = meta(vec![entry(&["a.bin"], 16)], 8);
        let sink = FileSink::create(&out, &meta).unwrap();

        sink.write_at(4, b"payload").unwrap();
        let mut buf = [0u8; 7];
        sink.read_at(4, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn spanning_write_splits_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let meta = meta(
            vec![entry(&["d", "a.bin"], 4), entry(&["d", "b.bin"], 8)],
            4,
        );
        let sink = FileSink::create(&out, &meta).unwrap();

        sink.write_at(2, b"XYZW").unwrap();
        assert_eq!(fs::read(out.join("d/a.bin")).unwrap(), b"\0\0XY");
        assert_eq!(fs::read(out.join("d/b.bin")).unwrap(), b"ZW\0\0\0\0\0\0");

        let mut buf = [0u8; 4];
        sink.read_at(2, &mut buf).unwrap();
        assert_eq!(&buf, b"XYZW");
    }

    #[test]
    fn rejects_out_of_bounds_access() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let meta = meta(vec![entry(&["a.bin"], 8)], 8);
        let sink = FileSink::create(&out, &meta).unwrap();
        assert!(matches!(
            sink.write_at(6, b"abc"),
            Err(StorageError::OutOfBounds { .. })
        ));
        let mut buf = [0u8; 3];
        assert!(matches!(
            sink.read_at(6, &mut buf),
            Err(StorageError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn zero_length_files_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let meta = meta(
            vec![entry(&["d", "empty.bin"], 0), entry(&["d", "a.bin"], 4)],
            4,
        );
        let sink = FileSink::create(&out, &meta).unwrap();
        sink.write_at(0, b"abcd").unwrap();
        assert_eq!(fs::read(out.join("d/empty.bin")).unwrap(), b"");
        assert_eq!(fs::read(out.join("d/a.bin")).unwrap(), b"abcd");
    }
}
