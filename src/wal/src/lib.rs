// Copyright 2025 Datapunk Contributors.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Append-only log for raft. Each entry is framed as
//! `(length u32, term u64, index u64, payload, crc32 u32)`; the checksum
//! covers term, index and payload. Snapshots live in a sidecar file next to
//! the log, see [`snapshot`].

pub mod snapshot;

use std::{
    fs::{File, OpenOptions, create_dir_all},
    io::{BufReader, Read, Seek, SeekFrom, Write as IoWrite},
    path::{Path, PathBuf},
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use snafu::{ResultExt, Snafu, ensure};

/// magic + format version
const FILE_TYPE_IDENTIFIER: &[u8; 8] = b"DPRAFT01";
/// length(4) + term(8) + index(8)
const ENTRY_HEADER_LEN: u64 = 20;
const CHECKSUM_LEN: u64 = 4;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("file error on {}: {}", path.display(), source))]
    FileIo {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("not a raft log file: {}", path.display()))]
    InvalidFileType { path: PathBuf },

    #[snafu(display("entry checksum mismatch at index {index}, the log is corrupt"))]
    ChecksumMismatch { index: u64 },

    #[snafu(display("truncated entry at offset {offset}"))]
    TruncatedEntry { offset: u64 },

    #[snafu(display("unknown log index {index}"))]
    UnknownIndex { index: u64 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub term: u64,
    pub index: u64,
    pub data: Vec<u8>,
}

pub fn build_file_path(root_dir: impl AsRef<Path>, group: &str, id: u64) -> PathBuf {
    let mut path = root_dir.as_ref().to_path_buf();
    path.push(group);
    path.push(format!("{id:020}"));
    path.set_extension("raft");
    path
}

/// Appends raft entries to a segment file. Keeps an in-memory map of
/// index to file offset so conflicting suffixes can be truncated.
pub struct Writer {
    path: PathBuf,
    f: File,
    bytes_written: u64,
    /// (index, offset of the entry frame)
    offsets: Vec<(u64, u64)>,
}

impl Writer {
    pub fn new(root_dir: impl AsRef<Path>, group: &str, id: u64) -> Result<Self> {
        let path = build_file_path(root_dir, group, id);
        let parent = path.parent().expect("file path has a parent directory");
        create_dir_all(parent).context(FileIoSnafu { path: parent })?;

        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .context(FileIoSnafu { path: &path })?;

        let mut bytes_written = f
            .metadata()
            .context(FileIoSnafu { path: &path })?
            .len();
        let mut offsets = Vec::new();
        if bytes_written == 0 {
            f.write_all(FILE_TYPE_IDENTIFIER)
                .context(FileIoSnafu { path: &path })?;
            f.sync_all().context(FileIoSnafu { path: &path })?;
            bytes_written = FILE_TYPE_IDENTIFIER.len() as u64;
        } else {
            // recover the offset map from the existing segment
            let mut reader = Reader::from_path(&path)?;
            loop {
                let offset = reader.offset();
                match reader.read_entry()? {
                    Some(entry) => offsets.push((entry.index, offset)),
                    None => break,
                }
            }
        }

        Ok(Writer {
            path,
            f,
            bytes_written,
            offsets,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.bytes_written
    }

    pub fn entry_count(&self) -> usize {
        self.offsets.len()
    }

    pub fn last_index(&self) -> u64 {
        self.offsets.last().map(|(idx, _)| *idx).unwrap_or(0)
    }

    pub fn write(&mut self, term: u64, index: u64, data: &[u8], sync: bool) -> Result<()> {
        let offset = self.bytes_written;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&term.to_be_bytes());
        hasher.update(&index.to_be_bytes());
        hasher.update(data);
        let checksum = hasher.finalize();

        let mut buf =
            Vec::with_capacity((ENTRY_HEADER_LEN + CHECKSUM_LEN) as usize + data.len());
        buf.write_u32::<BigEndian>(data.len() as u32)
            .expect("vec write cannot fail");
        buf.write_u64::<BigEndian>(term).expect("vec write cannot fail");
        buf.write_u64::<BigEndian>(index).expect("vec write cannot fail");
        buf.extend_from_slice(data);
        buf.write_u32::<BigEndian>(checksum)
            .expect("vec write cannot fail");

        self.f
            .write_all(&buf)
            .context(FileIoSnafu { path: &self.path })?;
        if sync {
            self.f.sync_data().context(FileIoSnafu { path: &self.path })?;
        }
        self.bytes_written += buf.len() as u64;
        self.offsets.push((index, offset));
        Ok(())
    }

    /// drop every entry with `index >= from_index`, raft conflict resolution
    pub fn truncate(&mut self, from_index: u64) -> Result<()> {
        let pos = match self.offsets.iter().position(|(idx, _)| *idx >= from_index) {
            Some(pos) => pos,
            None => return Ok(()),
        };
        let offset = self.offsets[pos].1;
        self.f
            .set_len(offset)
            .context(FileIoSnafu { path: &self.path })?;
        self.f
            .seek(SeekFrom::End(0))
            .context(FileIoSnafu { path: &self.path })?;
        self.f
            .sync_all()
            .context(FileIoSnafu { path: &self.path })?;
        self.bytes_written = offset;
        self.offsets.truncate(pos);
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.f.sync_all().context(FileIoSnafu { path: &self.path })
    }

    pub fn close(mut self) -> Result<()> {
        self.sync()
    }
}

/// Sequential reader over a segment file, verifying checksums as it goes.
pub struct Reader {
    path: PathBuf,
    f: BufReader<File>,
    offset: u64,
}

impl Reader {
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let f = File::open(&path).context(FileIoSnafu { path: &path })?;
        let mut reader = Reader {
            path,
            f: BufReader::new(f),
            offset: 0,
        };
        reader.check_file_type()?;
        Ok(reader)
    }

    fn check_file_type(&mut self) -> Result<()> {
        let mut buf = [0u8; FILE_TYPE_IDENTIFIER.len()];
        self.f
            .read_exact(&mut buf)
            .context(FileIoSnafu { path: &self.path })?;
        ensure!(
            &buf == FILE_TYPE_IDENTIFIER,
            InvalidFileTypeSnafu { path: &self.path }
        );
        self.offset = FILE_TYPE_IDENTIFIER.len() as u64;
        Ok(())
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// next entry, or None at a clean end of file
    pub fn read_entry(&mut self) -> Result<Option<Entry>> {
        let len = match self.f.read_u32::<BigEndian>() {
            Ok(len) => len,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Error::FileIo {
                source: e,
                path: self.path.clone(),
            }),
        };
        let term = self
            .f
            .read_u64::<BigEndian>()
            .map_err(|_| Error::TruncatedEntry { offset: self.offset })?;
        let index = self
            .f
            .read_u64::<BigEndian>()
            .map_err(|_| Error::TruncatedEntry { offset: self.offset })?;
        let mut data = vec![0u8; len as usize];
        self.f
            .read_exact(&mut data)
            .map_err(|_| Error::TruncatedEntry { offset: self.offset })?;
        let stored_checksum = self
            .f
            .read_u32::<BigEndian>()
            .map_err(|_| Error::TruncatedEntry { offset: self.offset })?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&term.to_be_bytes());
        hasher.update(&index.to_be_bytes());
        hasher.update(&data);
        ensure!(
            hasher.finalize() == stored_checksum,
            ChecksumMismatchSnafu { index }
        );

        self.offset += ENTRY_HEADER_LEN + len as u64 + CHECKSUM_LEN;
        Ok(Some(Entry { term, index, data }))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_truncate_drops_suffix() {
        let dir = tempdir().unwrap();
        let mut writer = Writer::new(dir.path(), "group", 1).unwrap();
        for i in 1..=10u64 {
            writer.write(1, i, format!("entry {i}").as_bytes(), false).unwrap();
        }
        writer.truncate(6).unwrap();
        assert_eq!(writer.last_index(), 5);
        // appends continue after the cut
        writer.write(2, 6, b"replacement", true).unwrap();
        writer.close().unwrap();

        let mut reader = Reader::from_path(build_file_path(dir.path(), "group", 1)).unwrap();
        let mut entries = Vec::new();
        while let Some(entry) = reader.read_entry().unwrap() {
            entries.push(entry);
        }
        assert_eq!(entries.len(), 6);
        assert_eq!(entries[5].term, 2);
        assert_eq!(entries[5].data, b"replacement");
    }

    #[test]
    fn test_reopen_recovers_offsets() {
        let dir = tempdir().unwrap();
        let mut writer = Writer::new(dir.path(), "group", 1).unwrap();
        for i in 1..=3u64 {
            writer.write(1, i, b"x", true).unwrap();
        }
        writer.close().unwrap();

        let writer = Writer::new(dir.path(), "group", 1).unwrap();
        assert_eq!(writer.entry_count(), 3);
        assert_eq!(writer.last_index(), 3);
    }

    #[test]
    fn test_corrupt_entry_detected() {
        let dir = tempdir().unwrap();
        let mut writer = Writer::new(dir.path(), "group", 1).unwrap();
        writer.write(1, 1, b"hello world", true).unwrap();
        let path = writer.path().to_path_buf();
        writer.close().unwrap();

        // flip one payload byte
        let mut bytes = std::fs::read(&path).unwrap();
        let n = bytes.len();
        bytes[n - CHECKSUM_LEN as usize - 2] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let mut reader = Reader::from_path(&path).unwrap();
        assert!(matches!(
            reader.read_entry(),
            Err(Error::ChecksumMismatch { index: 1 })
        ));
    }
}
