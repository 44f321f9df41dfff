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

//! Snapshot sidecar: `(last_index, last_term, state_bytes)` with the state
//! snappy compressed and crc32 checked. Written atomically via a temp file
//! rename so a crashed snapshot never shadows a good one.

use std::{
    fs::{File, create_dir_all, rename},
    io::{Read, Write as IoWrite},
    path::{Path, PathBuf},
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use snafu::{ResultExt, ensure};

use crate::{ChecksumMismatchSnafu, Error, FileIoSnafu, InvalidFileTypeSnafu, Result};

const SNAPSHOT_IDENTIFIER: &[u8; 8] = b"DPSNAP01";

#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub last_index: u64,
    pub last_term: u64,
    pub state: Vec<u8>,
}

pub fn build_snapshot_path(root_dir: impl AsRef<Path>, group: &str) -> PathBuf {
    let mut path = root_dir.as_ref().to_path_buf();
    path.push(group);
    path.push("snapshot");
    path.set_extension("snap");
    path
}

pub fn write(root_dir: impl AsRef<Path>, group: &str, snapshot: &Snapshot) -> Result<()> {
    let path = build_snapshot_path(root_dir, group);
    let parent = path.parent().expect("snapshot path has a parent directory");
    create_dir_all(parent).context(FileIoSnafu { path: parent })?;

    let compressed = snap::raw::Encoder::new()
        .compress_vec(&snapshot.state)
        .map_err(|e| Error::FileIo {
            source: std::io::Error::other(e),
            path: path.clone(),
        })?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&snapshot.last_index.to_be_bytes());
    hasher.update(&snapshot.last_term.to_be_bytes());
    hasher.update(&compressed);
    let checksum = hasher.finalize();

    let tmp_path = path.with_extension("snap.tmp");
    let mut f = File::create(&tmp_path).context(FileIoSnafu { path: &tmp_path })?;
    f.write_all(SNAPSHOT_IDENTIFIER)
        .context(FileIoSnafu { path: &tmp_path })?;
    f.write_u64::<BigEndian>(snapshot.last_index)
        .context(FileIoSnafu { path: &tmp_path })?;
    f.write_u64::<BigEndian>(snapshot.last_term)
        .context(FileIoSnafu { path: &tmp_path })?;
    f.write_u32::<BigEndian>(compressed.len() as u32)
        .context(FileIoSnafu { path: &tmp_path })?;
    f.write_all(&compressed)
        .context(FileIoSnafu { path: &tmp_path })?;
    f.write_u32::<BigEndian>(checksum)
        .context(FileIoSnafu { path: &tmp_path })?;
    f.sync_all().context(FileIoSnafu { path: &tmp_path })?;
    rename(&tmp_path, &path).context(FileIoSnafu { path: &path })?;
    Ok(())
}

pub fn read(root_dir: impl AsRef<Path>, group: &str) -> Result<Option<Snapshot>> {
    let path = build_snapshot_path(root_dir, group);
    let mut f = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::FileIo { source: e, path }),
    };

    let mut magic = [0u8; SNAPSHOT_IDENTIFIER.len()];
    f.read_exact(&mut magic).context(FileIoSnafu { path: &path })?;
    ensure!(
        &magic == SNAPSHOT_IDENTIFIER,
        InvalidFileTypeSnafu { path: &path }
    );

    let last_index = f.read_u64::<BigEndian>().context(FileIoSnafu { path: &path })?;
    let last_term = f.read_u64::<BigEndian>().context(FileIoSnafu { path: &path })?;
    let len = f.read_u32::<BigEndian>().context(FileIoSnafu { path: &path })?;
    let mut compressed = vec![0u8; len as usize];
    f.read_exact(&mut compressed)
        .context(FileIoSnafu { path: &path })?;
    let stored_checksum = f.read_u32::<BigEndian>().context(FileIoSnafu { path: &path })?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&last_index.to_be_bytes());
    hasher.update(&last_term.to_be_bytes());
    hasher.update(&compressed);
    ensure!(
        hasher.finalize() == stored_checksum,
        ChecksumMismatchSnafu { index: last_index }
    );

    let state = snap::raw::Decoder::new()
        .decompress_vec(&compressed)
        .map_err(|e| Error::FileIo {
            source: std::io::Error::other(e),
            path,
        })?;

    Ok(Some(Snapshot {
        last_index,
        last_term,
        state,
    }))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let snapshot = Snapshot {
            last_index: 42,
            last_term: 3,
            state: b"cluster state bytes".repeat(100),
        };
        write(dir.path(), "group", &snapshot).unwrap();
        let read_back = read(dir.path(), "group").unwrap().unwrap();
        assert_eq!(read_back, snapshot);
    }

    #[test]
    fn test_snapshot_missing_is_none() {
        let dir = tempdir().unwrap();
        assert!(read(dir.path(), "nope").unwrap().is_none());
    }

    #[test]
    fn test_snapshot_overwrite_keeps_latest() {
        let dir = tempdir().unwrap();
        for index in [1u64, 2, 3] {
            let snapshot = Snapshot {
                last_index: index,
                last_term: 1,
                state: vec![index as u8; 16],
            };
            write(dir.path(), "group", &snapshot).unwrap();
        }
        assert_eq!(read(dir.path(), "group").unwrap().unwrap().last_index, 3);
    }
}
