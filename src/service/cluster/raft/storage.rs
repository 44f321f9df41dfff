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

//! Raft durability: the entry log goes through the wal crate, snapshots to
//! its sidecar, and (term, voted_for) to a small json file next to them.

use config::{get_config, meta::raft::LogEntry, utils::json};
use infra::errors::*;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::RaftCore;

const GROUP: &str = "cluster";
const LOG_ID: u64 = 1;

static WRITER: Lazy<Mutex<Option<wal::Writer>>> = Lazy::new(|| Mutex::new(None));

#[derive(Debug, Default, Serialize, Deserialize)]
struct HardState {
    term: u64,
    voted_for: Option<String>,
}

fn hard_state_path() -> std::path::PathBuf {
    std::path::Path::new(&get_config().common.data_raft_dir)
        .join(GROUP)
        .join("hard_state.json")
}

fn with_writer<T>(f: impl FnOnce(&mut wal::Writer) -> Result<T>) -> Result<T> {
    let mut guard = WRITER.lock();
    if guard.is_none() {
        let writer = wal::Writer::new(&get_config().common.data_raft_dir, GROUP, LOG_ID)?;
        *guard = Some(writer);
    }
    f(guard.as_mut().expect("writer initialized"))
}

pub(super) fn append(entry: &LogEntry) -> Result<()> {
    let data = json::to_vec(&entry.command)?;
    with_writer(|writer| Ok(writer.write(entry.term, entry.index, &data, true)?))
}

pub(super) fn truncate(from_index: u64) {
    if let Err(e) = with_writer(|writer| Ok(writer.truncate(from_index)?)) {
        log::error!("[RAFT] log truncate failed: {e}");
    }
}

pub(super) fn save_hard_state(term: u64, voted_for: Option<String>) {
    let state = HardState { term, voted_for };
    let path = hard_state_path();
    let write = || -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, json::to_vec(&state)?)?;
        Ok(())
    };
    if let Err(e) = write() {
        log::error!("[RAFT] hard state persist failed: {e}");
    }
}

/// rebuild core state from snapshot + log + hard state after a restart
pub(super) fn recover(core: &mut RaftCore) -> Result<()> {
    let cfg = get_config();

    if let Ok(data) = std::fs::read(hard_state_path()) {
        if let Ok(hard) = json::from_slice::<HardState>(&data) {
            core.current_term = hard.term;
            core.voted_for = hard.voted_for;
        }
    }

    if let Some(snapshot) = wal::snapshot::read(&cfg.common.data_raft_dir, GROUP)? {
        core.state = json::from_slice(&snapshot.state)?;
        core.snapshot_last_index = snapshot.last_index;
        core.snapshot_last_term = snapshot.last_term;
        core.commit_index = snapshot.last_index;
        core.last_applied = snapshot.last_index;
    }

    let path = wal::build_file_path(&cfg.common.data_raft_dir, GROUP, LOG_ID);
    if path.exists() {
        let mut reader = wal::Reader::from_path(path)?;
        let mut recovered = 0;
        while let Some(entry) = reader.read_entry()? {
            if entry.index <= core.snapshot_last_index {
                continue;
            }
            core.log.push(LogEntry {
                term: entry.term,
                index: entry.index,
                command: json::from_slice(&entry.data)?,
            });
            recovered += 1;
        }
        if recovered > 0 {
            log::info!("[RAFT] recovered {recovered} log entries from disk");
        }
    }
    Ok(())
}

/// fold the applied prefix into a snapshot and drop it from the log
pub(super) fn compact(core: &mut RaftCore) -> Result<()> {
    let cfg = get_config();
    let last_applied = core.last_applied;
    if last_applied <= core.snapshot_last_index {
        return Ok(());
    }
    let last_term = core.term_at(last_applied).unwrap_or(core.current_term);
    wal::snapshot::write(
        &cfg.common.data_raft_dir,
        GROUP,
        &wal::snapshot::Snapshot {
            last_index: last_applied,
            last_term,
            state: json::to_vec(&core.state)?,
        },
    )?;
    let keep_from = (last_applied - core.snapshot_last_index) as usize;
    core.log.drain(..keep_from.min(core.log.len()));
    core.snapshot_last_index = last_applied;
    core.snapshot_last_term = last_term;

    // rewrite the on-disk log to only hold the tail
    {
        let mut guard = WRITER.lock();
        *guard = None;
    }
    let path = wal::build_file_path(&cfg.common.data_raft_dir, GROUP, LOG_ID);
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    for entry in core.log.clone() {
        append(&entry)?;
    }
    log::info!("[RAFT] compacted log through index {last_applied}");
    Ok(())
}

pub(super) fn install_snapshot(core: &RaftCore) -> Result<()> {
    let cfg = get_config();
    wal::snapshot::write(
        &cfg.common.data_raft_dir,
        GROUP,
        &wal::snapshot::Snapshot {
            last_index: core.snapshot_last_index,
            last_term: core.snapshot_last_term,
            state: json::to_vec(&core.state)?,
        },
    )?;
    {
        let mut guard = WRITER.lock();
        *guard = None;
    }
    let path = wal::build_file_path(&cfg.common.data_raft_dir, GROUP, LOG_ID);
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    Ok(())
}
