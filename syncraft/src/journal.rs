//! The append-only command log, its snapshot record, and the durable dump.

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;

use crate::raft::Entry;
use crate::raft::HardState;
use crate::raft::SnapshotMeta;
use crate::raft_types::LogId;

/// Layout version of the on-disk dump.
const DUMP_VERSION: u32 = 1;

/// The latest snapshot of the user state, kept in memory alongside the live
/// log so it can be shipped to lagging followers at any time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct SnapshotRecord {
    pub meta: SnapshotMeta,
    pub state: Vec<u8>,
}

/// The whole-file dump layout. Always written via write-temp-then-rename so
/// a reader only ever observes a complete previous or complete next dump.
#[derive(Serialize, Deserialize)]
struct Dump {
    version: u32,
    hard_state: HardState,
    snapshot: Option<SnapshotRecord>,
    live_log: Vec<Entry>,
}

/// The live log suffix plus the latest snapshot.
///
/// Entries are held contiguously; the lowest live index is
/// `compacted_index() + 1`. Index arithmetic violations here mean the Raft
/// core above has diverged, and divergence is answered by halting, not by
/// patching over.
pub(crate) struct Journal {
    entries: VecDeque<Entry>,
    snapshot: Option<SnapshotRecord>,
    dump_file: Option<PathBuf>,
    last_compaction: Instant,
}

impl Journal {
    /// Open a journal, restoring `{term, voted_for, snapshot, live log}`
    /// from the dump file when one is configured and readable.
    ///
    /// A missing file is a pristine start. A corrupt file is logged and
    /// treated as pristine as well: the cluster will catch this node up.
    pub(crate) fn load(dump_file: Option<PathBuf>) -> (Self, HardState) {
        let mut journal = Self {
            entries: VecDeque::new(),
            snapshot: None,
            dump_file,
            last_compaction: Instant::now(),
        };
        let mut hard_state = HardState::default();

        if let Some(path) = journal.dump_file.clone() {
            match read_dump(&path) {
                Ok(Some(dump)) => {
                    tracing::info!(
                        path=%path.display(),
                        entries = dump.live_log.len(),
                        "restored journal from dump"
                    );
                    hard_state = dump.hard_state;
                    journal.snapshot = dump.snapshot;
                    journal.entries = dump.live_log.into();
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(path=%path.display(), error=%err, "unreadable dump; starting empty");
                }
            }
        }

        (journal, hard_state)
    }

    /// The index covered by the latest snapshot; 0 when no snapshot exists.
    pub(crate) fn compacted_index(&self) -> u64 {
        self.snapshot.as_ref().map(|s| s.meta.last_log_id.index).unwrap_or(0)
    }

    /// The lowest index held live in the log.
    pub(crate) fn first_index(&self) -> u64 {
        self.compacted_index() + 1
    }

    /// The id of the last entry, falling back to the snapshot boundary.
    pub(crate) fn last_log_id(&self) -> LogId {
        match self.entries.back() {
            Some(entry) => entry.log_id,
            None => self.snapshot.as_ref().map(|s| s.meta.last_log_id).unwrap_or_default(),
        }
    }

    /// The number of live entries.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn snapshot(&self) -> Option<&SnapshotRecord> {
        self.snapshot.as_ref()
    }

    /// Get the live entry at `index`.
    pub(crate) fn entry(&self, index: u64) -> Option<&Entry> {
        if index < self.first_index() {
            return None;
        }
        self.entries.get((index - self.first_index()) as usize)
    }

    /// The term of the entry at `index`, answering from the snapshot
    /// boundary when the entry itself was compacted away.
    pub(crate) fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if let Some(snapshot) = &self.snapshot {
            if index == snapshot.meta.last_log_id.index {
                return Some(snapshot.meta.last_log_id.term);
            }
        }
        self.entry(index).map(|entry| entry.log_id.term)
    }

    /// Clone out the entries in `[lo, hi]`, clamped to what is live.
    pub(crate) fn entries_range(&self, lo: u64, hi: u64) -> Vec<Entry> {
        let mut out = Vec::new();
        let mut index = std::cmp::max(lo, self.first_index());
        while index <= hi {
            match self.entry(index) {
                Some(entry) => out.push(entry.clone()),
                None => break,
            }
            index += 1;
        }
        out
    }

    /// Append contiguous entries to the log.
    pub(crate) fn append(&mut self, entries: Vec<Entry>) {
        for entry in entries {
            let expected = self.last_log_id().index + 1;
            assert_eq!(
                entry.log_id.index, expected,
                "journal append discontinuity: got index {}, expected {}",
                entry.log_id.index, expected
            );
            self.entries.push_back(entry);
        }
    }

    /// Drop the uncommitted tail starting at `from_index`.
    ///
    /// `commit_index` guards the committed prefix: truncating at or below it
    /// is a safety violation and halts the node.
    pub(crate) fn truncate_suffix(&mut self, from_index: u64, commit_index: u64) {
        assert!(
            from_index > commit_index,
            "attempt to truncate committed entries: from {} <= commit {}",
            from_index,
            commit_index
        );
        while self.last_log_id().index >= from_index && !self.entries.is_empty() {
            self.entries.pop_back();
        }
    }

    /// Whether the compaction thresholds are currently met.
    pub(crate) fn wants_compaction(&self, min_entries: usize, min_time: std::time::Duration) -> bool {
        self.entries.len() >= std::cmp::max(min_entries, 1) && self.last_compaction.elapsed() >= min_time
    }

    /// Fold everything up to `last_applied` into a new snapshot, discard the
    /// covered entries, and rewrite the dump.
    pub(crate) fn compact(&mut self, meta: SnapshotMeta, state: Vec<u8>, hard_state: &HardState) {
        let boundary = meta.last_log_id.index;
        while self
            .entries
            .front()
            .map(|entry| entry.log_id.index <= boundary)
            .unwrap_or(false)
        {
            self.entries.pop_front();
        }
        self.snapshot = Some(SnapshotRecord { meta, state });
        self.last_compaction = Instant::now();
        self.persist(hard_state);
    }

    /// Replace the journal's contents with a snapshot received from the
    /// leader. The live log is reset; replication resumes above the
    /// snapshot boundary.
    pub(crate) fn install_snapshot(&mut self, meta: SnapshotMeta, state: Vec<u8>, hard_state: &HardState) {
        self.entries.clear();
        self.snapshot = Some(SnapshotRecord { meta, state });
        self.last_compaction = Instant::now();
        self.persist(hard_state);
    }

    /// Write the whole dump to disk, if persistence is configured.
    ///
    /// Failures are logged and swallowed: the node keeps serving without
    /// durability rather than stalling the cluster.
    pub(crate) fn persist(&self, hard_state: &HardState) {
        let path = match &self.dump_file {
            Some(path) => path,
            None => return,
        };
        let dump = Dump {
            version: DUMP_VERSION,
            hard_state: hard_state.clone(),
            snapshot: self.snapshot.clone(),
            live_log: self.entries.iter().cloned().collect(),
        };
        if let Err(err) = write_dump(path, &dump) {
            tracing::error!(path=%path.display(), error=%err, "dump write failed; continuing without persistence");
        }
    }
}

fn read_dump(path: &Path) -> anyhow::Result<Option<Dump>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context("reading dump file"),
    };
    let dump: Dump = bincode::deserialize(&bytes).context("decoding dump file")?;
    if dump.version != DUMP_VERSION {
        anyhow::bail!("unsupported dump version {}", dump.version);
    }
    Ok(Some(dump))
}

fn write_dump(path: &Path, dump: &Dump) -> anyhow::Result<()> {
    let bytes = bincode::serialize(dump).context("encoding dump")?;
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp).context("creating temp dump")?;
        file.write_all(&bytes).context("writing temp dump")?;
        file.sync_all().context("syncing temp dump")?;
    }
    fs::rename(&tmp, path).context("renaming dump into place")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::raft::EntryNormal;
    use crate::raft::EntryPayload;
    use crate::raft::Membership;
    use crate::raft_types::NodeAddress;

    fn entry(term: u64, index: u64) -> Entry {
        Entry {
            log_id: LogId::new(term, index),
            payload: EntryPayload::Normal(EntryNormal {
                data: vec![index as u8],
            }),
        }
    }

    fn membership() -> Membership {
        let mut members = BTreeSet::new();
        members.insert(NodeAddress::new("localhost", 6001));
        members.insert(NodeAddress::new("localhost", 6002));
        Membership { members }
    }

    #[test]
    fn test_append_and_lookup() {
        let (mut journal, _) = Journal::load(None);
        journal.append(vec![entry(1, 1), entry(1, 2), entry(2, 3)]);

        assert_eq!(journal.last_log_id(), LogId::new(2, 3));
        assert_eq!(journal.first_index(), 1);
        assert_eq!(journal.len(), 3);
        assert_eq!(journal.term_at(2), Some(1));
        assert_eq!(journal.term_at(3), Some(2));
        assert_eq!(journal.term_at(4), None);
        assert_eq!(journal.term_at(0), Some(0));

        let range = journal.entries_range(2, 3);
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].log_id.index, 2);
    }

    #[test]
    #[should_panic(expected = "discontinuity")]
    fn test_append_discontinuity_is_fatal() {
        let (mut journal, _) = Journal::load(None);
        journal.append(vec![entry(1, 1), entry(1, 3)]);
    }

    #[test]
    fn test_truncate_suffix() {
        let (mut journal, _) = Journal::load(None);
        journal.append(vec![entry(1, 1), entry(1, 2), entry(1, 3)]);
        journal.truncate_suffix(2, 1);
        assert_eq!(journal.last_log_id(), LogId::new(1, 1));
        assert_eq!(journal.len(), 1);
    }

    #[test]
    #[should_panic(expected = "truncate committed")]
    fn test_truncate_committed_is_fatal() {
        let (mut journal, _) = Journal::load(None);
        journal.append(vec![entry(1, 1), entry(1, 2)]);
        journal.truncate_suffix(2, 2);
    }

    #[test]
    fn test_compaction_discards_prefix_and_serves_terms() {
        let (mut journal, _) = Journal::load(None);
        journal.append(vec![entry(1, 1), entry(1, 2), entry(2, 3), entry(2, 4)]);

        let meta = SnapshotMeta {
            last_log_id: LogId::new(2, 3),
            membership: membership(),
        };
        journal.compact(meta, vec![9, 9], &HardState::default());

        assert_eq!(journal.compacted_index(), 3);
        assert_eq!(journal.first_index(), 4);
        assert_eq!(journal.len(), 1);
        assert_eq!(journal.term_at(3), Some(2));
        assert!(journal.entry(3).is_none());
        assert_eq!(journal.entry(4).unwrap().log_id.index, 4);
        assert_eq!(journal.last_log_id(), LogId::new(2, 4));
    }

    #[test]
    fn test_dump_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.dump");

        let hs = HardState {
            current_term: 7,
            voted_for: Some(NodeAddress::new("localhost", 6001)),
        };
        {
            let (mut journal, _) = Journal::load(Some(path.clone()));
            journal.append(vec![entry(1, 1), entry(1, 2), entry(7, 3)]);
            let meta = SnapshotMeta {
                last_log_id: LogId::new(1, 2),
                membership: membership(),
            };
            journal.compact(meta, vec![1, 2, 3], &hs);
        }

        let (journal, restored) = Journal::load(Some(path));
        assert_eq!(restored, hs);
        assert_eq!(journal.compacted_index(), 2);
        assert_eq!(journal.len(), 1);
        assert_eq!(journal.snapshot().unwrap().state, vec![1, 2, 3]);
        assert_eq!(journal.last_log_id(), LogId::new(7, 3));
    }

    #[test]
    fn test_corrupt_dump_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.dump");
        fs::write(&path, b"not a dump").unwrap();

        let (journal, hs) = Journal::load(Some(path));
        assert_eq!(hs, HardState::default());
        assert_eq!(journal.len(), 0);
        assert!(journal.snapshot().is_none());
    }

    #[test]
    fn test_torn_temp_file_does_not_shadow_good_dump() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.dump");

        {
            let (mut journal, _) = Journal::load(Some(path.clone()));
            journal.append(vec![entry(1, 1)]);
            journal.persist(&HardState::default());
        }
        // A crash mid-write leaves a partial temp file behind; the load path
        // must only ever look at the renamed dump.
        fs::write(path.with_extension("tmp"), b"partial garbage").unwrap();

        let (journal, _) = Journal::load(Some(path));
        assert_eq!(journal.len(), 1);
    }
}
