//! Per-node reputation with on-disk persistence.
//!
//! Scores live in `[0, 200]` with 100 as neutral. Decay is applied on read,
//! never on storage: a score drifts toward 100 at 5 points per full day
//! since its last explicit update, clamped so it never crosses neutral.
//! Misbehaving nodes get a path back; stale credit evaporates.
//!
//! The on-disk snapshot is a small versioned binary file written with the
//! same wire primitives as the network codecs. Saves are atomic: serialize
//! to a temp file, fsync, rotate the previous snapshot to `.bak`, rename.

use crate::{
    types::NodeId,
    utils::current_unix_millis,
    wire::{Decoder, Encoder, WireError},
};
use std::{
    collections::HashMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

pub const MIN_SCORE: i32 = 0;
pub const MAX_SCORE: i32 = 200;
pub const INITIAL_SCORE: i32 = 100;
/// Nodes whose score falls below this are marked dead by the discovery
/// liveness cycle.
pub const DEAD_SCORE: i32 = 20;

/// Whether a score is low enough to declare its node dead.
pub fn is_dead_score(score: i32) -> bool {
    score < DEAD_SCORE
}

const DECAY_PER_DAY: i32 = 5;
const DAY_MS: u64 = 86_400_000;

pub const DEFAULT_SAVE_INTERVAL_MS: u64 = 60_000;

const SNAPSHOT_MAGIC: u32 = 0x5844_5250; // "XDRP"
const SNAPSHOT_VERSION: u16 = 1;
const SNAPSHOT_FILE: &str = "reputation.dat";
const SNAPSHOT_BACKUP: &str = "reputation.dat.bak";
const SNAPSHOT_TMP: &str = "reputation.tmp";

#[derive(Debug, Error)]
pub enum ReputationError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("corrupt reputation snapshot: {0}")]
    Corrupt(String),
    #[error("background save task died")]
    SaveTaskGone,
}

impl From<WireError> for ReputationError {
    fn from(e: WireError) -> Self {
        ReputationError::Corrupt(e.to_string())
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    score: i32,
    /// Unix epoch millis of the last explicit `set`.
    last_update: u64,
}

impl Entry {
    /// The score as seen at `now_ms`, after decay toward neutral.
    fn decayed(&self, now_ms: u64) -> i32 {
        let days = (now_ms.saturating_sub(self.last_update) / DAY_MS) as i32;
        if days == 0 || self.score == INITIAL_SCORE {
            return self.score;
        }
        if self.score > INITIAL_SCORE {
            (self.score - DECAY_PER_DAY * days).max(INITIAL_SCORE)
        } else {
            (self.score + DECAY_PER_DAY * days).min(INITIAL_SCORE)
        }
    }
}

/// Shared handle to the reputation table. Cloning is cheap; all mutations
/// are serialized by the internal lock.
#[derive(Debug, Clone)]
pub struct ReputationStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    dir: PathBuf,
    entries: Mutex<HashMap<NodeId, Entry>>,
}

impl ReputationStore {
    /// Opens the store rooted at `dir`, recovering from the previous
    /// snapshot when one exists. A corrupt snapshot falls back to its
    /// backup; if both are unreadable the store starts empty.
    pub fn load(dir: &Path) -> Self {
        let entries = match read_snapshot(&dir.join(SNAPSHOT_FILE)) {
            Ok(entries) => entries,
            Err(primary_err) => {
                if !matches!(&primary_err, ReputationError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
                {
                    warn!(
                        err = %primary_err,
                        "Could not read reputation snapshot, trying backup"
                    );
                }
                match read_snapshot(&dir.join(SNAPSHOT_BACKUP)) {
                    Ok(entries) => {
                        info!(count = entries.len(), "Recovered reputation from backup");
                        entries
                    }
                    Err(_) => HashMap::new(),
                }
            }
        };

        if !entries.is_empty() {
            debug!(count = entries.len(), "Loaded reputation snapshot");
        }

        Self {
            inner: Arc::new(StoreInner {
                dir: dir.to_path_buf(),
                entries: Mutex::new(entries),
            }),
        }
    }

    /// The decayed score for `node_id`; unknown nodes read as neutral.
    pub fn get(&self, node_id: &NodeId) -> i32 {
        let now = current_unix_millis();
        self.lock_entries()
            .get(node_id)
            .map(|entry| entry.decayed(now))
            .unwrap_or(INITIAL_SCORE)
    }

    /// Sets the score, clamped to `[0, 200]`, and restarts its decay clock.
    pub fn set(&self, node_id: NodeId, score: i32) {
        let entry = Entry {
            score: score.clamp(MIN_SCORE, MAX_SCORE),
            last_update: current_unix_millis(),
        };
        self.lock_entries().insert(node_id, entry);
    }

    /// Applies a delta on top of the decayed score and returns the result.
    pub fn adjust(&self, node_id: NodeId, delta: i32) -> i32 {
        let score = self.get(&node_id).saturating_add(delta);
        self.set(node_id, score);
        score.clamp(MIN_SCORE, MAX_SCORE)
    }

    pub fn size(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn clear(&self) {
        self.lock_entries().clear();
    }

    /// Writes the current table to disk atomically.
    pub async fn save(&self) -> Result<(), ReputationError> {
        let snapshot: Vec<(NodeId, Entry)> = self
            .lock_entries()
            .iter()
            .map(|(id, entry)| (*id, *entry))
            .collect();
        let dir = self.inner.dir.clone();

        tokio::task::spawn_blocking(move || write_snapshot(&dir, &snapshot))
            .await
            .map_err(|_| ReputationError::SaveTaskGone)?
    }

    /// Spawns the periodic save task. It flushes once more on shutdown,
    /// which is the `stop()` save required of the store.
    pub fn spawn_saver(
        &self,
        tracker: &TaskTracker,
        cancel: CancellationToken,
        interval_ms: u64,
    ) {
        let store = self.clone();
        tracker.spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            // The immediate first tick would save what we just loaded.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = store.save().await {
                            // Absorb and retry on the next cycle.
                            error!(err = %e, "Periodic reputation save failed");
                        }
                    }
                    _ = cancel.cancelled() => {
                        if let Err(e) = store.save().await {
                            error!(err = %e, "Final reputation save failed");
                        }
                        break;
                    }
                }
            }
        });
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<NodeId, Entry>> {
        match self.inner.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn read_snapshot(path: &Path) -> Result<HashMap<NodeId, Entry>, ReputationError> {
    let raw = fs::read(path)?;
    let decoder = Decoder::new(&raw);

    let (magic, decoder): (u32, _) = decoder.decode_field("magic")?;
    if magic != SNAPSHOT_MAGIC {
        return Err(ReputationError::Corrupt("bad magic".into()));
    }
    let (version, decoder): (u16, _) = decoder.decode_field("version")?;
    if version != SNAPSHOT_VERSION {
        return Err(ReputationError::Corrupt(format!(
            "unsupported snapshot version {version}"
        )));
    }
    let (count, mut decoder): (u32, _) = decoder.decode_field("count")?;

    let mut entries = HashMap::new();
    for _ in 0..count {
        let (id_len, rest): (u16, _) = decoder.decode_field("id_len")?;
        if id_len as usize != NodeId::len_bytes() {
            return Err(ReputationError::Corrupt(format!(
                "unexpected node id length {id_len}"
            )));
        }
        let (id, rest): (NodeId, _) = rest.decode_field("id")?;
        let (score, rest): (i16, _) = rest.decode_field("score")?;
        let (last_update, rest): (i64, _) = rest.decode_field("timestamp")?;
        decoder = rest;

        entries.insert(
            id,
            Entry {
                score: (score as i32).clamp(MIN_SCORE, MAX_SCORE),
                last_update: last_update.max(0) as u64,
            },
        );
    }
    decoder.finish()?;

    Ok(entries)
}

fn write_snapshot(dir: &Path, entries: &[(NodeId, Entry)]) -> Result<(), ReputationError> {
    fs::create_dir_all(dir)?;

    let mut buf = Vec::with_capacity(10 + entries.len() * 32);
    let mut encoder = Encoder::new(&mut buf)
        .encode_field(&SNAPSHOT_MAGIC)
        .encode_field(&SNAPSHOT_VERSION)
        .encode_field(&(entries.len() as u32));
    for (id, entry) in entries {
        encoder = encoder
            .encode_field(&(NodeId::len_bytes() as u16))
            .encode_field(id)
            .encode_field(&(entry.score as i16))
            .encode_field(&(entry.last_update as i64));
    }
    encoder.finish();

    let tmp_path = dir.join(SNAPSHOT_TMP);
    let dat_path = dir.join(SNAPSHOT_FILE);
    let bak_path = dir.join(SNAPSHOT_BACKUP);

    let mut tmp = fs::File::create(&tmp_path)?;
    tmp.write_all(&buf)?;
    tmp.sync_all()?;
    drop(tmp);

    if dat_path.exists() {
        fs::rename(&dat_path, &bak_path)?;
    }
    fs::rename(&tmp_path, &dat_path)?;

    debug!(count = entries.len(), "Saved reputation snapshot");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(last: u8) -> NodeId {
        let mut raw = [0u8; 20];
        raw[19] = last;
        NodeId::from_slice(&raw)
    }

    #[test]
    fn dead_threshold_is_exclusive() {
        assert!(is_dead_score(19));
        assert!(!is_dead_score(20));
        assert!(!is_dead_score(100));
    }

    #[test]
    fn unknown_nodes_are_neutral() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReputationStore::load(dir.path());
        assert_eq!(store.get(&id(1)), INITIAL_SCORE);
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn set_clamps_to_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReputationStore::load(dir.path());

        store.set(id(1), 1000);
        assert_eq!(store.get(&id(1)), MAX_SCORE);
        store.set(id(1), -50);
        assert_eq!(store.get(&id(1)), MIN_SCORE);

        store.clear();
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn adjust_moves_relative_to_current() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReputationStore::load(dir.path());
        assert_eq!(store.adjust(id(2), 5), 105);
        assert_eq!(store.adjust(id(2), -10), 95);
    }

    #[test]
    fn reads_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReputationStore::load(dir.path());
        store.set(id(3), 150);
        assert_eq!(store.get(&id(3)), store.get(&id(3)));
    }

    #[test]
    fn decay_moves_toward_neutral_and_never_crosses() {
        let high = Entry {
            score: 130,
            last_update: 0,
        };
        assert_eq!(high.decayed(0), 130);
        assert_eq!(high.decayed(DAY_MS), 125);
        assert_eq!(high.decayed(3 * DAY_MS), 115);
        // 6 days would overshoot; it clamps at neutral instead.
        assert_eq!(high.decayed(10 * DAY_MS), 100);

        let low = Entry {
            score: 40,
            last_update: 0,
        };
        assert_eq!(low.decayed(2 * DAY_MS), 50);
        assert_eq!(low.decayed(100 * DAY_MS), 100);

        // Partial days do nothing.
        assert_eq!(high.decayed(DAY_MS - 1), 130);
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReputationStore::load(dir.path());
        for i in 0..42u8 {
            store.set(id(i), 50 + i as i32);
        }
        store.save().await.unwrap();

        let reloaded = ReputationStore::load(dir.path());
        assert_eq!(reloaded.size(), 42);
        for i in 0..42u8 {
            assert_eq!(reloaded.get(&id(i)), 50 + i as i32);
        }
    }

    #[tokio::test]
    async fn corrupt_snapshot_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReputationStore::load(dir.path());
        store.set(id(9), 160);
        store.save().await.unwrap();
        // A second save rotates the good snapshot into the backup slot.
        store.save().await.unwrap();

        fs::write(dir.path().join(SNAPSHOT_FILE), b"garbage").unwrap();

        let reloaded = ReputationStore::load(dir.path());
        assert_eq!(reloaded.get(&id(9)), 160);
    }

    #[tokio::test]
    async fn unreadable_snapshots_start_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(dir.path().join(SNAPSHOT_FILE), b"junk").unwrap();
        fs::write(dir.path().join(SNAPSHOT_BACKUP), b"more junk").unwrap();

        let store = ReputationStore::load(dir.path());
        assert_eq!(store.size(), 0);
    }
}
