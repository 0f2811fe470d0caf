use crate::model::DatasetHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

/// Identity of one execution: the transformation revision plus the ordered
/// input dataset hashes. Two tasks with equal fingerprints would produce
/// the same record, so at most one of them may ever execute.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
pub struct Fingerprint(pub String);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn fingerprint(transformation: &str, inputs: &[DatasetHash]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(transformation.as_bytes());
    for input in inputs {
        hasher.update([0u8]);
        hasher.update(input.0.as_bytes());
    }
    Fingerprint(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutput {
    pub name: String,
    pub dataset: DatasetHash,
    pub size: u64,
}

/// The memoization cache entry: what one execution of (transformation,
/// inputs) produced, and whether it succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRecord {
    pub fingerprint: Fingerprint,
    pub transformation: String,
    pub inputs: Vec<DatasetHash>,
    pub outputs: Vec<RecordOutput>,
    pub exit_code: i32,
    pub successful: bool,
    #[serde(default)]
    pub quarantined: bool,
    #[serde(default)]
    pub redacted: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path '{path}': {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse execution record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No record or claim exists for fingerprint '{0}'.")]
    UnknownFingerprint(Fingerprint),
}

pub type Result<T> = std::result::Result<T, RecordError>;

#[derive(Debug, Clone)]
pub enum RecordLookup {
    Absent,
    /// Someone holds the execution claim; the record will appear when they
    /// finish. Observers wait rather than executing.
    InFlight,
    Complete(ExecRecord),
}

#[derive(Debug, Clone)]
pub enum Claim {
    /// The caller won the claim and must execute (then `complete` or
    /// `abandon`).
    Claimed,
    InFlight,
    Complete(ExecRecord),
}

/// The transactional store contract the scheduler needs: atomic
/// create-if-absent keyed by fingerprint, first writer wins.
pub trait RecordStore: Send + Sync {
    /// Claim the right to execute this fingerprint.
    fn begin(&self, fp: &Fingerprint) -> Result<Claim>;

    /// Claim the right to *re*-execute a completed record whose on-disk
    /// outputs have been purged. Returns false if another regeneration is
    /// already in flight.
    fn reclaim(&self, fp: &Fingerprint) -> Result<bool>;

    /// Publish the result and release the claim.
    fn complete(&self, record: ExecRecord) -> Result<()>;

    /// Release a claim without publishing (submission never happened).
    fn abandon(&self, fp: &Fingerprint) -> Result<()>;

    fn lookup(&self, fp: &Fingerprint) -> Result<RecordLookup>;

    fn set_quarantined(&self, fp: &Fingerprint, quarantined: bool) -> Result<()>;
}

/// Filesystem-backed store: one JSON file per record, claims held as
/// `O_EXCL` marker files so two processes cannot both win.
pub struct FsRecordStore {
    root: PathBuf,
}

impl FsRecordStore {
    pub fn open(root: PathBuf) -> Result<Self> {
        fs_err::create_dir_all(&root).map_err(|e| RecordError::PathIo {
            path: root.clone(),
            source: e,
        })?;
        Ok(Self { root })
    }

    fn record_path(&self, fp: &Fingerprint) -> PathBuf {
        self.root.join(format!("{}.json", fp))
    }

    fn claim_path(&self, fp: &Fingerprint) -> PathBuf {
        self.root.join(format!("{}.inflight", fp))
    }

    fn try_claim(&self, fp: &Fingerprint) -> Result<bool> {
        match fs_err::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.claim_path(fp))
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(RecordError::Io(e)),
        }
    }

    fn read_record(&self, fp: &Fingerprint) -> Result<Option<ExecRecord>> {
        match fs_err::read_to_string(self.record_path(fp)) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RecordError::Io(e)),
        }
    }

    fn write_record(&self, record: &ExecRecord) -> Result<()> {
        let path = self.record_path(&record.fingerprint);
        let tmp = self.root.join(format!("{}.json.tmp", record.fingerprint));
        fs_err::write(&tmp, serde_json::to_string_pretty(record)?)?;
        fs_err::rename(&tmp, &path)?;
        Ok(())
    }
}

impl RecordStore for FsRecordStore {
    fn begin(&self, fp: &Fingerprint) -> Result<Claim> {
        if let Some(record) = self.read_record(fp)? {
            if self.claim_path(fp).exists() {
                return Ok(Claim::InFlight);
            }
            return Ok(Claim::Complete(record));
        }
        if self.try_claim(fp)? {
            // The record may have been published between the read and the
            // claim; yield it back rather than executing twice.
            if let Some(record) = self.read_record(fp)? {
                self.abandon(fp)?;
                return Ok(Claim::Complete(record));
            }
            Ok(Claim::Claimed)
        } else {
            Ok(Claim::InFlight)
        }
    }

    fn reclaim(&self, fp: &Fingerprint) -> Result<bool> {
        self.try_claim(fp)
    }

    fn complete(&self, record: ExecRecord) -> Result<()> {
        self.write_record(&record)?;
        self.abandon(&record.fingerprint)
    }

    fn abandon(&self, fp: &Fingerprint) -> Result<()> {
        match fs_err::remove_file(self.claim_path(fp)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RecordError::Io(e)),
        }
    }

    fn lookup(&self, fp: &Fingerprint) -> Result<RecordLookup> {
        if self.claim_path(fp).exists() {
            return Ok(RecordLookup::InFlight);
        }
        match self.read_record(fp)? {
            Some(record) => Ok(RecordLookup::Complete(record)),
            None => Ok(RecordLookup::Absent),
        }
    }

    fn set_quarantined(&self, fp: &Fingerprint, quarantined: bool) -> Result<()> {
        let mut record = self
            .read_record(fp)?
            .ok_or_else(|| RecordError::UnknownFingerprint(fp.clone()))?;
        record.quarantined = quarantined;
        self.write_record(&record)
    }
}

#[derive(Default)]
struct MemoryEntry {
    in_flight: bool,
    record: Option<ExecRecord>,
}

/// Mutex-guarded map with the same claim semantics; used by tests.
#[derive(Default)]
pub struct MemoryRecordStore {
    entries: Mutex<HashMap<Fingerprint, MemoryEntry>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_entries(
    entries: &Mutex<HashMap<Fingerprint, MemoryEntry>>,
) -> std::sync::MutexGuard<'_, HashMap<Fingerprint, MemoryEntry>> {
    match entries.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl RecordStore for MemoryRecordStore {
    fn begin(&self, fp: &Fingerprint) -> Result<Claim> {
        let mut entries = lock_entries(&self.entries);
        let entry = entries.entry(fp.clone()).or_default();
        if entry.in_flight {
            return Ok(Claim::InFlight);
        }
        if let Some(record) = &entry.record {
            return Ok(Claim::Complete(record.clone()));
        }
        entry.in_flight = true;
        Ok(Claim::Claimed)
    }

    fn reclaim(&self, fp: &Fingerprint) -> Result<bool> {
        let mut entries = lock_entries(&self.entries);
        let entry = entries.entry(fp.clone()).or_default();
        if entry.in_flight {
            return Ok(false);
        }
        entry.in_flight = true;
        Ok(true)
    }

    fn complete(&self, record: ExecRecord) -> Result<()> {
        let mut entries = lock_entries(&self.entries);
        let entry = entries.entry(record.fingerprint.clone()).or_default();
        entry.in_flight = false;
        entry.record = Some(record);
        Ok(())
    }

    fn abandon(&self, fp: &Fingerprint) -> Result<()> {
        let mut entries = lock_entries(&self.entries);
        if let Some(entry) = entries.get_mut(fp) {
            entry.in_flight = false;
        }
        Ok(())
    }

    fn lookup(&self, fp: &Fingerprint) -> Result<RecordLookup> {
        let entries = lock_entries(&self.entries);
        match entries.get(fp) {
            None => Ok(RecordLookup::Absent),
            Some(entry) if entry.in_flight => Ok(RecordLookup::InFlight),
            Some(entry) => match &entry.record {
                Some(record) => Ok(RecordLookup::Complete(record.clone())),
                None => Ok(RecordLookup::Absent),
            },
        }
    }

    fn set_quarantined(&self, fp: &Fingerprint, quarantined: bool) -> Result<()> {
        let mut entries = lock_entries(&self.entries);
        let record = entries
            .get_mut(fp)
            .and_then(|e| e.record.as_mut())
            .ok_or_else(|| RecordError::UnknownFingerprint(fp.clone()))?;
        record.quarantined = quarantined;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_for(fp: &Fingerprint) -> ExecRecord {
        ExecRecord {
            fingerprint: fp.clone(),
            transformation: "m-1".into(),
            inputs: vec![DatasetHash("aa".into())],
            outputs: vec![],
            exit_code: 0,
            successful: true,
            quarantined: false,
            redacted: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_fingerprint_is_input_order_sensitive() {
        let a = DatasetHash("aa".into());
        let b = DatasetHash("bb".into());
        let fwd = fingerprint("m-1", &[a.clone(), b.clone()]);
        let rev = fingerprint("m-1", &[b, a]);
        assert_ne!(fwd, rev);
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let inputs = vec![DatasetHash("aa".into())];
        assert_eq!(fingerprint("m-1", &inputs), fingerprint("m-1", &inputs));
        assert_ne!(fingerprint("m-1", &inputs), fingerprint("m-2", &inputs));
    }

    #[test]
    fn test_memory_store_first_claim_wins() {
        let store = MemoryRecordStore::new();
        let fp = fingerprint("m-1", &[]);
        assert!(matches!(store.begin(&fp).unwrap(), Claim::Claimed));
        assert!(matches!(store.begin(&fp).unwrap(), Claim::InFlight));
        store.complete(record_for(&fp)).unwrap();
        assert!(matches!(store.begin(&fp).unwrap(), Claim::Complete(_)));
    }

    #[test]
    fn test_memory_store_abandon_releases_claim() {
        let store = MemoryRecordStore::new();
        let fp = fingerprint("m-1", &[]);
        assert!(matches!(store.begin(&fp).unwrap(), Claim::Claimed));
        store.abandon(&fp).unwrap();
        assert!(matches!(store.begin(&fp).unwrap(), Claim::Claimed));
    }

    #[test]
    fn test_fs_store_claim_and_complete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRecordStore::open(dir.path().to_path_buf()).unwrap();
        let fp = fingerprint("m-1", &[DatasetHash("aa".into())]);

        assert!(matches!(store.lookup(&fp).unwrap(), RecordLookup::Absent));
        assert!(matches!(store.begin(&fp).unwrap(), Claim::Claimed));
        assert!(matches!(store.begin(&fp).unwrap(), Claim::InFlight));
        assert!(matches!(store.lookup(&fp).unwrap(), RecordLookup::InFlight));

        store.complete(record_for(&fp)).unwrap();
        match store.lookup(&fp).unwrap() {
            RecordLookup::Complete(r) => assert!(r.successful),
            other => panic!("expected complete record, got {:?}", other),
        }
    }

    #[test]
    fn test_fs_store_concurrent_claims_yield_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(FsRecordStore::open(dir.path().to_path_buf()).unwrap());
        let fp = fingerprint("m-1", &[]);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let fp = fp.clone();
            handles.push(std::thread::spawn(move || {
                matches!(store.begin(&fp).unwrap(), Claim::Claimed)
            }));
        }
        let winners: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1, "exactly one concurrent claim may win");
    }

    #[test]
    fn test_fs_store_reclaim_for_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRecordStore::open(dir.path().to_path_buf()).unwrap();
        let fp = fingerprint("m-1", &[]);
        assert!(matches!(store.begin(&fp).unwrap(), Claim::Claimed));
        store.complete(record_for(&fp)).unwrap();

        assert!(store.reclaim(&fp).unwrap());
        assert!(!store.reclaim(&fp).unwrap());
        // While regeneration is in flight, begin() must not hand the stale
        // record out for reuse.
        assert!(matches!(store.begin(&fp).unwrap(), Claim::InFlight));
    }

    #[test]
    fn test_set_quarantined_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRecordStore::open(dir.path().to_path_buf()).unwrap();
        let fp = fingerprint("m-1", &[]);
        assert!(matches!(store.begin(&fp).unwrap(), Claim::Claimed));
        store.complete(record_for(&fp)).unwrap();

        store.set_quarantined(&fp, true).unwrap();
        match store.lookup(&fp).unwrap() {
            RecordLookup::Complete(r) => assert!(r.quarantined),
            other => panic!("expected complete record, got {:?}", other),
        }
    }
}
