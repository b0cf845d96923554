//! Write-ahead log
//!
//! Every store transaction is appended as one length-prefixed frame group:
//!
//! ```text
//! [len][BeginTx] [len][Op] ... [len][Op] [len][CommitTx]
//! ```
//!
//! followed by a single `sync_data`. On recovery only transactions whose
//! commit marker made it to disk are applied, in log order. A torn frame at
//! the tail (crash mid-append) ends the replay.

use chrono::{DateTime, Utc};
use netscope_core::{CycleRecord, Identity, NodeKind, OrganizationKind, PublicKey, Snapshot};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// One state change inside a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalOp {
    PutNodeSnapshot(Snapshot<NodeKind>),
    PutOrganizationSnapshot(Snapshot<OrganizationKind>),
    PutNodeIdentity(Identity<NodeKind>),
    PutOrganizationIdentity(Identity<OrganizationKind>),
    RecordActivity {
        key: PublicKey,
        seen_at: DateTime<Utc>,
    },
    PutCycle(CycleRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalEntry {
    BeginTx { tx_id: u64, timestamp: i64 },
    Op { tx_id: u64, op: WalOp },
    CommitTx { tx_id: u64 },
}

impl WalEntry {
    pub fn tx_id(&self) -> u64 {
        match self {
            WalEntry::BeginTx { tx_id, .. }
            | WalEntry::Op { tx_id, .. }
            | WalEntry::CommitTx { tx_id } => *tx_id,
        }
    }
}

/// A committed transaction read back from the log.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedTx {
    pub tx_id: u64,
    pub ops: Vec<WalOp>,
}

pub struct WriteAheadLog {
    file: Mutex<File>,
    path: PathBuf,
}

impl WriteAheadLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a whole transaction and sync it to disk.
    pub fn append_tx(&self, tx_id: u64, ops: Vec<WalOp>) -> std::io::Result<u64> {
        let mut entries = Vec::with_capacity(ops.len() + 2);
        entries.push(WalEntry::BeginTx {
            tx_id,
            timestamp: Utc::now().timestamp(),
        });
        entries.extend(ops.into_iter().map(|op| WalEntry::Op { tx_id, op }));
        entries.push(WalEntry::CommitTx { tx_id });

        let mut buffer = Vec::new();
        for entry in &entries {
            let data = bincode::serialize(entry)
                .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
            let len = data.len() as u32;
            buffer.extend_from_slice(&len.to_le_bytes());
            buffer.extend_from_slice(&data);
        }

        let mut file = self.file.lock();
        file.write_all(&buffer)?;
        file.sync_data()?;

        Ok(buffer.len() as u64)
    }

    /// Read every entry in log order. Stops quietly at a torn tail.
    pub fn entries(&self) -> std::io::Result<Vec<WalEntry>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset < bytes.len() {
            if bytes.len() - offset < 4 {
                tracing::warn!(path = %self.path.display(), offset, "torn length prefix at end of WAL");
                break;
            }
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&bytes[offset..offset + 4]);
            let len = u32::from_le_bytes(len_bytes) as usize;
            offset += 4;

            if bytes.len() - offset < len {
                tracing::warn!(path = %self.path.display(), offset, len, "torn entry at end of WAL");
                break;
            }
            let entry: WalEntry = bincode::deserialize(&bytes[offset..offset + len])
                .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
            entries.push(entry);
            offset += len;
        }

        Ok(entries)
    }

    /// Committed transactions in commit order.
    pub fn committed(&self) -> std::io::Result<Vec<CommittedTx>> {
        let mut open: Vec<CommittedTx> = Vec::new();
        let mut committed = Vec::new();

        for entry in self.entries()? {
            match entry {
                WalEntry::BeginTx { tx_id, .. } => open.push(CommittedTx {
                    tx_id,
                    ops: Vec::new(),
                }),
                WalEntry::Op { tx_id, op } => {
                    if let Some(tx) = open.iter_mut().find(|tx| tx.tx_id == tx_id) {
                        tx.ops.push(op);
                    }
                }
                WalEntry::CommitTx { tx_id } => {
                    if let Some(pos) = open.iter().position(|tx| tx.tx_id == tx_id) {
                        committed.push(open.remove(pos));
                    }
                }
            }
        }

        for tx in &open {
            tracing::warn!(tx_id = tx.tx_id, ops = tx.ops.len(), "discarding uncommitted transaction");
        }
        Ok(committed)
    }

    /// Truncate after a checkpoint.
    pub fn truncate(&self) -> std::io::Result<()> {
        let mut file = self.file.lock();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.sync_data()?;
        Ok(())
    }

    pub fn len(&self) -> std::io::Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    pub fn is_empty(&self) -> std::io::Result<bool> {
        Ok(self.len()? == 0)
    }
}
