//{{ Paymaster }}
//Copyright (C) {{ 2021,2022,2023,2024 }}  {{ Blockstream }}

//This program is free software: you can redistribute it and/or modify
//it under the terms of the GNU Affero General Public License as published by
//the Free Software Foundation, either version 3 of the License, or
//(at your option) any later version.

//This program is distributed in the hope that it will be useful,
//but WITHOUT ANY WARRANTY; without even the implied warranty of
//MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//GNU Affero General Public License for more details.

//You should have received a copy of the GNU Affero General Public License
//along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! # Completion Journal
//!
//! The local authoritative record of "payment X has been paid (in full)
//! by transaction Y". An entry is written after the node accepts the
//! final contributing transaction and before the pool is notified; its
//! presence guarantees the payment is never processed again, across any
//! number of restarts.
//!
//! The on-disk form is one self-describing JSON record per line so that
//! operators can read and grep it. Every mutation rewrites the file
//! atomically (sibling, fsync, rename); the write has returned to the
//! caller only once the entry is on stable storage.
//!

use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::sync::Mutex;
use std::{error, fmt, fs, io};

use bitcoin;
use bitcoin::Amount;
use bitcoin::util::amount::Denomination;
use serde_json;
use time;

use common::PaymentId;
use utils;

/// Journal error.
#[derive(Debug)]
pub enum Error {
    /// Asked to record a second, different transaction for a payment
    /// that is already complete.
    Conflict {
        /// The payment in question
        payment_id: PaymentId,
        /// The transaction already on record
        existing: bitcoin::Txid,
        /// The transaction that was refused
        proposed: bitcoin::Txid,
    },
    /// The journal file exists but cannot be parsed.
    Corrupt {
        /// 1-based line number of the bad record
        line: usize,
        /// The parse error
        error: serde_json::Error,
    },
    /// Filesystem failure; the affected entry is not durable.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Conflict { payment_id, ref existing, ref proposed } => write!(
                f, "payment {} already completed by {}, refusing {}",
                payment_id, existing, proposed,
            ),
            Error::Corrupt { line, ref error } => {
                write!(f, "journal line {}: {}", line, error)
            }
            Error::Io(ref e) => write!(f, "journal io: {}", e),
        }
    }
}

impl error::Error for Error {
    fn cause(&self) -> Option<&dyn error::Error> {
        match *self {
            Error::Conflict { .. } => None,
            Error::Corrupt { ref error, .. } => Some(error),
            Error::Io(ref e) => Some(e),
        }
    }
}

#[doc(hidden)]
impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

/// One completed payment on record.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct Entry {
    /// The payment that completed
    #[serde(rename = "paymentId")]
    pub payment_id: PaymentId,
    /// The transaction that brought the payment to completion; when
    /// several contributed, the final one
    #[serde(rename = "transactionId")]
    pub transaction_id: bitcoin::Txid,
    /// When the entry was journaled (UTC, RFC 3339)
    #[serde(rename = "completedAt")]
    pub completed_at: String,
}

/// The completion journal. All access is serialized internally; the
/// engine, driver and operational tooling may share one instance.
pub struct Journal {
    /// Path of the backing file.
    path: String,
    /// All entries, keyed by payment id.
    entries: Mutex<BTreeMap<PaymentId, Entry>>,
}

impl Journal {
    /// Open a journal, loading any existing entries. A missing file is an
    /// empty journal. An unparseable file is an error: the journal is the
    /// only record of what has been paid, so it must not be guessed at.
    pub fn open(path: &str) -> Result<Journal, Error> {
        let mut entries = BTreeMap::new();
        match fs::File::open(path) {
            Ok(fh) => {
                let reader = io::BufReader::new(fh);
                for (lineno, line) in reader.lines().enumerate() {
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            slog!(ReadFailed, filename: path, error: e.to_string());
                            return Err(Error::Io(e));
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let entry: Entry = match serde_json::from_str(&line) {
                        Ok(entry) => entry,
                        Err(e) => {
                            slog!(JournalCorrupt, path: path, error: e.to_string());
                            return Err(Error::Corrupt { line: lineno + 1, error: e });
                        }
                    };
                    entries.insert(entry.payment_id, entry);
                }
                slog!(JournalLoaded, path: path, n_entries: entries.len());
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {
                slog!(JournalMissing, path: path, error: e.to_string());
            }
            Err(e) => return Err(Error::Io(e)),
        }
        Ok(Journal {
            path: path.to_owned(),
            entries: Mutex::new(entries),
        })
    }

    /// Whether a payment is on record as completed.
    pub fn is_completed(&self, payment_id: PaymentId) -> bool {
        self.entries.lock().unwrap().contains_key(&payment_id)
    }

    /// The transaction that completed a payment, if on record.
    pub fn transaction_of(&self, payment_id: PaymentId) -> Option<bitcoin::Txid> {
        self.entries.lock().unwrap().get(&payment_id).map(|e| e.transaction_id)
    }

    /// Record a payment as completed by a transaction. Must only be
    /// called once the node has accepted the transaction. When this
    /// returns `Ok` the entry survives process and OS crash. Recording
    /// the same (payment, transaction) pair again is accepted silently;
    /// a different transaction for a completed payment is refused with
    /// [Error::Conflict] and the original entry kept.
    pub fn mark_completed(&self, payment_id: PaymentId, txid: bitcoin::Txid) -> Result<(), Error> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(&payment_id) {
            if existing.transaction_id == txid {
                return Ok(());
            }
            slog!(JournalConflict, payment_id: payment_id,
                existing_txid: existing.transaction_id, proposed_txid: txid,
            );
            return Err(Error::Conflict {
                payment_id: payment_id,
                existing: existing.transaction_id,
                proposed: txid,
            });
        }

        entries.insert(payment_id, Entry {
            payment_id: payment_id,
            transaction_id: txid,
            completed_at: time::now_utc().rfc3339().to_string(),
        });
        if let Err(e) = Journal::save(&self.path, &entries) {
            // The entry did not reach stable storage; forget it so memory
            // and disk stay consistent.
            entries.remove(&payment_id);
            return Err(Error::Io(e));
        }
        slog!(JournalRecorded, payment_id: payment_id, txid: txid);
        Ok(())
    }

    fn save(path: &str, entries: &BTreeMap<PaymentId, Entry>) -> io::Result<()> {
        utils::export_to_file(path, |wr| {
            for entry in entries.values() {
                serde_json::to_writer(&mut *wr, entry)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                writeln!(wr, "")?;
            }
            Ok(())
        })?;
        slog!(JournalSaved, path: path, n_entries: entries.len());
        Ok(())
    }

    /// Number of completed payments on record.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the journal has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of all entries, ordered by payment id. For operational
    /// tooling; not on the hot path.
    pub fn snapshot(&self) -> Vec<Entry> {
        self.entries.lock().unwrap().values().cloned().collect()
    }
}

/// One line of the failed-payment log.
pub struct FailureRecord<'a> {
    /// The payment that did not complete
    pub payment_id: PaymentId,
    /// Its destination address
    pub address: &'a str,
    /// Amount the payment requires in total
    pub required: Amount,
    /// Amount paid toward it in the failed batch
    pub completed: Amount,
    /// Transactions attributed to it in the failed batch
    pub txids: &'a [bitcoin::Txid],
    /// Why it did not complete
    pub reason: &'a str,
}

/// Append-only operator-visible log of payments that did not complete in
/// a batch. Pipe-separated, one line per payment, never read by the
/// engine itself.
pub struct FailureLog {
    /// Path of the backing file.
    path: String,
}

impl FailureLog {
    /// Create a handle; the file is created on first append.
    pub fn new(path: &str) -> FailureLog {
        FailureLog {
            path: path.to_owned(),
        }
    }

    /// Append one record. Failures are logged and swallowed: this log is
    /// operator-visible state, not part of the payment protocol.
    pub fn append(&self, record: &FailureRecord) {
        let remaining = record.required.checked_sub(record.completed)
            .unwrap_or(Amount::ZERO);
        let txids = record.txids.iter()
            .map(|txid| txid.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let line = format!("{}|{}|{}|{}|{}|{}|{}|{}",
            time::now_utc().rfc3339(),
            record.payment_id,
            record.address,
            record.required.to_string_in(Denomination::Bitcoin),
            record.completed.to_string_in(Denomination::Bitcoin),
            remaining.to_string_in(Denomination::Bitcoin),
            txids,
            record.reason,
        );
        match fs::OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(mut fh) => {
                let res = writeln!(fh, "{}", line).and_then(|_| fh.sync_all());
                if let Err(e) = res {
                    slog!(WriteFailed, filename: &self.path, error: e.to_string());
                } else {
                    slog!(FailureRecorded, payment_id: record.payment_id,
                        remaining_sat: remaining.to_sat(),
                    );
                }
            }
            Err(e) => {
                slog!(CreateFailed, filename: &self.path, error: e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use tempfile;

    use super::*;

    fn txid(byte: u8) -> bitcoin::Txid {
        use bitcoin::hashes::Hash;
        bitcoin::Txid::hash(&[byte])
    }

    #[test]
    fn journal_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.db");
        let path = path.to_str().unwrap();

        {
            let journal = Journal::open(path).unwrap();
            assert!(journal.is_empty());
            assert!(!journal.is_completed(42));
            assert_eq!(journal.transaction_of(42), None);

            journal.mark_completed(42, txid(1)).unwrap();
            journal.mark_completed(7, txid(2)).unwrap();
            assert!(journal.is_completed(42));
            assert_eq!(journal.transaction_of(42), Some(txid(1)));
            assert_eq!(journal.len(), 2);
        }

        // a new instance sees the same entries
        let journal = Journal::open(path).unwrap();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal.transaction_of(42), Some(txid(1)));
        assert_eq!(journal.transaction_of(7), Some(txid(2)));

        // snapshot is ordered by payment id
        let snapshot = journal.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].payment_id, 7);
        assert_eq!(snapshot[1].payment_id, 42);
        assert!(!snapshot[0].completed_at.is_empty());

        // the sibling tempfile never survives a completed write
        assert!(!dir.path().join("journal.db.0").exists());
    }

    #[test]
    fn journal_idempotent_and_conflicting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.db");
        let journal = Journal::open(path.to_str().unwrap()).unwrap();

        journal.mark_completed(42, txid(1)).unwrap();
        // same pair again is fine
        journal.mark_completed(42, txid(1)).unwrap();
        assert_eq!(journal.len(), 1);

        // a different txid for the same payment is refused and the
        // original entry kept
        match journal.mark_completed(42, txid(9)) {
            Err(Error::Conflict { payment_id, existing, proposed }) => {
                assert_eq!(payment_id, 42);
                assert_eq!(existing, txid(1));
                assert_eq!(proposed, txid(9));
            }
            other => panic!("expected conflict, got {:?}", other.map(|_| ())),
        }
        assert_eq!(journal.transaction_of(42), Some(txid(1)));
    }

    #[test]
    fn journal_file_is_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.db");
        let journal = Journal::open(path.to_str().unwrap()).unwrap();
        journal.mark_completed(42, txid(1)).unwrap();

        let mut content = String::new();
        fs::File::open(&path).unwrap().read_to_string(&mut content).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);
        let entry: Entry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(entry.payment_id, 42);
        assert_eq!(entry.transaction_id, txid(1));
    }

    #[test]
    fn corrupt_journal_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.db");
        fs::write(&path, "{\"paymentId\":42,\"transactionId\":").unwrap();

        match Journal::open(path.to_str().unwrap()) {
            Err(Error::Corrupt { line, .. }) => assert_eq!(line, 1),
            other => panic!("expected corrupt error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn failure_log_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.log");
        let log = FailureLog::new(path.to_str().unwrap());

        let txids = [txid(1), txid(2)];
        log.append(&FailureRecord {
            payment_id: 100,
            address: "pl1qminer",
            required: Amount::from_sat(35_0000_0000),
            completed: Amount::from_sat(25_0000_0000),
            txids: &txids,
            reason: "batch ended before completion",
        });
        log.append(&FailureRecord {
            payment_id: 101,
            address: "pl1qother",
            required: Amount::from_sat(1_0000_0000),
            completed: Amount::ZERO,
            txids: &[],
            reason: "insufficient balance",
        });

        let mut content = String::new();
        fs::File::open(&path).unwrap().read_to_string(&mut content).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let fields: Vec<&str> = lines[0].split('|').collect();
        assert_eq!(fields.len(), 8);
        assert_eq!(fields[1], "100");
        assert_eq!(fields[2], "pl1qminer");
        assert_eq!(fields[3], "35");
        assert_eq!(fields[4], "25");
        assert_eq!(fields[5], "10");
        assert_eq!(fields[6], format!("{},{}", txid(1), txid(2)));
        assert_eq!(fields[7], "batch ended before completion");

        let fields: Vec<&str> = lines[1].split('|').collect();
        assert_eq!(fields[6], "");
        assert_eq!(fields[7], "insufficient balance");
    }
}
