//! Append-only persistence for ledger entries.
//!
//! Backends expose appends and reads only; there is no update or delete
//! in the trait or on either implementation.

use crate::error::{NuError, NuResult};
use crate::types::{LedgerEntry, NuPair, Operation};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

/// Schema version recorded in the `meta` table of durable ledgers.
pub const SCHEMA_VERSION: i64 = 1;

/// Uniform append/read interface over ledger persistence.
pub trait StorageBackend: Send + Sync {
    /// Short name used in logs and storage errors.
    fn name(&self) -> &'static str;

    /// Persist one entry. On error nothing is stored.
    fn append(&mut self, entry: &LedgerEntry) -> NuResult<()>;

    /// Persist several entries as a unit. On error none of them is stored.
    fn append_batch(&mut self, entries: &[LedgerEntry]) -> NuResult<()> {
        for entry in entries {
            self.append(entry)?;
        }
        Ok(())
    }

    /// All entries in append order.
    fn get_all(&self) -> NuResult<Vec<LedgerEntry>>;

    fn get(&self, op_id: &Uuid) -> NuResult<Option<LedgerEntry>>;
}

/// Volatile backend for tests and short-lived ledgers.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Vec<LedgerEntry>,
    index: HashMap<Uuid, usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StorageBackend for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn append(&mut self, entry: &LedgerEntry) -> NuResult<()> {
        self.append_batch(std::slice::from_ref(entry))
    }

    fn append_batch(&mut self, entries: &[LedgerEntry]) -> NuResult<()> {
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in entries {
            if self.index.contains_key(&entry.op_id()) || !seen.insert(entry.op_id()) {
                return Err(duplicate(self.name(), entry));
            }
        }
        for entry in entries {
            self.index.insert(entry.op_id(), self.entries.len());
            self.entries.push(entry.clone());
        }
        Ok(())
    }

    fn get_all(&self) -> NuResult<Vec<LedgerEntry>> {
        Ok(self.entries.clone())
    }

    fn get(&self, op_id: &Uuid) -> NuResult<Option<LedgerEntry>> {
        Ok(self.index.get(op_id).map(|&i| self.entries[i].clone()))
    }
}

fn duplicate(backend: &str, entry: &LedgerEntry) -> NuError {
    NuError::Storage {
        backend: backend.to_string(),
        message: format!("duplicate op_id {}", entry.op_id()),
    }
}

/// Durable backend on an embedded SQLite database.
///
/// Floats are stored by bit pattern so NaN and the infinities survive a
/// round trip unchanged.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

const ENTRY_COLUMNS: &str = "timestamp, op_id, parent_id, operation, inputs, \
     output_nominal, output_uncertainty, coverage, invariant_passed, signature";

impl SqliteStorage {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> NuResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> NuResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> NuResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> NuResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| NuError::LockPoisoned {
            resource: "sqlite connection".to_string(),
        })
    }
}

impl StorageBackend for SqliteStorage {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn append(&mut self, entry: &LedgerEntry) -> NuResult<()> {
        let conn = self.lock()?;
        insert_entry(&conn, entry)
    }

    fn append_batch(&mut self, entries: &[LedgerEntry]) -> NuResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for entry in entries {
            insert_entry(&tx, entry)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_all(&self) -> NuResult<Vec<LedgerEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM entries ORDER BY seq",
            ENTRY_COLUMNS
        ))?;
        let rows = stmt.query_map([], read_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    fn get(&self, op_id: &Uuid) -> NuResult<Option<LedgerEntry>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM entries WHERE op_id = ?1", ENTRY_COLUMNS),
                params![op_id.to_string()],
                read_row,
            )
            .optional()?;
        row.map(StoredRow::into_entry).transpose()
    }
}

fn init_schema(conn: &Connection) -> NuResult<()> {
    conn.execute_batch(
        "BEGIN;
        CREATE TABLE IF NOT EXISTS meta(version INTEGER NOT NULL);
        CREATE TABLE IF NOT EXISTS entries(
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp INTEGER NOT NULL UNIQUE,
            op_id TEXT NOT NULL UNIQUE,
            parent_id TEXT,
            operation TEXT NOT NULL,
            inputs BLOB NOT NULL,
            output_nominal INTEGER NOT NULL,
            output_uncertainty INTEGER NOT NULL,
            coverage INTEGER NOT NULL,
            invariant_passed INTEGER NOT NULL,
            signature BLOB NOT NULL
        );
        COMMIT;",
    )?;
    let existing: Option<i64> = conn
        .query_row("SELECT version FROM meta LIMIT 1", [], |row| row.get(0))
        .optional()?;
    match existing {
        Some(current) if current == SCHEMA_VERSION => Ok(()),
        Some(current) => Err(NuError::Storage {
            backend: "sqlite".to_string(),
            message: format!(
                "ledger schema {} incompatible with expected {}",
                current, SCHEMA_VERSION
            ),
        }),
        None => {
            conn.execute("INSERT INTO meta(version) VALUES (?1)", params![SCHEMA_VERSION])?;
            Ok(())
        }
    }
}

fn insert_entry(conn: &Connection, entry: &LedgerEntry) -> NuResult<()> {
    let timestamp = i64::try_from(entry.timestamp()).map_err(|_| NuError::Storage {
        backend: "sqlite".to_string(),
        message: format!("timestamp {} exceeds column range", entry.timestamp()),
    })?;
    let output = entry.output();
    conn.execute(
        "INSERT INTO entries(timestamp, op_id, parent_id, operation, inputs, \
         output_nominal, output_uncertainty, coverage, invariant_passed, signature) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            timestamp,
            entry.op_id().to_string(),
            entry.parent_id().map(|p| p.to_string()),
            entry.operation().as_str(),
            encode_pairs(entry.inputs()),
            float_bits(output.nominal),
            float_bits(output.uncertainty),
            float_bits(entry.coverage()),
            entry.invariant_passed(),
            entry.signature(),
        ],
    )?;
    Ok(())
}

struct StoredRow {
    timestamp: i64,
    op_id: String,
    parent_id: Option<String>,
    operation: String,
    inputs: Vec<u8>,
    output_nominal: i64,
    output_uncertainty: i64,
    coverage: i64,
    invariant_passed: bool,
    signature: Vec<u8>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<StoredRow> {
    Ok(StoredRow {
        timestamp: row.get(0)?,
        op_id: row.get(1)?,
        parent_id: row.get(2)?,
        operation: row.get(3)?,
        inputs: row.get(4)?,
        output_nominal: row.get(5)?,
        output_uncertainty: row.get(6)?,
        coverage: row.get(7)?,
        invariant_passed: row.get(8)?,
        signature: row.get(9)?,
    })
}

impl StoredRow {
    fn into_entry(self) -> NuResult<LedgerEntry> {
        let timestamp = u64::try_from(self.timestamp).map_err(|_| corrupt("negative timestamp"))?;
        let op_id = parse_uuid(&self.op_id)?;
        let parent_id = self.parent_id.as_deref().map(parse_uuid).transpose()?;
        Ok(LedgerEntry::from_parts(
            timestamp,
            op_id,
            parent_id,
            Operation::parse(&self.operation),
            decode_pairs(&self.inputs)?,
            NuPair::new(
                float_from_bits(self.output_nominal),
                float_from_bits(self.output_uncertainty),
            ),
            float_from_bits(self.coverage),
            self.invariant_passed,
            self.signature,
        ))
    }
}

fn parse_uuid(s: &str) -> NuResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| corrupt(&format!("bad uuid '{}': {}", s, e)))
}

fn corrupt(message: &str) -> NuError {
    NuError::Storage {
        backend: "sqlite".to_string(),
        message: format!("corrupt row: {}", message),
    }
}

fn float_bits(value: f64) -> i64 {
    value.to_bits() as i64
}

fn float_from_bits(bits: i64) -> f64 {
    f64::from_bits(bits as u64)
}

fn encode_pairs(pairs: &[NuPair]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(pairs.len() * 16);
    for pair in pairs {
        buf.extend_from_slice(&pair.nominal.to_bits().to_be_bytes());
        buf.extend_from_slice(&pair.uncertainty.to_bits().to_be_bytes());
    }
    buf
}

fn decode_pairs(bytes: &[u8]) -> NuResult<Vec<NuPair>> {
    if bytes.len() % 16 != 0 {
        return Err(corrupt("inputs blob length is not a multiple of 16"));
    }
    Ok(bytes
        .chunks_exact(16)
        .map(|chunk| {
            let mut nominal = [0u8; 8];
            let mut uncertainty = [0u8; 8];
            nominal.copy_from_slice(&chunk[..8]);
            uncertainty.copy_from_slice(&chunk[8..]);
            NuPair::new(
                f64::from_bits(u64::from_be_bytes(nominal)),
                f64::from_bits(u64::from_be_bytes(uncertainty)),
            )
        })
        .collect())
}
