use std::fmt;
use std::path::Path;
use anyhow::Context;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use shared::types::{Destination, Group, HistoryEntry, Hop};
use crate::error::{HistoryError, Result};

const DESTINATION_COLUMNS: &str = "id, name, address, group_id, created_at";
const GROUP_COLUMNS: &str = "id, name, created_at";
const HISTORY_COLUMNS: &str = "h.id, h.destination_id, h.captured_at, h.hops, h.fingerprint, h.raw";

/// Lookup by identifier or by unique name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key<'a> {
    Id(i64),
    Name(&'a str),
}

impl fmt::Display for Key<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Id(id) => write!(f, "{}", id),
            Key::Name(name) => write!(f, "named {:?}", name),
        }
    }
}

/// Offset pagination. `limit: None` is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    pub skip: u32,
    pub limit: Option<u32>,
}

impl Page {
    pub fn new(skip: u32, limit: Option<u32>) -> Self {
        Self { skip, limit }
    }

    fn sql_limit(&self) -> i64 {
        self.limit.map(i64::from).unwrap_or(-1)
    }
}

/// History selection. Both filters set means entries of that destination
/// only if it belongs to that group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryFilter {
    pub destination_id: Option<i64>,
    pub group_id: Option<i64>,
}

/// A capture accepted by the pipeline, not yet persisted.
#[derive(Debug, Clone)]
pub struct NewEntry<'a> {
    pub destination_id: i64,
    pub hops: &'a [Hop],
    pub fingerprint: &'a str,
    pub raw: &'a str,
    pub captured_at: DateTime<Utc>,
}

/// Current time at the precision the store keeps.
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Registry and history tables behind one SQLite connection.
/// The connection lock is held for a single operation only.
pub struct HistoryDb {
    conn: Mutex<Connection>,
}

impl HistoryDb {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("Failed to configure database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS destination_groups (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT NOT NULL UNIQUE,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS destinations (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT NOT NULL UNIQUE,
                address     TEXT NOT NULL,
                group_id    INTEGER REFERENCES destination_groups(id) ON DELETE SET NULL,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS history (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                destination_id  INTEGER NOT NULL REFERENCES destinations(id) ON DELETE CASCADE,
                captured_at     TEXT NOT NULL,
                hops            TEXT NOT NULL,
                fingerprint     TEXT NOT NULL,
                raw             TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_destinations_group ON destinations(group_id);
            CREATE INDEX IF NOT EXISTS idx_history_destination ON history(destination_id, captured_at, id);
            CREATE INDEX IF NOT EXISTS idx_history_captured ON history(captured_at, id);
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    // -- groups --------------------------------------------------------------

    pub fn create_group(&self, name: &str, created_at: DateTime<Utc>) -> Result<Group> {
        let name = validate_name("group", name)?;
        let created_at = created_at.trunc_subsecs(6);

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if find_group(&tx, Key::Name(&name))?.is_some() {
            return Err(HistoryError::Conflict(format!("group named {:?}", name)));
        }

        tx.execute(
            "INSERT INTO destination_groups (name, created_at) VALUES (?1, ?2)",
            params![&name, format_ts(&created_at)],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(Group { id, name, created_at })
    }

    pub fn get_group(&self, key: Key<'_>) -> Result<Group> {
        let conn = self.conn.lock();
        find_group(&conn, key)?.ok_or_else(|| HistoryError::NotFound(format!("group {}", key)))
    }

    pub fn list_groups(&self, page: Page) -> Result<Vec<Group>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM destination_groups ORDER BY id LIMIT ?1 OFFSET ?2",
            GROUP_COLUMNS
        ))?;

        let groups = stmt
            .query_map(params![page.sql_limit(), page.skip], row_to_group)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(groups)
    }

    /// Removes a group and clears the membership of its destinations.
    /// Returns how many destinations were released.
    pub fn delete_group(&self, id: i64) -> Result<u64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if find_group(&tx, Key::Id(id))?.is_none() {
            return Err(HistoryError::NotFound(format!("group {}", id)));
        }

        let released = tx.execute(
            "UPDATE destinations SET group_id = NULL WHERE group_id = ?1",
            params![id],
        )?;
        tx.execute("DELETE FROM destination_groups WHERE id = ?1", params![id])?;
        tx.commit()?;

        Ok(released as u64)
    }

    // -- destinations --------------------------------------------------------

    pub fn create_destination(
        &self,
        name: &str,
        address: &str,
        group_id: Option<i64>,
        created_at: DateTime<Utc>,
    ) -> Result<Destination> {
        let name = validate_name("destination", name)?;
        let address = validate_address(address)?;
        let created_at = created_at.trunc_subsecs(6);

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if find_destination(&tx, Key::Name(&name))?.is_some() {
            return Err(HistoryError::Conflict(format!("destination named {:?}", name)));
        }
        if let Some(group_id) = group_id {
            if find_group(&tx, Key::Id(group_id))?.is_none() {
                return Err(HistoryError::NotFound(format!("group {}", group_id)));
            }
        }

        tx.execute(
            "INSERT INTO destinations (name, address, group_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![&name, &address, group_id, format_ts(&created_at)],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(Destination {
            id,
            name,
            address,
            group_id,
            created_at,
        })
    }

    pub fn get_destination(&self, key: Key<'_>) -> Result<Destination> {
        let conn = self.conn.lock();
        find_destination(&conn, key)?
            .ok_or_else(|| HistoryError::NotFound(format!("destination {}", key)))
    }

    pub fn list_destinations(&self, page: Page) -> Result<Vec<Destination>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM destinations ORDER BY id LIMIT ?1 OFFSET ?2",
            DESTINATION_COLUMNS
        ))?;

        let destinations = stmt
            .query_map(params![page.sql_limit(), page.skip], row_to_destination)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(destinations)
    }

    /// Deletes a destination and all of its history.
    /// Returns how many history entries went with it.
    pub fn delete_destination(&self, id: i64) -> Result<u64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if find_destination(&tx, Key::Id(id))?.is_none() {
            return Err(HistoryError::NotFound(format!("destination {}", id)));
        }

        let removed = tx.execute("DELETE FROM history WHERE destination_id = ?1", params![id])?;
        tx.execute("DELETE FROM destinations WHERE id = ?1", params![id])?;
        tx.commit()?;

        Ok(removed as u64)
    }

    // -- history -------------------------------------------------------------

    /// Most recent entry for a destination, `None` if nothing was ever stored
    /// (or the destination does not exist).
    pub fn latest(&self, destination_id: i64) -> Result<Option<HistoryEntry>> {
        let conn = self.conn.lock();
        latest_entry(&conn, destination_id)
    }

    /// Persists a new entry. Fails if the destination is gone or the
    /// timestamp is earlier than the current latest entry.
    pub fn append(&self, entry: NewEntry<'_>) -> Result<HistoryEntry> {
        let captured_at = entry.captured_at.trunc_subsecs(6);
        let hops_json = serde_json::to_string(entry.hops)
            .map_err(|e| HistoryError::Serialization(e.to_string()))?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if find_destination(&tx, Key::Id(entry.destination_id))?.is_none() {
            return Err(HistoryError::NotFound(format!("destination {}", entry.destination_id)));
        }
        if let Some(latest) = latest_entry(&tx, entry.destination_id)? {
            if captured_at < latest.captured_at {
                return Err(HistoryError::OutOfOrder {
                    destination_id: entry.destination_id,
                    latest: latest.captured_at,
                    attempted: captured_at,
                });
            }
        }

        tx.execute(
            "INSERT INTO history (destination_id, captured_at, hops, fingerprint, raw)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.destination_id,
                format_ts(&captured_at),
                &hops_json,
                entry.fingerprint,
                entry.raw,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(HistoryEntry {
            id,
            destination_id: entry.destination_id,
            captured_at,
            hops: entry.hops.to_vec(),
            fingerprint: entry.fingerprint.to_string(),
            raw: entry.raw.to_string(),
        })
    }

    /// Entries in capture order. Referenced destination/group must exist.
    pub fn list_history(&self, filter: HistoryFilter, page: Page) -> Result<Vec<HistoryEntry>> {
        let conn = self.conn.lock();

        let mut clauses = Vec::new();
        let mut args: Vec<i64> = Vec::new();

        if let Some(destination_id) = filter.destination_id {
            if find_destination(&conn, Key::Id(destination_id))?.is_none() {
                return Err(HistoryError::NotFound(format!("destination {}", destination_id)));
            }
            clauses.push("h.destination_id = ?");
            args.push(destination_id);
        }
        if let Some(group_id) = filter.group_id {
            if find_group(&conn, Key::Id(group_id))?.is_none() {
                return Err(HistoryError::NotFound(format!("group {}", group_id)));
            }
            clauses.push("d.group_id = ?");
            args.push(group_id);
        }

        let mut sql = format!(
            "SELECT {} FROM history h JOIN destinations d ON d.id = h.destination_id",
            HISTORY_COLUMNS
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY h.captured_at, h.id LIMIT ? OFFSET ?");
        args.push(page.sql_limit());
        args.push(i64::from(page.skip));

        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params_from_iter(args.iter()), row_to_history)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }
}

fn find_group(conn: &Connection, key: Key<'_>) -> Result<Option<Group>> {
    let group = match key {
        Key::Id(id) => conn.query_row(
            &format!("SELECT {} FROM destination_groups WHERE id = ?1", GROUP_COLUMNS),
            params![id],
            row_to_group,
        ),
        Key::Name(name) => conn.query_row(
            &format!("SELECT {} FROM destination_groups WHERE name = ?1", GROUP_COLUMNS),
            params![name],
            row_to_group,
        ),
    }
    .optional()?;

    Ok(group)
}

fn find_destination(conn: &Connection, key: Key<'_>) -> Result<Option<Destination>> {
    let destination = match key {
        Key::Id(id) => conn.query_row(
            &format!("SELECT {} FROM destinations WHERE id = ?1", DESTINATION_COLUMNS),
            params![id],
            row_to_destination,
        ),
        Key::Name(name) => conn.query_row(
            &format!("SELECT {} FROM destinations WHERE name = ?1", DESTINATION_COLUMNS),
            params![name],
            row_to_destination,
        ),
    }
    .optional()?;

    Ok(destination)
}

fn latest_entry(conn: &Connection, destination_id: i64) -> Result<Option<HistoryEntry>> {
    let entry = conn
        .query_row(
            &format!(
                "SELECT {} FROM history h WHERE h.destination_id = ?1
                 ORDER BY h.captured_at DESC, h.id DESC LIMIT 1",
                HISTORY_COLUMNS
            ),
            params![destination_id],
            row_to_history,
        )
        .optional()?;

    Ok(entry)
}

fn validate_name(kind: &str, name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(HistoryError::InvalidInput(format!("{} name must not be empty", kind)));
    }
    Ok(name.to_string())
}

fn validate_address(address: &str) -> Result<String> {
    let address = address.trim();
    if address.is_empty() || address.chars().any(char::is_whitespace) {
        return Err(HistoryError::InvalidInput(format!(
            "{:?} is not a hostname or IP address",
            address
        )));
    }
    Ok(address.to_string())
}

/// Fixed-width RFC 3339 so that text order is time order
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, value: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_group(row: &rusqlite::Row) -> Result<Group, rusqlite::Error> {
    let created_at: String = row.get(2)?;
    Ok(Group {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: parse_ts(2, &created_at)?,
    })
}

fn row_to_destination(row: &rusqlite::Row) -> Result<Destination, rusqlite::Error> {
    let created_at: String = row.get(4)?;
    Ok(Destination {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        group_id: row.get(3)?,
        created_at: parse_ts(4, &created_at)?,
    })
}

fn row_to_history(row: &rusqlite::Row) -> Result<HistoryEntry, rusqlite::Error> {
    let captured_at: String = row.get(2)?;
    let hops_json: String = row.get(3)?;

    let hops = serde_json::from_str(&hops_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(HistoryEntry {
        id: row.get(0)?,
        destination_id: row.get(1)?,
        captured_at: parse_ts(2, &captured_at)?,
        hops,
        fingerprint: row.get(4)?,
        raw: row.get(5)?,
    })
}
