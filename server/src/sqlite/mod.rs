use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};

use crate::domain::Storage;
use crate::error::Result;

mod blob;
mod entries;
mod guest_links;
mod settings;

pub use blob::{BlobReader, MAX_BLOB_BYTES, TRANSFER_BUFFER_SIZE};

const CACHE_SIZE: &str = "4096";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Schema changes, applied in order. The position in this list (starting at 1)
/// is the schema version recorded in `PRAGMA user_version`.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE guest_links (
        id                 TEXT PRIMARY KEY,
        label              TEXT NOT NULL DEFAULT '',
        max_file_bytes     INTEGER,
        max_file_uploads   INTEGER,
        max_file_lifetime  INTEGER NOT NULL,
        creation_time      TEXT NOT NULL,
        expiration_time    TEXT NOT NULL,
        is_disabled        INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE entries (
        id               TEXT PRIMARY KEY,
        guest_link_id    TEXT REFERENCES guest_links(id),
        filename         TEXT NOT NULL,
        note             TEXT,
        content_type     TEXT NOT NULL,
        upload_time      TEXT NOT NULL,
        expiration_time  TEXT NOT NULL,
        contents         BLOB NOT NULL DEFAULT X''
    );

    CREATE INDEX entries_guest_link_ix ON entries(guest_link_id);
    CREATE INDEX entries_expiration_ix ON entries(expiration_time);

    CREATE TABLE downloads (
        entry_id            TEXT NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
        download_timestamp  TEXT NOT NULL,
        client_ip           TEXT NOT NULL DEFAULT '',
        user_agent          TEXT NOT NULL DEFAULT ''
    );

    CREATE INDEX downloads_entry_ix ON downloads(entry_id);

    CREATE TABLE settings (
        id                     INTEGER PRIMARY KEY CHECK (id = 1),
        default_file_lifetime  INTEGER NOT NULL
    );",
];

pub enum Mode {
    ReadWrite,
    ReadOnly,
}

pub struct Sqlite {
    conn: Connection,
}

impl Sqlite {
    pub fn open<P: AsRef<Path>>(path: P, mode: Mode) -> Result<Self> {
        let conn = match mode {
            Mode::ReadWrite => Connection::open(path),
            Mode::ReadOnly => Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY),
        }?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let s = Self { conn };
        s.enable_foreign_keys()?;
        s.assign_cache_size()?;
        Ok(s)
    }

    /// Opens the database at `path`, creating or upgrading its schema first.
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut s = Self::open(path, Mode::ReadWrite)?;
        s.new_database()?;
        Ok(s)
    }

    fn schema_version(&self) -> Result<usize> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;
        Ok(usize::try_from(version).unwrap_or_default())
    }

    fn enable_foreign_keys(&self) -> Result<()> {
        self.pragma_update("foreign_keys", "ON")
    }

    fn assign_cache_size(&self) -> Result<()> {
        self.pragma_update("cache_size", CACHE_SIZE)
    }

    fn pragma_update(&self, name: &str, value: &str) -> Result<()> {
        self.conn.pragma_update(None, name, value)?;
        Ok(())
    }
}

impl Storage for Sqlite {
    fn new_database(&mut self) -> Result<()> {
        self.pragma_update("encoding", "UTF-8")?;
        let journal: String =
            self.conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!("journal mode: {journal}");

        let current = self.schema_version()?;
        tracing::info!("schema version: {current}/{}", MIGRATIONS.len());

        for (ix, migration) in MIGRATIONS.iter().enumerate().skip(current) {
            let version = ix + 1;
            let tx = self.conn.transaction()?;
            tx.execute_batch(migration)?;
            tx.pragma_update(None, "user_version", version)?;
            tx.commit()?;
            tracing::info!("schema version: {version}/{}", MIGRATIONS.len());
        }

        Ok(())
    }
}
