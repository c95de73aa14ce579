//! Incremental BLOB I/O.
//!
//! Writes reserve a zero-filled value of the declared size and then stream the
//! source into it through a fixed buffer; reads hand out a seekable reader
//! bound to one row's value. Neither direction holds a whole payload in memory.

use std::io::{self, Read, Seek, SeekFrom};

use rusqlite::blob::{Blob, ZeroBlob};
use rusqlite::{params, Connection, DatabaseName, ErrorCode, OptionalExtension};

use crate::error::{Error, Result};

/// Size of the buffer bytes travel through on their way into a blob.
pub const TRANSFER_BUFFER_SIZE: usize = 32 * 1024;

/// SQLite's default maximum length of a single value.
pub const MAX_BLOB_BYTES: u64 = 1_000_000_000;

/// A BLOB column addressed by a text primary key named `id`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlobColumn {
    pub table: &'static str,
    pub column: &'static str,
}

impl BlobColumn {
    /// Replaces the column's value with `size` zero bytes and returns the rowid
    /// the value lives in.
    pub(crate) fn reserve(&self, conn: &Connection, key: &str, size: u64) -> Result<i64> {
        if size > MAX_BLOB_BYTES {
            return Err(kernel::ValidationError::FileTooLarge(size, MAX_BLOB_BYTES).into());
        }
        let len = i32::try_from(size)
            .map_err(|_| kernel::ValidationError::FileTooLarge(size, MAX_BLOB_BYTES))?;
        let sql = format!(
            "UPDATE {} SET {} = ?1 WHERE id = ?2 RETURNING rowid",
            self.table, self.column
        );
        conn.query_row(&sql, params![ZeroBlob(len), key], |row| row.get(0))
            .optional()?
            .ok_or_else(|| self.not_found(key))
    }

    /// Copies `source` into the value reserved at `rowid`. The source must
    /// produce exactly `size` bytes.
    pub(crate) fn write_stream<R: Read + ?Sized>(
        &self,
        conn: &Connection,
        rowid: i64,
        size: u64,
        source: &mut R,
    ) -> Result<u64> {
        let mut blob = conn
            .blob_open(DatabaseName::Main, self.table, self.column, rowid, false)
            .map_err(|e| self.classify(e, &rowid.to_string()))?;
        let mut buf = vec![0u8; TRANSFER_BUFFER_SIZE];
        let mut written: u64 = 0;
        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            let end = written + n as u64;
            if end > size {
                return Err(Error::SizeMismatch {
                    expected: size,
                    actual: end,
                });
            }
            // end <= size <= MAX_BLOB_BYTES, so the offset fits
            blob.write_at(&buf[..n], written as usize)?;
            written = end;
        }
        if written != size {
            return Err(Error::SizeMismatch {
                expected: size,
                actual: written,
            });
        }
        blob.close()?;
        Ok(written)
    }

    /// Opens a read-only handle on the value stored under `key`.
    pub(crate) fn open<'conn>(&self, conn: &'conn Connection, key: &str) -> Result<BlobReader<'conn>> {
        let sql = format!("SELECT rowid FROM {} WHERE id = ?1", self.table);
        let rowid: i64 = conn
            .query_row(&sql, params![key], |row| row.get(0))
            .optional()?
            .ok_or_else(|| self.not_found(key))?;
        let blob = conn
            .blob_open(DatabaseName::Main, self.table, self.column, rowid, true)
            .map_err(|e| self.classify(e, key))?;
        Ok(BlobReader::new(blob))
    }

    /// Runs `consumer` against the value stored under `key`. The handle is
    /// closed when `consumer` returns, whatever the outcome.
    pub(crate) fn with_reader<T, F>(&self, conn: &Connection, key: &str, consumer: F) -> Result<T>
    where
        F: FnOnce(&mut BlobReader<'_>) -> io::Result<T>,
    {
        let mut reader = self.open(conn, key)?;
        let result = consumer(&mut reader);
        drop(reader);
        result.map_err(|e| {
            let vanished = e
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<RowVanished>())
                .is_some();
            if vanished {
                self.not_found(key)
            } else {
                Error::Io(e)
            }
        })
    }

    fn not_found(&self, key: &str) -> Error {
        Error::BlobNotFound {
            table: self.table,
            key: key.to_owned(),
        }
    }

    // The row can vanish between the rowid lookup and the open.
    fn classify(&self, e: rusqlite::Error, key: &str) -> Error {
        match e {
            rusqlite::Error::SqliteFailure(_, Some(ref msg)) if msg.starts_with("no such rowid") => {
                self.not_found(key)
            }
            e => e.into(),
        }
    }
}

/// Seekable reader over one stored value.
///
/// Unlike the raw SQLite handle it allows seeking past the end; reads there
/// return `Ok(0)`. A row deleted while it is being read yields
/// [`io::ErrorKind::NotFound`].
pub struct BlobReader<'conn> {
    blob: Blob<'conn>,
    len: u64,
    pos: u64,
}

impl<'conn> BlobReader<'conn> {
    fn new(blob: Blob<'conn>) -> Self {
        let len = blob.len() as u64;
        Self { blob, len, pos: 0 }
    }

    /// Total length of the value in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl Read for BlobReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len.saturating_sub(self.pos);
        let n = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        if n == 0 {
            return Ok(0);
        }
        // pos < len <= MAX_BLOB_BYTES here
        self.blob
            .read_at_exact(&mut buf[..n], self.pos as usize)
            .map_err(to_io_error)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for BlobReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (base, offset) = match pos {
            SeekFrom::Start(p) => {
                self.pos = p;
                return Ok(p);
            }
            SeekFrom::Current(offset) => (self.pos, offset),
            SeekFrom::End(offset) => (self.len, offset),
        };
        match base.checked_add_signed(offset) {
            Some(p) => {
                self.pos = p;
                Ok(p)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )),
        }
    }
}

/// The row under an open handle was deleted or rewritten.
#[derive(Debug, thiserror::Error)]
#[error("row deleted while being read: {0}")]
struct RowVanished(rusqlite::Error);

fn to_io_error(e: rusqlite::Error) -> io::Error {
    match e {
        rusqlite::Error::SqliteFailure(ref f, _) if f.code == ErrorCode::OperationAborted => {
            io::Error::new(io::ErrorKind::NotFound, RowVanished(e))
        }
        e => io::Error::other(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Cursor;

    const COLUMN: BlobColumn = BlobColumn {
        table: "items",
        column: "data",
    };

    fn connection() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE items (id TEXT PRIMARY KEY, data BLOB NOT NULL DEFAULT X'')",
        )
        .unwrap();
        conn
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn store(conn: &Connection, key: &str, data: &[u8]) {
        conn.execute("INSERT INTO items (id) VALUES (?1)", params![key])
            .unwrap();
        let rowid = COLUMN.reserve(conn, key, data.len() as u64).unwrap();
        COLUMN
            .write_stream(conn, rowid, data.len() as u64, &mut Cursor::new(data))
            .unwrap();
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(TRANSFER_BUFFER_SIZE)]
    #[case(TRANSFER_BUFFER_SIZE + 1)]
    #[case(3 * TRANSFER_BUFFER_SIZE + 17)]
    #[trace]
    fn round_trip(#[case] len: usize) {
        // Arrange
        let conn = connection();
        let data = payload(len);
        store(&conn, "k", &data);

        // Act
        let read = COLUMN
            .with_reader(&conn, "k", |r| {
                let mut out = Vec::new();
                r.read_to_end(&mut out)?;
                Ok(out)
            })
            .unwrap();

        // Assert
        assert_eq!(read, data);
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(12)]
    #[case(13)]
    #[trace]
    fn seek_then_read_remainder(#[case] offset: u64) {
        // Arrange
        let conn = connection();
        let data = b"hello, world!";
        store(&conn, "k", data);

        // Act
        let read = COLUMN
            .with_reader(&conn, "k", |r| {
                r.seek(SeekFrom::Start(offset))?;
                let mut out = Vec::new();
                r.read_to_end(&mut out)?;
                Ok(out)
            })
            .unwrap();

        // Assert
        assert_eq!(read, &data[offset as usize..]);
    }

    #[test]
    fn seek_past_end_reads_nothing() {
        // Arrange
        let conn = connection();
        store(&conn, "k", b"hello, world!");

        // Act
        let (pos, n) = COLUMN
            .with_reader(&conn, "k", |r| {
                let pos = r.seek(SeekFrom::Start(100))?;
                let mut buf = [0u8; 8];
                let n = r.read(&mut buf)?;
                Ok((pos, n))
            })
            .unwrap();

        // Assert
        assert_eq!(pos, 100);
        assert_eq!(n, 0);
    }

    #[test]
    fn seek_relative_to_end_and_current() {
        // Arrange
        let conn = connection();
        store(&conn, "k", b"hello, world!");

        // Act
        let (end_pos, tail, current_pos) = COLUMN
            .with_reader(&conn, "k", |r| {
                let end_pos = r.seek(SeekFrom::End(-1))?;
                let mut tail = String::new();
                r.read_to_string(&mut tail)?;
                let current_pos = r.seek(SeekFrom::Current(-6))?;
                Ok((end_pos, tail, current_pos))
            })
            .unwrap();

        // Assert
        assert_eq!(end_pos, 12);
        assert_eq!(tail, "!");
        assert_eq!(current_pos, 7);
    }

    #[test]
    fn seek_before_start_is_an_error() {
        // Arrange
        let conn = connection();
        store(&conn, "k", b"abc");

        // Act
        let result = COLUMN.with_reader(&conn, "k", |r| r.seek(SeekFrom::End(-4)));

        // Assert
        assert!(matches!(result, Err(Error::Io(e)) if e.kind() == io::ErrorKind::InvalidInput));
    }

    #[test]
    fn read_is_capped_by_remaining_bytes() {
        // Arrange
        let conn = connection();
        store(&conn, "k", b"abc");

        // Act
        let n = COLUMN
            .with_reader(&conn, "k", |r| {
                let mut buf = [0u8; 64];
                r.read(&mut buf)
            })
            .unwrap();

        // Assert
        assert_eq!(n, 3);
    }

    #[test]
    fn missing_key_is_not_found() {
        // Arrange
        let conn = connection();

        // Act
        let result = COLUMN.with_reader(&conn, "nope", |r| Ok(r.len()));

        // Assert
        assert!(matches!(result, Err(ref e) if e.is_not_found()));
    }

    #[test]
    fn reserve_missing_key_is_not_found() {
        // Arrange
        let conn = connection();

        // Act
        let result = COLUMN.reserve(&conn, "nope", 10);

        // Assert
        assert!(matches!(result, Err(ref e) if e.is_not_found()));
    }

    #[test]
    fn reserve_rejects_oversized_values() {
        // Arrange
        let conn = connection();
        conn.execute("INSERT INTO items (id) VALUES ('k')", []).unwrap();

        // Act
        let result = COLUMN.reserve(&conn, "k", MAX_BLOB_BYTES + 1);

        // Assert
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[rstest]
    #[case(b"short".as_slice(), 10, 5)]
    #[case(b"longer than declared".as_slice(), 4, 20)]
    #[trace]
    fn size_mismatch(#[case] data: &[u8], #[case] declared: u64, #[case] actual: u64) {
        // Arrange
        let conn = connection();
        conn.execute("INSERT INTO items (id) VALUES ('k')", []).unwrap();
        let rowid = COLUMN.reserve(&conn, "k", declared).unwrap();

        // Act
        let result = COLUMN.write_stream(&conn, rowid, declared, &mut Cursor::new(data));

        // Assert
        assert!(matches!(
            result,
            Err(Error::SizeMismatch { expected, actual: a }) if expected == declared && a == actual
        ));
    }

    #[test]
    fn consumer_error_still_releases_handle() {
        // Arrange
        let conn = connection();
        store(&conn, "k", b"abc");

        // Act
        let result: Result<()> = COLUMN.with_reader(&conn, "k", |_| Err(io::Error::other("boom")));
        conn.execute("DELETE FROM items WHERE id = 'k'", []).unwrap();

        // Assert
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn consumer_not_found_error_stays_io() {
        // Arrange
        let conn = connection();
        store(&conn, "k", b"abc");

        // Act
        let result: Result<()> = COLUMN.with_reader(&conn, "k", |_| {
            Err(io::Error::new(io::ErrorKind::NotFound, "no such spool file"))
        });

        // Assert
        assert!(matches!(result, Err(Error::Io(ref e)) if e.kind() == io::ErrorKind::NotFound));
    }

    #[test]
    fn row_deleted_mid_read_is_not_found() {
        // Arrange
        let conn = connection();
        store(&conn, "k", b"abcdef");

        // Act
        let result = COLUMN.with_reader(&conn, "k", |r| {
            let mut head = [0u8; 2];
            r.read_exact(&mut head)?;
            conn.execute("DELETE FROM items WHERE id = 'k'", [])
                .map_err(io::Error::other)?;
            let mut rest = Vec::new();
            r.read_to_end(&mut rest)
        });

        // Assert
        assert!(matches!(result, Err(ref e) if e.is_not_found()));
    }

    #[test]
    fn concurrent_handles_on_same_row() {
        // Arrange
        let conn = connection();
        store(&conn, "k", b"abcdef");

        // Act
        let mut first = COLUMN.open(&conn, "k").unwrap();
        let mut second = COLUMN.open(&conn, "k").unwrap();
        let mut a = [0u8; 3];
        let mut b = [0u8; 6];
        first.read_exact(&mut a).unwrap();
        second.read_exact(&mut b).unwrap();

        // Assert
        assert_eq!(&a, b"abc");
        assert_eq!(&b, b"abcdef");
    }
}
