use std::collections::HashMap;
use std::io::{self, Read};

use chrono::{DateTime, Utc};
use kernel::{
    DownloadRecord, EntryId, EntryMetadata, EntryUpdate, ExpirationTime, FileNote, Filename,
    GuestLink, GuestLinkId, UploadMetadata, ValidationError,
};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};

use super::blob::{BlobColumn, BlobReader, MAX_BLOB_BYTES};
use super::guest_links::find_guest_link;
use super::Sqlite;
use crate::domain::{EntryStore, GuestLinkStore};
use crate::error::{Error, Result};

const CONTENTS: BlobColumn = BlobColumn {
    table: "entries",
    column: "contents",
};

const SELECT_ENTRIES: &str = "
    SELECT
        entries.id,
        entries.filename,
        entries.note,
        entries.content_type,
        entries.upload_time,
        entries.expiration_time,
        LENGTH(entries.contents),
        entries.guest_link_id,
        IFNULL(downloads.download_count, 0)
    FROM
        entries
    LEFT OUTER JOIN
        (
            SELECT entry_id, COUNT(entry_id) AS download_count
            FROM downloads
            GROUP BY entry_id
        ) downloads ON entries.id = downloads.entry_id";

/// Entry as it comes out of the database, before validation.
struct EntryRow {
    id: String,
    filename: String,
    note: Option<String>,
    content_type: String,
    uploaded: DateTime<Utc>,
    expires: DateTime<Utc>,
    size: i64,
    guest_link_id: Option<String>,
    download_count: i64,
}

impl EntryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            filename: row.get(1)?,
            note: row.get(2)?,
            content_type: row.get(3)?,
            uploaded: row.get(4)?,
            expires: row.get(5)?,
            size: row.get(6)?,
            guest_link_id: row.get(7)?,
            download_count: row.get(8)?,
        })
    }

    fn into_metadata(self, guest_link: Option<GuestLink>) -> Result<EntryMetadata> {
        Ok(EntryMetadata {
            id: EntryId::parse(&self.id)?,
            filename: Filename::parse(&self.filename)?,
            note: FileNote::try_from(self.note)?,
            content_type: self.content_type,
            uploaded: self.uploaded,
            expires: ExpirationTime::new(self.expires),
            size: u64::try_from(self.size).unwrap_or_default(),
            guest_link,
            download_count: u64::try_from(self.download_count).unwrap_or_default(),
        })
    }
}

impl EntryStore for Sqlite {
    fn list_entry_metadata(&self) -> Result<Vec<EntryMetadata>> {
        let links: HashMap<String, GuestLink> = self
            .get_guest_links()?
            .into_iter()
            .map(|link| (link.id.as_str().to_owned(), link))
            .collect();

        let sql = format!("{SELECT_ENTRIES} ORDER BY entries.upload_time DESC");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], EntryRow::from_row)?;

        let mut result = Vec::new();
        for row in rows {
            let row = row?;
            let link = row
                .guest_link_id
                .as_deref()
                .and_then(|id| links.get(id))
                .cloned();
            result.push(row.into_metadata(link)?);
        }
        Ok(result)
    }

    fn get_entry_metadata(&self, id: &EntryId) -> Result<EntryMetadata> {
        let sql = format!("{SELECT_ENTRIES} WHERE entries.id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id.as_str()], EntryRow::from_row)
            .optional()?
            .ok_or_else(|| Error::EntryNotFound(id.clone()))?;

        let link = match row.guest_link_id.as_deref() {
            Some(link_id) => Some(self.get_guest_link(&GuestLinkId::parse(link_id)?)?),
            None => None,
        };
        row.into_metadata(link)
    }

    fn insert_entry(&mut self, reader: &mut dyn Read, metadata: &UploadMetadata) -> Result<()> {
        if metadata.size > MAX_BLOB_BYTES {
            return Err(ValidationError::FileTooLarge(metadata.size, MAX_BLOB_BYTES).into());
        }
        tracing::info!("saving new entry {}", metadata.id);

        // Immediate, so the guest link quota can't change between the check
        // and the commit.
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(link_id) = &metadata.guest_link_id {
            // An unknown link is left to the foreign key.
            let link = find_guest_link(&tx, link_id)?;
            if link.is_some_and(|link| !link.is_active_at(metadata.uploaded)) {
                return Err(ValidationError::GuestLinkInactive.into());
            }
        }
        tx.execute(
            "INSERT INTO entries (
                id,
                guest_link_id,
                filename,
                note,
                content_type,
                upload_time,
                expiration_time
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                metadata.id.as_str(),
                metadata.guest_link_id.as_ref().map(GuestLinkId::as_str),
                metadata.filename.as_str(),
                metadata.note.value(),
                metadata.content_type,
                metadata.uploaded,
                metadata.expires.as_datetime(),
            ],
        )?;

        let rowid = CONTENTS.reserve(&tx, metadata.id.as_str(), metadata.size)?;
        let written = CONTENTS.write_stream(&tx, rowid, metadata.size, reader)?;
        tx.commit()?;

        tracing::debug!("wrote {written} bytes for {}", metadata.id);
        Ok(())
    }

    fn read_entry_file<T, F>(&self, id: &EntryId, consumer: F) -> Result<T>
    where
        F: FnOnce(&mut BlobReader<'_>) -> io::Result<T>,
    {
        CONTENTS
            .with_reader(&self.conn, id.as_str(), consumer)
            .map_err(|e| match e {
                Error::BlobNotFound { .. } => Error::EntryNotFound(id.clone()),
                e => e,
            })
    }

    fn update_entry_metadata(&mut self, id: &EntryId, update: &EntryUpdate) -> Result<()> {
        tracing::info!("updating metadata for entry {id}");
        let affected = self.conn.execute(
            "UPDATE entries
            SET
                filename = ?1,
                expiration_time = ?2,
                note = ?3
            WHERE
                id = ?4",
            params![
                update.filename.as_str(),
                update.expires.as_datetime(),
                update.note.value(),
                id.as_str(),
            ],
        )?;
        if affected == 0 {
            return Err(Error::EntryNotFound(id.clone()));
        }
        Ok(())
    }

    fn delete_entry(&mut self, id: &EntryId) -> Result<()> {
        tracing::info!("deleting entry {id}");
        self.conn
            .execute("DELETE FROM entries WHERE id = ?1", params![id.as_str()])?;
        Ok(())
    }

    fn delete_expired_entries(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM entries
            WHERE
                expiration_time <= ?1 AND
                expiration_time <> ?2",
            params![now, ExpirationTime::never().as_datetime()],
        )?;
        tracing::debug!("deleted {deleted} expired entries");
        Ok(deleted)
    }

    fn insert_entry_download(&mut self, id: &EntryId, record: &DownloadRecord) -> Result<()> {
        let result = self.conn.execute(
            "INSERT INTO downloads (
                entry_id,
                download_timestamp,
                client_ip,
                user_agent
            ) VALUES (?1, ?2, ?3, ?4)",
            params![
                id.as_str(),
                record.time,
                record.client_ip,
                record.user_agent,
            ],
        );
        match result.map_err(Error::from) {
            Ok(_) => Ok(()),
            // only the foreign key can fail here
            Err(Error::Constraint(_)) => Err(Error::EntryNotFound(id.clone())),
            Err(e) => Err(e),
        }
    }

    fn get_entry_downloads(&self, id: &EntryId) -> Result<Vec<DownloadRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT download_timestamp, client_ip, user_agent
            FROM downloads
            WHERE entry_id = ?1
            ORDER BY download_timestamp DESC",
        )?;
        let rows = stmt.query_map(params![id.as_str()], |row| {
            Ok(DownloadRecord {
                time: row.get(0)?,
                client_ip: row.get(1)?,
                user_agent: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn compact(&self) -> Result<()> {
        tracing::info!("vacuuming database");
        self.conn.execute_batch("VACUUM")?;
        Ok(())
    }
}
