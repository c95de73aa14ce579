use chrono::{DateTime, Utc};
use kernel::{
    ExpirationTime, FileLifetime, GuestLink, GuestLinkId, GuestLinkLabel, GuestLinkLimits,
    NewGuestLink,
};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::Sqlite;
use crate::domain::GuestLinkStore;
use crate::error::{Error, Result};

const SELECT_GUEST_LINKS: &str = "
    SELECT
        guest_links.id,
        guest_links.label,
        guest_links.max_file_bytes,
        guest_links.max_file_uploads,
        guest_links.max_file_lifetime,
        guest_links.creation_time,
        guest_links.expiration_time,
        guest_links.is_disabled,
        (
            SELECT COUNT(*)
            FROM entries
            WHERE entries.guest_link_id = guest_links.id
        ) AS files_uploaded
    FROM
        guest_links";

struct GuestLinkRow {
    id: String,
    label: String,
    max_file_bytes: Option<i64>,
    max_file_uploads: Option<i64>,
    max_file_lifetime: i64,
    created: DateTime<Utc>,
    url_expires: DateTime<Utc>,
    is_disabled: bool,
    files_uploaded: i64,
}

impl GuestLinkRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            label: row.get(1)?,
            max_file_bytes: row.get(2)?,
            max_file_uploads: row.get(3)?,
            max_file_lifetime: row.get(4)?,
            created: row.get(5)?,
            url_expires: row.get(6)?,
            is_disabled: row.get(7)?,
            files_uploaded: row.get(8)?,
        })
    }

    fn into_guest_link(self) -> Result<GuestLink> {
        let days = u32::try_from(self.max_file_lifetime).unwrap_or(FileLifetime::INFINITE.days());
        Ok(GuestLink {
            id: GuestLinkId::parse(&self.id)?,
            created: self.created,
            limits: GuestLinkLimits {
                label: GuestLinkLabel::parse(&self.label)?,
                url_expires: ExpirationTime::new(self.url_expires),
                max_file_lifetime: FileLifetime::from_days(days)?,
                max_file_bytes: self.max_file_bytes.and_then(|v| u64::try_from(v).ok()),
                max_file_uploads: self.max_file_uploads.and_then(|v| u32::try_from(v).ok()),
            },
            files_uploaded: u32::try_from(self.files_uploaded).unwrap_or(u32::MAX),
            is_disabled: self.is_disabled,
        })
    }
}

/// Reads one link through `conn`, which may be an open transaction.
pub(super) fn find_guest_link(
    conn: &Connection,
    id: &GuestLinkId,
) -> Result<Option<GuestLink>> {
    let sql = format!("{SELECT_GUEST_LINKS} WHERE guest_links.id = ?1");
    conn.query_row(&sql, params![id.as_str()], GuestLinkRow::from_row)
        .optional()?
        .map(GuestLinkRow::into_guest_link)
        .transpose()
}

impl Sqlite {
    fn set_guest_link_disabled(&mut self, id: &GuestLinkId, disabled: bool) -> Result<()> {
        let affected = self.conn.execute(
            "UPDATE guest_links SET is_disabled = ?1 WHERE id = ?2",
            params![disabled, id.as_str()],
        )?;
        if affected == 0 {
            return Err(Error::GuestLinkNotFound(id.clone()));
        }
        Ok(())
    }
}

impl GuestLinkStore for Sqlite {
    fn get_guest_link(&self, id: &GuestLinkId) -> Result<GuestLink> {
        find_guest_link(&self.conn, id)?.ok_or_else(|| Error::GuestLinkNotFound(id.clone()))
    }

    fn get_guest_links(&self) -> Result<Vec<GuestLink>> {
        let sql = format!("{SELECT_GUEST_LINKS} ORDER BY guest_links.creation_time DESC");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], GuestLinkRow::from_row)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?.into_guest_link()?);
        }
        Ok(result)
    }

    fn insert_guest_link(&mut self, link: &NewGuestLink) -> Result<GuestLinkId> {
        link.limits.validate()?;
        let id = GuestLinkId::generate();
        tracing::info!("saving new guest link {id}");

        let max_file_bytes = link
            .limits
            .max_file_bytes
            .map(|b| i64::try_from(b).unwrap_or(i64::MAX));
        self.conn.execute(
            "INSERT INTO guest_links (
                id,
                label,
                max_file_bytes,
                max_file_uploads,
                max_file_lifetime,
                creation_time,
                expiration_time
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.as_str(),
                link.limits.label.as_str(),
                max_file_bytes,
                link.limits.max_file_uploads,
                link.limits.max_file_lifetime.days(),
                link.created,
                link.limits.url_expires.as_datetime(),
            ],
        )?;
        Ok(id)
    }

    fn delete_guest_link(&mut self, id: &GuestLinkId) -> Result<()> {
        tracing::info!("deleting guest link {id}");
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE entries SET guest_link_id = NULL WHERE guest_link_id = ?1",
            params![id.as_str()],
        )?;
        let deleted = tx.execute(
            "DELETE FROM guest_links WHERE id = ?1",
            params![id.as_str()],
        )?;
        if deleted == 0 {
            // dropping the transaction rolls back the detach
            return Err(Error::GuestLinkNotFound(id.clone()));
        }
        tx.commit()?;
        Ok(())
    }

    fn enable_guest_link(&mut self, id: &GuestLinkId) -> Result<()> {
        tracing::info!("enabling guest link {id}");
        self.set_guest_link_disabled(id, false)
    }

    fn disable_guest_link(&mut self, id: &GuestLinkId) -> Result<()> {
        tracing::info!("disabling guest link {id}");
        self.set_guest_link_disabled(id, true)
    }
}
