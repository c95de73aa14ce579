use std::io::{self, Read};

use chrono::{DateTime, Utc};
use kernel::{
    DownloadRecord, EntryId, EntryMetadata, EntryUpdate, GuestLink, GuestLinkId, NewGuestLink,
    Settings, UploadMetadata,
};

use crate::error::Result;
use crate::sqlite::BlobReader;

/// Stored files and their metadata.
pub trait EntryStore {
    fn list_entry_metadata(&self) -> Result<Vec<EntryMetadata>>;

    fn get_entry_metadata(&self, id: &EntryId) -> Result<EntryMetadata>;

    /// Stores `metadata.size` bytes read from `reader`. Nothing is kept unless
    /// the whole stream arrives. A guest link that is disabled, expired or out
    /// of uploads at commit time rejects the entry.
    fn insert_entry(&mut self, reader: &mut dyn Read, metadata: &UploadMetadata) -> Result<()>;

    /// Hands a seekable reader over the entry's bytes to `consumer`. The
    /// underlying handle is released once `consumer` returns.
    fn read_entry_file<T, F>(&self, id: &EntryId, consumer: F) -> Result<T>
    where
        F: FnOnce(&mut BlobReader<'_>) -> io::Result<T>;

    fn update_entry_metadata(&mut self, id: &EntryId, update: &EntryUpdate) -> Result<()>;

    /// Deleting an entry that doesn't exist is not an error.
    fn delete_entry(&mut self, id: &EntryId) -> Result<()>;

    /// Removes every entry whose expiration is at or before `now`. Returns the
    /// number of entries removed.
    fn delete_expired_entries(&mut self, now: DateTime<Utc>) -> Result<usize>;

    fn insert_entry_download(&mut self, id: &EntryId, record: &DownloadRecord) -> Result<()>;

    /// Newest first.
    fn get_entry_downloads(&self, id: &EntryId) -> Result<Vec<DownloadRecord>>;

    /// Gives space freed by deletions back to the filesystem.
    fn compact(&self) -> Result<()>;
}

/// Guest upload links. Upload counts are always derived from entries.
pub trait GuestLinkStore {
    fn get_guest_link(&self, id: &GuestLinkId) -> Result<GuestLink>;

    fn get_guest_links(&self) -> Result<Vec<GuestLink>>;

    fn insert_guest_link(&mut self, link: &NewGuestLink) -> Result<GuestLinkId>;

    /// Detaches the link from its entries, then removes it, atomically.
    fn delete_guest_link(&mut self, id: &GuestLinkId) -> Result<()>;

    fn enable_guest_link(&mut self, id: &GuestLinkId) -> Result<()>;

    fn disable_guest_link(&mut self, id: &GuestLinkId) -> Result<()>;
}

pub trait SettingsStore {
    /// Defaults when nothing was saved yet.
    fn read_settings(&self) -> Result<Settings>;

    fn update_settings(&mut self, settings: &Settings) -> Result<()>;
}

pub trait Storage: EntryStore + GuestLinkStore + SettingsStore {
    /// Creates or upgrades the schema.
    fn new_database(&mut self) -> Result<()>;
}
