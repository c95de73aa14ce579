#![warn(clippy::unwrap_in_result)]
#![warn(clippy::unwrap_used)]

//! Value types shared by the stashbox crates.
//!
//! Every type here validates its invariants on construction, so anything that
//! reaches storage has already been checked.

mod entry;
mod error;
mod guest_link;
mod id;
mod lifetime;
mod settings;

pub use entry::{
    DEFAULT_CONTENT_TYPE, DownloadRecord, EntryMetadata, EntryUpdate, FileNote, FileSize,
    Filename, MAX_FILENAME_CHARS, MAX_NOTE_BYTES, UploadMetadata,
};
pub use error::ValidationError;
pub use guest_link::{
    GuestLink, GuestLinkLabel, GuestLinkLimits, MAX_GUEST_LINK_LABEL_BYTES, NewGuestLink,
};
pub use id::{ENTRY_ID_LENGTH, EntryId, GUEST_LINK_ID_LENGTH, GuestLinkId, ID_ALPHABET};
pub use lifetime::{
    ExpirationTime, FileLifetime, MAX_FILE_LIFETIME_YEARS, MIN_FILE_LIFETIME_DAYS,
};
pub use settings::{DEFAULT_FILE_LIFETIME_DAYS, Settings};
