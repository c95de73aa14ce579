use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{EntryId, ExpirationTime, GuestLink, GuestLinkId, ValidationError};

/// Upper bound on filename length. 255 is a common limit across filesystems.
pub const MAX_FILENAME_CHARS: usize = 255;

pub const MAX_NOTE_BYTES: usize = 500;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

// Tags a note must never carry, whitespace tolerant.
#[allow(clippy::unwrap_used)]
static ILLEGAL_NOTE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<\s*/?((script)|(iframe))\s*>").unwrap());

/// Name a file is served under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(try_from = "String", into = "String")]
pub struct Filename(String);

impl Filename {
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        if s.is_empty() {
            return Err(ValidationError::FilenameEmpty);
        }
        let chars = s.chars().count();
        if chars > MAX_FILENAME_CHARS {
            return Err(ValidationError::FilenameTooLong(chars, MAX_FILENAME_CHARS));
        }
        if s == "." || s.starts_with("..") {
            return Err(ValidationError::FilenameDotPrefix);
        }
        if s.contains(['/', '\\']) {
            return Err(ValidationError::FilenameIllegalCharacters);
        }
        Ok(Self(s.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Filename {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Filename> for String {
    fn from(value: Filename) -> Self {
        value.0
    }
}

impl fmt::Display for Filename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Optional free text the operator attaches to a file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(try_from = "Option<String>", into = "Option<String>")]
pub struct FileNote(Option<String>);

impl FileNote {
    /// An empty string means "no note".
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        if s.is_empty() {
            return Ok(Self(None));
        }
        if s.len() > MAX_NOTE_BYTES {
            return Err(ValidationError::NoteTooLong(s.len(), MAX_NOTE_BYTES));
        }
        // Almost certainly a client-side bug rather than what the user typed.
        if s == "null" || s == "undefined" {
            return Err(ValidationError::NoteLiteral(s.to_owned()));
        }
        if ILLEGAL_NOTE_TAG.is_match(s) {
            return Err(ValidationError::NoteHtmlTag);
        }
        Ok(Self(Some(s.to_owned())))
    }

    #[must_use]
    pub fn value(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl TryFrom<Option<String>> for FileNote {
    type Error = ValidationError;

    fn try_from(value: Option<String>) -> Result<Self, Self::Error> {
        value.as_deref().map_or(Ok(Self(None)), Self::parse)
    }
}

impl From<FileNote> for Option<String> {
    fn from(value: FileNote) -> Self {
        value.0
    }
}

/// Size of a file coming from signed or client-supplied input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileSize(u64);

impl FileSize {
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl TryFrom<u64> for FileSize {
    type Error = ValidationError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value == 0 {
            return Err(ValidationError::EmptyFile);
        }
        Ok(Self(value))
    }
}

impl TryFrom<i64> for FileSize {
    type Error = ValidationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        let value = u64::try_from(value).map_err(|_| ValidationError::NegativeFileSize)?;
        Self::try_from(value)
    }
}

/// Everything known about a stored file except its bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EntryMetadata {
    pub id: EntryId,
    pub filename: Filename,
    pub note: FileNote,
    pub content_type: String,
    pub uploaded: DateTime<Utc>,
    pub expires: ExpirationTime,
    /// Length of the stored contents in bytes
    pub size: u64,
    /// Snapshot of the guest link the file came through, resolved at read time
    pub guest_link: Option<GuestLink>,
    pub download_count: u64,
}

/// Metadata supplied with a new upload.
///
/// `size` is the declared length of the stream; storage refuses to commit the
/// upload unless exactly that many bytes arrive.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadMetadata {
    pub id: EntryId,
    pub filename: Filename,
    pub note: FileNote,
    pub content_type: String,
    pub uploaded: DateTime<Utc>,
    pub expires: ExpirationTime,
    pub size: u64,
    pub guest_link_id: Option<GuestLinkId>,
}

/// The only fields of an entry that may change after upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EntryUpdate {
    pub filename: Filename,
    pub expires: ExpirationTime,
    #[serde(default)]
    pub note: FileNote,
}

/// One served download, kept for auditing and download counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DownloadRecord {
    pub time: DateTime<Utc>,
    pub client_ip: String,
    pub user_agent: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("dummy.png", Ok(()))]
    #[case("with spaces and ünïcödé.txt", Ok(()))]
    #[case("", Err(ValidationError::FilenameEmpty))]
    #[case(".", Err(ValidationError::FilenameDotPrefix))]
    #[case("..", Err(ValidationError::FilenameDotPrefix))]
    #[case("../etc/passwd", Err(ValidationError::FilenameDotPrefix))]
    #[case("dir/file.ext", Err(ValidationError::FilenameIllegalCharacters))]
    #[case("dir\\file.ext", Err(ValidationError::FilenameIllegalCharacters))]
    #[trace]
    fn parse_filename(#[case] input: &str, #[case] expected: Result<(), ValidationError>) {
        // Act
        let result = Filename::parse(input).map(|_| ());

        // Assert
        assert_eq!(result, expected);
    }

    #[test]
    fn filename_length_is_counted_in_characters() {
        // Arrange
        let longest = "Ö".repeat(MAX_FILENAME_CHARS);
        let too_long = "A".repeat(MAX_FILENAME_CHARS + 1);

        // Act & Assert
        assert!(Filename::parse(&longest).is_ok());
        assert_eq!(
            Filename::parse(&too_long),
            Err(ValidationError::FilenameTooLong(256, 255))
        );
    }

    #[rstest]
    #[case("Shared with my college group chat", true)]
    #[case("", true)]
    #[case("null", false)]
    #[case("undefined", false)]
    #[case("<script>alert(1)</script>", false)]
    #[case("< \n\t script  >alert(1)</ \n\tscript >", false)]
    #[case("< \n\t iframe  >foo</ \n\tiframe >", false)]
    #[trace]
    fn parse_note(#[case] input: &str, #[case] valid: bool) {
        // Act
        let result = FileNote::parse(input);

        // Assert
        assert_eq!(result.is_ok(), valid);
    }

    #[test]
    fn note_length_is_counted_in_bytes() {
        // Arrange
        let ascii = "A".repeat(MAX_NOTE_BYTES);
        let multibyte = "Ö".repeat(MAX_NOTE_BYTES);

        // Act & Assert
        assert!(FileNote::parse(&ascii).is_ok());
        assert!(FileNote::parse(&multibyte).is_err());
    }

    #[test]
    fn empty_note_is_absent() {
        assert_eq!(FileNote::parse("").unwrap().value(), None);
    }

    #[rstest]
    #[case(100i64, Ok(100u64))]
    #[case(0i64, Err(ValidationError::EmptyFile))]
    #[case(-1i64, Err(ValidationError::NegativeFileSize))]
    #[case(i64::MAX, Ok(i64::MAX as u64))]
    #[trace]
    fn file_size_from_signed(#[case] input: i64, #[case] expected: Result<u64, ValidationError>) {
        // Act
        let result = FileSize::try_from(input).map(|s| s.get());

        // Assert
        assert_eq!(result, expected);
    }
}
