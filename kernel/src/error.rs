use thiserror::Error;

/// Rejection of malformed metadata. Raised before anything touches storage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{kind} id must be {expected} characters long, got {actual}")]
    IdLength {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{kind} id contains invalid character {character:?}")]
    IdCharacter { kind: &'static str, character: char },

    #[error("filename must be non-empty")]
    FilenameEmpty,

    #[error("filename too long: {0} characters (max: {1})")]
    FilenameTooLong(usize, usize),

    #[error("filename cannot begin with dots")]
    FilenameDotPrefix,

    #[error("illegal characters in filename")]
    FilenameIllegalCharacters,

    #[error("note too long: {0} bytes (max: {1})")]
    NoteTooLong(usize, usize),

    #[error("value of '{0}' is not allowed")]
    NoteLiteral(String),

    #[error("note must not contain HTML tags")]
    NoteHtmlTag,

    #[error("label too long: {0} bytes (max: {1})")]
    LabelTooLong(usize, usize),

    #[error("file size must be positive")]
    NegativeFileSize,

    #[error("file must not be empty")]
    EmptyFile,

    #[error("file too large: {0} bytes (max: {1})")]
    FileTooLarge(u64, u64),

    #[error("file lifetime must be at least {0} day")]
    LifetimeTooShort(u32),

    #[error("file lifetime must be at most {0} years")]
    LifetimeTooLong(u32),

    #[error("{0} limit must be positive")]
    NonPositiveLimit(&'static str),

    #[error("guest link is disabled, expired or exhausted")]
    GuestLinkInactive,

    #[error("file lifetime exceeds the guest link's limit of {0}")]
    GuestLifetimeExceeded(String),
}
