use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{ExpirationTime, FileLifetime, GuestLinkId, ValidationError};

/// Arbitrary limit that keeps labels readable in listings.
pub const MAX_GUEST_LINK_LABEL_BYTES: usize = 200;

/// Operator-facing description of a guest link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(try_from = "String", into = "String")]
pub struct GuestLinkLabel(String);

impl GuestLinkLabel {
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        if s.len() > MAX_GUEST_LINK_LABEL_BYTES {
            return Err(ValidationError::LabelTooLong(
                s.len(),
                MAX_GUEST_LINK_LABEL_BYTES,
            ));
        }
        Ok(Self(s.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for GuestLinkLabel {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<GuestLinkLabel> for String {
    fn from(value: GuestLinkLabel) -> Self {
        value.0
    }
}

/// Quota and lifetime limits of a guest link, as chosen by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct GuestLinkLimits {
    #[serde(default)]
    pub label: GuestLinkLabel,
    /// When the link itself stops accepting uploads
    pub url_expires: ExpirationTime,
    /// Longest lifetime a file uploaded through the link may request
    pub max_file_lifetime: FileLifetime,
    /// Per-file size cap, `None` for unlimited
    pub max_file_bytes: Option<u64>,
    /// Cap on files accepted through the link, `None` for unlimited
    pub max_file_uploads: Option<u32>,
}

impl GuestLinkLimits {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_file_bytes == Some(0) {
            return Err(ValidationError::NonPositiveLimit("file size"));
        }
        if self.max_file_uploads == Some(0) {
            return Err(ValidationError::NonPositiveLimit("file upload"));
        }
        Ok(())
    }
}

/// A guest link about to be stored. The id is assigned by storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGuestLink {
    pub created: DateTime<Utc>,
    pub limits: GuestLinkLimits,
}

/// Capability to upload a bounded number of files without the operator's
/// credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct GuestLink {
    pub id: GuestLinkId,
    pub created: DateTime<Utc>,
    #[serde(flatten)]
    pub limits: GuestLinkLimits,
    /// Entries currently referencing the link
    pub files_uploaded: u32,
    pub is_disabled: bool,
}

impl GuestLink {
    #[must_use]
    pub fn can_accept_more_files(&self) -> bool {
        self.limits
            .max_file_uploads
            .is_none_or(|max| self.files_uploaded < max)
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.limits.url_expires.is_expired_at(now)
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_disabled && !self.is_expired_at(now) && self.can_accept_more_files()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.is_active_at(Utc::now())
    }

    #[must_use]
    pub fn accepts_file_size(&self, size: u64) -> bool {
        self.limits.max_file_bytes.is_none_or(|max| size <= max)
    }

    /// Whether a file uploaded at `uploaded` may live until `expires`.
    #[must_use]
    pub fn permits_expiration(&self, uploaded: DateTime<Utc>, expires: ExpirationTime) -> bool {
        let lifetime = self.limits.max_file_lifetime;
        if lifetime.is_infinite() {
            return true;
        }
        !expires.is_never() && expires <= lifetime.expiration_from(uploaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rstest::rstest;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn guest_link(max_file_uploads: Option<u32>, files_uploaded: u32) -> GuestLink {
        GuestLink {
            id: GuestLinkId::generate(),
            created: now(),
            limits: GuestLinkLimits {
                label: GuestLinkLabel::default(),
                url_expires: ExpirationTime::never(),
                max_file_lifetime: FileLifetime::INFINITE,
                max_file_bytes: None,
                max_file_uploads,
            },
            files_uploaded,
            is_disabled: false,
        }
    }

    #[rstest]
    #[case(Some(3), 0, true)]
    #[case(Some(3), 1, true)]
    #[case(Some(3), 2, true)]
    #[case(Some(3), 3, false)]
    #[case(Some(3), 4, false)]
    #[case(None, 0, true)]
    #[case(None, 1_000_000, true)]
    #[trace]
    fn can_accept_more_files(
        #[case] max_file_uploads: Option<u32>,
        #[case] files_uploaded: u32,
        #[case] expected: bool,
    ) {
        // Arrange
        let link = guest_link(max_file_uploads, files_uploaded);

        // Act
        let result = link.can_accept_more_files();

        // Assert
        assert_eq!(result, expected);
    }

    #[test]
    fn disabled_link_is_inactive() {
        // Arrange
        let mut link = guest_link(None, 0);
        link.is_disabled = true;

        // Act & Assert
        assert!(!link.is_active_at(now()));
    }

    #[test]
    fn expired_link_is_inactive() {
        // Arrange
        let mut link = guest_link(None, 0);
        link.limits.url_expires = ExpirationTime::new(now());

        // Act & Assert
        assert!(link.is_expired_at(now()));
        assert!(!link.is_active_at(now()));
        assert!(link.is_active_at(now() - Duration::hours(1)));
    }

    #[test]
    fn exhausted_link_is_inactive() {
        // Arrange
        let link = guest_link(Some(1), 1);

        // Act & Assert
        assert!(!link.is_active_at(now()));
    }

    #[rstest]
    #[case(None, 5_000_000_000, true)]
    #[case(Some(1024), 1024, true)]
    #[case(Some(1024), 1025, false)]
    #[trace]
    fn accepts_file_size(#[case] max: Option<u64>, #[case] size: u64, #[case] expected: bool) {
        // Arrange
        let mut link = guest_link(None, 0);
        link.limits.max_file_bytes = max;

        // Act & Assert
        assert_eq!(link.accepts_file_size(size), expected);
    }

    #[test]
    fn permits_expiration_within_max_lifetime() {
        // Arrange
        let mut link = guest_link(None, 0);
        link.limits.max_file_lifetime = FileLifetime::from_days(7).unwrap();

        // Act & Assert
        assert!(link.permits_expiration(now(), ExpirationTime::new(now() + Duration::days(7))));
        assert!(!link.permits_expiration(now(), ExpirationTime::new(now() + Duration::days(8))));
        assert!(!link.permits_expiration(now(), ExpirationTime::never()));
    }

    #[test]
    fn infinite_max_lifetime_permits_never() {
        // Arrange
        let link = guest_link(None, 0);

        // Act & Assert
        assert!(link.permits_expiration(now(), ExpirationTime::never()));
    }

    #[rstest]
    #[case(Some(0), None)]
    #[case(None, Some(0))]
    #[trace]
    fn zero_limits_are_rejected(#[case] bytes: Option<u64>, #[case] uploads: Option<u32>) {
        // Arrange
        let mut link = guest_link(uploads, 0);
        link.limits.max_file_bytes = bytes;

        // Act & Assert
        assert!(link.limits.validate().is_err());
    }

    #[test]
    fn label_is_length_bounded() {
        assert!(GuestLinkLabel::parse(&"A".repeat(MAX_GUEST_LINK_LABEL_BYTES)).is_ok());
        assert!(GuestLinkLabel::parse(&"A".repeat(MAX_GUEST_LINK_LABEL_BYTES + 1)).is_err());
    }
}
