use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::ValidationError;

/// 2999-12-31T00:00:00Z as a unix timestamp.
const NEVER_EXPIRE_TIMESTAMP: i64 = 32_503_593_600;

// Imprecise, but lifetimes are not exact measures of time either.
const DAYS_PER_YEAR: u32 = 365;

pub const MIN_FILE_LIFETIME_DAYS: u32 = 1;
pub const MAX_FILE_LIFETIME_YEARS: u32 = 10;

/// Point in time after which a file (or a guest link) is no longer served.
///
/// A fixed far-future instant stands in for "never expires", so an expiration
/// is always present and comparable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
pub struct ExpirationTime(DateTime<Utc>);

impl ExpirationTime {
    #[must_use]
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(at)
    }

    /// The "never expires" sentinel.
    #[must_use]
    pub fn never() -> Self {
        Self(DateTime::from_timestamp(NEVER_EXPIRE_TIMESTAMP, 0).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }

    #[must_use]
    pub fn is_never(&self) -> bool {
        *self == Self::never()
    }

    /// Expiration is inclusive: something expiring exactly at `now` is expired.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_never() && self.0 <= now
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    #[must_use]
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for ExpirationTime {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value)
    }
}

impl fmt::Display for ExpirationTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            f.write_str("never")
        } else {
            write!(f, "{}", self.0.to_rfc3339())
        }
    }
}

/// How long an uploaded file lives, counted in whole days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(try_from = "LifetimeDays")]
pub struct FileLifetime {
    days: u32,
}

/// Wire shape of [`FileLifetime`], checked by `from_days` before use.
#[derive(Deserialize)]
struct LifetimeDays {
    days: u32,
}

impl TryFrom<LifetimeDays> for FileLifetime {
    type Error = ValidationError;

    fn try_from(value: LifetimeDays) -> Result<Self, Self::Error> {
        Self::from_days(value.days)
    }
}

impl FileLifetime {
    pub const INFINITE: FileLifetime = FileLifetime { days: u32::MAX };

    /// Accepts 1 day up to 10 years, or the [`FileLifetime::INFINITE`] marker.
    pub fn from_days(days: u32) -> Result<Self, ValidationError> {
        if days == Self::INFINITE.days {
            return Ok(Self::INFINITE);
        }
        if days < MIN_FILE_LIFETIME_DAYS {
            return Err(ValidationError::LifetimeTooShort(MIN_FILE_LIFETIME_DAYS));
        }
        if days > MAX_FILE_LIFETIME_YEARS * DAYS_PER_YEAR {
            return Err(ValidationError::LifetimeTooLong(MAX_FILE_LIFETIME_YEARS));
        }
        Ok(Self { days })
    }

    #[must_use]
    pub fn days(&self) -> u32 {
        self.days
    }

    #[must_use]
    pub fn years(&self) -> u32 {
        self.days / DAYS_PER_YEAR
    }

    #[must_use]
    pub fn is_infinite(&self) -> bool {
        *self == Self::INFINITE
    }

    #[must_use]
    pub fn is_year_boundary(&self) -> bool {
        self.days % DAYS_PER_YEAR == 0
    }

    /// `None` for an infinite lifetime.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        if self.is_infinite() {
            None
        } else {
            Some(Duration::days(i64::from(self.days)))
        }
    }

    /// Expiration of a file uploaded at `start` with this lifetime. Never
    /// later than the sentinel.
    #[must_use]
    pub fn expiration_from(&self, start: DateTime<Utc>) -> ExpirationTime {
        let never = ExpirationTime::never();
        self.duration()
            .and_then(|d| start.checked_add_signed(d))
            .map(ExpirationTime::new)
            .map_or(never, |e| e.min(never))
    }

    #[must_use]
    pub fn friendly_name(&self) -> String {
        if self.is_infinite() {
            return "never".to_owned();
        }
        let (value, unit) = if self.is_year_boundary() && self.days > 0 {
            (self.years(), "year")
        } else {
            (self.days, "day")
        };
        let plural = if value == 1 { "" } else { "s" };
        format!("{value} {unit}{plural}")
    }
}

impl fmt::Display for FileLifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.friendly_name())
    }
}
