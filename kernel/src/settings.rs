use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::FileLifetime;

pub const DEFAULT_FILE_LIFETIME_DAYS: u32 = 30;

/// Server-wide preferences. There is only ever one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Settings {
    /// Lifetime applied to uploads that don't ask for a specific expiration
    pub default_file_lifetime: FileLifetime,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_file_lifetime: FileLifetime::from_days(DEFAULT_FILE_LIFETIME_DAYS)
                .unwrap_or(FileLifetime::INFINITE),
        }
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{lifetime={}}}", self.default_file_lifetime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_lifetime_is_thirty_days() {
        // Act
        let settings = Settings::default();

        // Assert
        assert_eq!(settings.default_file_lifetime.days(), 30);
        assert_eq!(settings.to_string(), "{lifetime=30 days}");
    }

    #[test]
    fn settings_with_zero_day_lifetime_are_rejected() {
        // Act
        let result = serde_json::from_str::<Settings>(r#"{"default_file_lifetime":{"days":0}}"#);

        // Assert
        assert!(result.is_err());
    }
}
