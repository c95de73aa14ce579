use std::fmt;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::ValidationError;

/// Characters ids are drawn from. Visually similar characters (I, l, 1, 0, O)
/// are left out so ids survive being read aloud or copied by hand.
pub const ID_ALPHABET: &[u8] = b"abcdefghijkmnopqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub const ENTRY_ID_LENGTH: usize = 10;
pub const GUEST_LINK_ID_LENGTH: usize = 16;

fn generate(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .filter_map(|_| ID_ALPHABET.choose(&mut rng))
        .map(|&c| c as char)
        .collect()
}

fn validate(kind: &'static str, expected: usize, s: &str) -> Result<(), ValidationError> {
    let actual = s.chars().count();
    if actual != expected {
        return Err(ValidationError::IdLength {
            kind,
            expected,
            actual,
        });
    }
    if let Some(character) = s
        .chars()
        .find(|c| !c.is_ascii() || !ID_ALPHABET.contains(&(*c as u8)))
    {
        return Err(ValidationError::IdCharacter { kind, character });
    }
    Ok(())
}

/// Identifier of a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(try_from = "String", into = "String")]
pub struct EntryId(String);

impl EntryId {
    #[must_use]
    pub fn generate() -> Self {
        Self(generate(ENTRY_ID_LENGTH))
    }

    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        validate("entry", ENTRY_ID_LENGTH, s)?;
        Ok(Self(s.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identifier of a guest upload link. Doubles as the capability token, hence
/// the longer length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(try_from = "String", into = "String")]
pub struct GuestLinkId(String);

impl GuestLinkId {
    #[must_use]
    pub fn generate() -> Self {
        Self(generate(GUEST_LINK_ID_LENGTH))
    }

    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        validate("guest link", GUEST_LINK_ID_LENGTH, s)?;
        Ok(Self(s.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! string_conversions {
    ($t:ty) => {
        impl TryFrom<String> for $t {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_conversions!(EntryId);
string_conversions!(GuestLinkId);

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn generated_entry_id_parses_back() {
        // Arrange
        let id = EntryId::generate();

        // Act
        let parsed = EntryId::parse(id.as_str());

        // Assert
        assert_eq!(parsed, Ok(id));
    }

    #[test]
    fn generated_guest_link_id_has_fixed_length() {
        // Act
        let id = GuestLinkId::generate();

        // Assert
        assert_eq!(id.as_str().len(), GUEST_LINK_ID_LENGTH);
        assert!(GuestLinkId::parse(id.as_str()).is_ok());
    }

    #[rstest]
    #[case("abcdefghij", true)]
    #[case("ABCDEFGH23", true)]
    #[case("abcdefghi", false)]
    #[case("abcdefghijk", false)]
    #[case("abcdefghi0", false)]
    #[case("abcdefghil", false)]
    #[case("abcdefghI2", false)]
    #[case("abcdefgh-2", false)]
    #[case("", false)]
    #[trace]
    fn parse_entry_id(#[case] input: &str, #[case] valid: bool) {
        // Act
        let result = EntryId::parse(input);

        // Assert
        assert_eq!(result.is_ok(), valid);
    }

    #[test]
    fn parse_reports_offending_character() {
        // Act
        let result = EntryId::parse("abcdefghi0");

        // Assert
        assert_eq!(
            result,
            Err(ValidationError::IdCharacter {
                kind: "entry",
                character: '0'
            })
        );
    }

    #[test]
    fn multibyte_characters_are_rejected() {
        // Act
        let result = EntryId::parse("abcdefghiÖ");

        // Assert
        assert!(matches!(
            result,
            Err(ValidationError::IdCharacter { character: 'Ö', .. })
        ));
    }
}
