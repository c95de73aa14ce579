use kernel::{FileLifetime, Settings};
use rusqlite::{params, OptionalExtension};

use super::Sqlite;
use crate::domain::SettingsStore;
use crate::error::Result;

impl SettingsStore for Sqlite {
    fn read_settings(&self) -> Result<Settings> {
        let days: Option<i64> = self
            .conn
            .query_row(
                "SELECT default_file_lifetime FROM settings WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let Some(days) = days else {
            return Ok(Settings::default());
        };
        let days = u32::try_from(days).unwrap_or(FileLifetime::INFINITE.days());
        Ok(Settings {
            default_file_lifetime: FileLifetime::from_days(days)?,
        })
    }

    fn update_settings(&mut self, settings: &Settings) -> Result<()> {
        tracing::info!("saving new settings: {settings}");
        self.conn.execute(
            "INSERT INTO settings (id, default_file_lifetime)
            VALUES (1, ?1)
            ON CONFLICT(id) DO UPDATE SET
                default_file_lifetime = excluded.default_file_lifetime",
            params![settings.default_file_lifetime.days()],
        )?;
        Ok(())
    }
}
