//! Periodic removal of expired entries.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::domain::EntryStore;
use crate::error::Result;

/// Default time between two sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deletes entries whose expiration has passed, either on demand through
/// [`Sweeper::sweep`] or on a timer started with [`Sweeper::start`].
pub struct Sweeper<S, C = SystemClock> {
    store: Arc<Mutex<S>>,
    clock: Arc<C>,
}

impl<S, C> Clone for Sweeper<S, C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S, C> Sweeper<S, C>
where
    S: EntryStore + Send + 'static,
    C: Clock,
{
    pub fn new(store: Arc<Mutex<S>>, clock: C) -> Self {
        Self {
            store,
            clock: Arc::new(clock),
        }
    }

    /// Runs one sweep on the calling thread and returns how many entries were
    /// removed. Space is compacted only when something was removed, and a
    /// failed compaction is logged rather than returned.
    pub fn sweep(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        let deleted = store.delete_expired_entries(now)?;
        if deleted > 0 {
            tracing::info!(deleted, "sweeper removed expired entries");
            // the deletion is already committed
            if let Err(e) = store.compact() {
                tracing::warn!("compaction after sweep failed: {e}");
            }
        } else {
            tracing::trace!("sweeper found no expired entries");
        }
        Ok(deleted)
    }

    /// Sweeps every `interval` on the tokio runtime until the returned handle
    /// is stopped. The first sweep happens one interval after the start.
    pub fn start(&self, interval: Duration) -> SweeperHandle {
        let (shutdown, mut stopped) = oneshot::channel();
        let sweeper = self.clone();
        // tokio refuses a zero period
        let interval = interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "sweeper started");
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        let s = sweeper.clone();
                        match tokio::task::spawn_blocking(move || s.sweep()).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => tracing::warn!(error = %e, "sweep failed"),
                            Err(e) => tracing::error!(error = %e, "sweep task failed"),
                        }
                    }
                }
            }
            tracing::info!("sweeper stopped");
        });

        SweeperHandle {
            shutdown: Some(shutdown),
            task,
        }
    }
}

/// Running sweeper task.
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signals the task and waits for it to finish. A sweep already in
    /// progress completes first.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::error!(error = %e, "sweeper task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EntryStore;
    use crate::sqlite::Sqlite;
    use chrono::TimeZone;
    use crate::error::Error;
    use crate::sqlite::BlobReader;
    use kernel::{
        DownloadRecord, EntryId, EntryMetadata, EntryUpdate, ExpirationTime, FileNote, Filename,
        UploadMetadata,
    };
    use std::io::{self, Cursor, Read};

    /// Hands out a fixed number of expired entries; compaction always fails.
    struct NoSpaceStore {
        expired: usize,
    }

    impl EntryStore for NoSpaceStore {
        fn list_entry_metadata(&self) -> Result<Vec<EntryMetadata>> {
            unimplemented!()
        }

        fn get_entry_metadata(&self, _: &EntryId) -> Result<EntryMetadata> {
            unimplemented!()
        }

        fn insert_entry(&mut self, _: &mut dyn Read, _: &UploadMetadata) -> Result<()> {
            unimplemented!()
        }

        fn read_entry_file<T, F>(&self, _: &EntryId, _: F) -> Result<T>
        where
            F: FnOnce(&mut BlobReader<'_>) -> io::Result<T>,
        {
            unimplemented!()
        }

        fn update_entry_metadata(&mut self, _: &EntryId, _: &EntryUpdate) -> Result<()> {
            unimplemented!()
        }

        fn delete_entry(&mut self, _: &EntryId) -> Result<()> {
            unimplemented!()
        }

        fn delete_expired_entries(&mut self, _: DateTime<Utc>) -> Result<usize> {
            Ok(std::mem::take(&mut self.expired))
        }

        fn insert_entry_download(&mut self, _: &EntryId, _: &DownloadRecord) -> Result<()> {
            unimplemented!()
        }

        fn get_entry_downloads(&self, _: &EntryId) -> Result<Vec<DownloadRecord>> {
            unimplemented!()
        }

        fn compact(&self) -> Result<()> {
            Err(Error::Io(io::Error::other("no space left on device")))
        }
    }

    #[derive(Clone)]
    struct ManualClock(Arc<Mutex<DateTime<Utc>>>);

    impl ManualClock {
        fn at(now: DateTime<Utc>) -> Self {
            Self(Arc::new(Mutex::new(now)))
        }

        fn set(&self, now: DateTime<Utc>) {
            *self.0.lock().unwrap() = now;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    fn insert(db: &mut Sqlite, expires: ExpirationTime) -> EntryId {
        let id = EntryId::generate();
        let data = b"dummy data";
        let metadata = UploadMetadata {
            id: id.clone(),
            filename: Filename::parse("dummy.txt").unwrap(),
            note: FileNote::default(),
            content_type: "text/plain".to_owned(),
            uploaded: day(1),
            expires,
            size: data.len() as u64,
            guest_link_id: None,
        };
        db.insert_entry(&mut Cursor::new(data), &metadata).unwrap();
        id
    }

    fn store() -> (tempfile::TempDir, Arc<Mutex<Sqlite>>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Sqlite::open_or_create(dir.path().join("stashbox.db")).unwrap();
        (dir, Arc::new(Mutex::new(db)))
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        // Arrange
        let (_dir, db) = store();
        let expired = insert(&mut db.lock().unwrap(), ExpirationTime::new(day(3)));
        let live = insert(&mut db.lock().unwrap(), ExpirationTime::new(day(5)));
        let forever = insert(&mut db.lock().unwrap(), ExpirationTime::never());
        let sweeper = Sweeper::new(Arc::clone(&db), ManualClock::at(day(3)));

        // Act
        let deleted = sweeper.sweep().unwrap();

        // Assert
        assert_eq!(deleted, 1);
        let db = db.lock().unwrap();
        assert!(db.get_entry_metadata(&expired).unwrap_err().is_not_found());
        assert!(db.get_entry_metadata(&live).is_ok());
        assert!(db.get_entry_metadata(&forever).is_ok());
    }

    #[test]
    fn sweep_with_nothing_expired_is_a_no_op() {
        // Arrange
        let (_dir, db) = store();
        insert(&mut db.lock().unwrap(), ExpirationTime::new(day(5)));
        let sweeper = Sweeper::new(Arc::clone(&db), ManualClock::at(day(4)));

        // Act
        let deleted = sweeper.sweep().unwrap();

        // Assert
        assert_eq!(deleted, 0);
        assert_eq!(db.lock().unwrap().list_entry_metadata().unwrap().len(), 1);
    }

    #[test]
    fn failed_compaction_still_reports_deleted_entries() {
        // Arrange
        let db = Arc::new(Mutex::new(NoSpaceStore { expired: 2 }));
        let sweeper = Sweeper::new(db, ManualClock::at(day(3)));

        // Act
        let deleted = sweeper.sweep();

        // Assert
        assert_eq!(deleted.unwrap(), 2);
    }

    #[tokio::test]
    async fn started_sweeper_runs_until_stopped() {
        // Arrange
        let (_dir, db) = store();
        let clock = ManualClock::at(day(1));
        let id = insert(&mut db.lock().unwrap(), ExpirationTime::new(day(2)));
        let sweeper = Sweeper::new(Arc::clone(&db), clock.clone());

        // Act
        let handle = sweeper.start(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let before = db.lock().unwrap().get_entry_metadata(&id).is_ok();
        clock.set(day(2));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await;

        // Assert
        assert!(before);
        assert!(db
            .lock()
            .unwrap()
            .get_entry_metadata(&id)
            .unwrap_err()
            .is_not_found());
    }
}
