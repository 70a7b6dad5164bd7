//! Connection pool, migrations and the single writer thread.
//!
//! Reads go through the pool directly. Every write is funnelled through
//! [`WriteHandle::exec`], which runs it inside an immediate transaction on a
//! dedicated thread so concurrent writers never race for the SQLite lock.

use std::path::Path;
use std::sync::Arc;

use diesel::connection::SimpleConnection;
use diesel::r2d2::{self, ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{debug, info};
use tokio::sync::{mpsc, oneshot};

use tripsync_core::errors::{DatabaseError, Error, Result};

use crate::errors::StorageError;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

const POOL_SIZE: u32 = 8;

#[derive(Debug)]
struct ConnectionOptions;

impl CustomizeConnection<SqliteConnection, r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), r2d2::Error> {
        conn.batch_execute(
            "PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000; PRAGMA foreign_keys = ON;",
        )
        .map_err(r2d2::Error::QueryError)
    }
}

pub fn create_pool(db_path: &str) -> Result<Arc<DbPool>> {
    let manager = ConnectionManager::<SqliteConnection>::new(db_path);
    let pool = Pool::builder()
        .max_size(POOL_SIZE)
        .connection_customizer(Box::new(ConnectionOptions))
        .build(manager)
        .map_err(StorageError::from)?;
    Ok(Arc::new(pool))
}

pub fn get_connection(pool: &DbPool) -> Result<DbConnection> {
    Ok(pool.get().map_err(StorageError::from)?)
}

pub fn run_migrations(pool: &DbPool) -> Result<()> {
    let mut conn = get_connection(pool)?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| StorageError::MigrationFailed(e.to_string()))?;
    for version in applied {
        info!("[LocalStore] Applied migration {}", version);
    }
    Ok(())
}

/// Creates the parent directory if needed, opens the pool and brings the
/// schema up to date.
pub fn init(db_path: &str) -> Result<Arc<DbPool>> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "cannot create {}: {}",
                    parent.display(),
                    e
                )))
            })?;
        }
    }
    let pool = create_pool(db_path)?;
    run_migrations(&pool)?;
    debug!("[LocalStore] Database ready at {}", db_path);
    Ok(pool)
}

type Job = Box<dyn FnOnce(&DbPool) + Send + 'static>;

/// Cloneable handle to the writer thread.
#[derive(Clone)]
pub struct WriteHandle {
    tx: mpsc::UnboundedSender<Job>,
}

impl WriteHandle {
    /// Runs `job` in an immediate transaction on the writer thread. An error
    /// returned by the job rolls the transaction back.
    pub async fn exec<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel::<Result<T>>();
        let task: Job = Box::new(move |pool: &DbPool| {
            let outcome = get_connection(pool).and_then(|mut conn| {
                conn.immediate_transaction::<T, StorageError, _>(|tx| {
                    job(tx).map_err(StorageError::from)
                })
                .map_err(Error::from)
            });
            // The caller may have gone away; nothing to report to.
            let _ = reply_tx.send(outcome);
        });

        self.tx
            .send(task)
            .map_err(|_| StorageError::WriterUnavailable("writer thread stopped".to_string()))?;
        reply_rx.await.map_err(|_| {
            StorageError::WriterUnavailable("writer dropped the request".to_string())
        })?
    }
}

/// Starts the writer thread. It exits once every handle is dropped.
pub fn spawn_writer(pool: Arc<DbPool>) -> Result<WriteHandle> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
    std::thread::Builder::new()
        .name("tripsync-sqlite-writer".to_string())
        .spawn(move || {
            while let Some(job) = rx.blocking_recv() {
                job(&pool);
            }
            debug!("[LocalStore] Writer thread stopped");
        })
        .map_err(|e| StorageError::WriterUnavailable(e.to_string()))?;
    Ok(WriteHandle { tx })
}
