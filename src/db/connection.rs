use crate::error::{FlowGateError, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// SQLite store for the audit-bearing entities: active runs, queued events
/// and interlock events.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        };

        super::migrations::run(&db)?;

        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        };

        super::migrations::run(&db)?;

        Ok(db)
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|_| FlowGateError::InvalidData("database connection lock poisoned".into()))?;
        f(&conn)
    }

    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| FlowGateError::InvalidData("database connection lock poisoned".into()))?;
        f(&mut conn)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
            path: self.path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_the_file_it_opened() {
        let dir = std::env::temp_dir().join(format!("flowgate-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("flowgate.db");

        let db = Database::open(&path).unwrap();
        assert_eq!(db.path(), &path);
        assert_eq!(db.clone().path(), &path);
        drop(db);

        // Migrations are already applied on reopen
        assert_eq!(Database::open(&path).unwrap().path(), &path);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn in_memory_database_has_placeholder_path() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.path(), &PathBuf::from(":memory:"));
    }
}
