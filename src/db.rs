use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ReadError, StoreWriteError};
use crate::image;
use crate::models::{Cutout, DetectedObject, StoredFinding};
use crate::utils::{from_base36, to_base36};

/// File name of the candidate store inside a run's output directory.
pub const STORE_FILE: &str = "findings.db";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS findings (
        id TEXT PRIMARY KEY,
        hash TEXT NOT NULL,
        ra REAL NOT NULL,
        dec REAL NOT NULL,
        properties BLOB NOT NULL
    );
    CREATE TABLE IF NOT EXISTS run (
        Id INTEGER PRIMARY KEY AUTOINCREMENT,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        strategy TEXT NOT NULL,
        config TEXT NOT NULL,
        accepted INTEGER
    );
";

/// Path of the cutout written for identifier `id` in `dir`.
pub fn cutout_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.fits", id))
}

/// Bookkeeping row for one scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub strategy: String,
    pub config: String,
    pub accepted: Option<i64>,
}

/// Database access layer for the candidate store
pub struct Database<'a> {
    conn: &'a Connection,
}

impl<'a> Database<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Database { conn }
    }

    pub fn create_tables(&self) -> Result<(), StoreWriteError> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // Run metadata
    pub fn begin_run(&self, strategy: &str, config_json: &str) -> Result<i64, StoreWriteError> {
        self.conn.execute(
            "INSERT INTO run (started_at, strategy, config) VALUES (?, ?, ?)",
            params![chrono::Utc::now().to_rfc3339(), strategy, config_json],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn finish_run(&self, run_id: i64, accepted: u64) -> Result<(), StoreWriteError> {
        self.conn.execute(
            "UPDATE run SET finished_at = ?, accepted = ? WHERE Id = ?",
            params![chrono::Utc::now().to_rfc3339(), accepted as i64, run_id],
        )?;
        Ok(())
    }

    pub fn latest_run(&self) -> Result<Option<RunRecord>, ReadError> {
        let run = self
            .conn
            .query_row(
                "SELECT Id, started_at, finished_at, strategy, config, accepted
                 FROM run
                 ORDER BY Id DESC
                 LIMIT 1",
                [],
                |row| {
                    Ok(RunRecord {
                        id: row.get(0)?,
                        started_at: row.get(1)?,
                        finished_at: row.get(2)?,
                        strategy: row.get(3)?,
                        config: row.get(4)?,
                        accepted: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(run)
    }

    // Findings
    pub fn insert_finding(tx: &rusqlite::Transaction, finding: &StoredFinding) -> Result<(), StoreWriteError> {
        tx.execute(
            "INSERT INTO findings (id, hash, ra, dec, properties) VALUES (?, ?, ?, ?, ?)",
            params![
                finding.id,
                finding.hash,
                finding.ra,
                finding.dec,
                finding.object.to_record_bytes()
            ],
        )?;
        Ok(())
    }

    /// Insert all rows or none.
    pub fn insert_findings(&self, findings: &[StoredFinding]) -> Result<(), StoreWriteError> {
        self.with_transaction(|tx| {
            for finding in findings {
                Self::insert_finding(tx, finding)?;
            }
            Ok(())
        })
    }

    pub fn count_findings(&self) -> Result<usize, ReadError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM findings", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Every stored finding in insertion order.
    pub fn load_findings(&self) -> Result<Vec<StoredFinding>, ReadError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, hash, ra, dec, properties
             FROM findings
             ORDER BY rowid",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, hash, ra, dec, blob)| decode_row(id, hash, ra, dec, &blob))
            .collect()
    }

    pub fn get_finding(&self, id: &str) -> Result<Option<StoredFinding>, ReadError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, hash, ra, dec, properties FROM findings WHERE id = ?",
                [id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(id, hash, ra, dec, blob)| decode_row(id, hash, ra, dec, &blob))
            .transpose()
    }

    // Transaction helpers
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T, StoreWriteError>
    where
        F: FnOnce(&rusqlite::Transaction) -> Result<T, StoreWriteError>,
    {
        let tx = self.conn.unchecked_transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

fn decode_row(id: String, hash: String, ra: f64, dec: f64, blob: &[u8]) -> Result<StoredFinding, ReadError> {
    let object = DetectedObject::from_record_bytes(blob).ok_or_else(|| ReadError::RecordLength {
        id: id.clone(),
        len: blob.len(),
    })?;
    Ok(StoredFinding {
        id,
        hash,
        ra,
        dec,
        object,
    })
}

/// Write side of a run's output directory. Owned by the scan collector.
pub struct CatalogStore {
    dir: PathBuf,
    conn: Connection,
}

impl CatalogStore {
    /// Create `dir` and a fresh store inside it. An existing store is never
    /// appended to, so identifiers always restart at zero.
    pub fn create(dir: &Path) -> Result<Self, StoreWriteError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(STORE_FILE);
        if path.exists() {
            return Err(StoreWriteError::AlreadyExists(path));
        }
        let conn = Connection::open(&path)?;
        Database::new(&conn).create_tables()?;
        tracing::debug!("Created candidate store {}", path.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            conn,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn db(&self) -> Database<'_> {
        Database::new(&self.conn)
    }
}

/// Read side of a finished run's output directory.
pub struct CatalogReader {
    dir: PathBuf,
    conn: Connection,
}

impl CatalogReader {
    pub fn open(dir: &Path) -> Result<Self, ReadError> {
        let conn = Connection::open_with_flags(
            dir.join(STORE_FILE),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            dir: dir.to_path_buf(),
            conn,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load(&self) -> Result<Vec<StoredFinding>, ReadError> {
        Database::new(&self.conn).load_findings()
    }

    pub fn get(&self, id: &str) -> Result<StoredFinding, ReadError> {
        let canonical = canonical_id(id)?;
        Database::new(&self.conn)
            .get_finding(&canonical)?
            .ok_or(ReadError::UnknownIdentifier(canonical))
    }

    pub fn latest_run(&self) -> Result<Option<RunRecord>, ReadError> {
        Database::new(&self.conn).latest_run()
    }

    /// Cutout pixels for a numeric identifier.
    pub fn get_cutout(&self, id: u64) -> Result<Cutout, ReadError> {
        let path = cutout_path(&self.dir, &to_base36(id));
        image::read_cutout(&path).map_err(|message| ReadError::Cutout { path, message })
    }

    /// Cutout pixels for a base-36 identifier in either letter case.
    pub fn get_cutout_by_name(&self, id: &str) -> Result<Cutout, ReadError> {
        let n = from_base36(id).ok_or_else(|| ReadError::Identifier(id.to_string()))?;
        self.get_cutout(n)
    }
}

fn canonical_id(id: &str) -> Result<String, ReadError> {
    from_base36(id)
        .map(to_base36)
        .ok_or_else(|| ReadError::Identifier(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{write_cutout, ImageHeader};
    use crate::models::{test_object, AutoPhotometry};
    use crate::utils::content_hash;
    use crate::wcs::Wcs;
    use nalgebra::{DMatrix, Matrix2};
    use tempfile::TempDir;

    fn finding(n: u64, x: f64) -> StoredFinding {
        let mut object = test_object(x, 500.0, 120, 3000.0);
        object.theta = f64::from_bits(0x7ff8_0000_0000_1234);
        let bytes = object.to_record_bytes();
        StoredFinding {
            id: to_base36(n),
            hash: content_hash(&bytes),
            ra: 150.0 + n as f64 * 0.01,
            dec: -2.5,
            object,
        }
    }

    #[test]
    fn test_findings_round_trip_bit_exact_in_order() {
        let temp = TempDir::new().unwrap();
        let store = CatalogStore::create(temp.path()).unwrap();
        let rows: Vec<_> = (0..40).map(|n| finding(n, 100.0 + n as f64)).collect();
        store.db().insert_findings(&rows[..20]).unwrap();
        store.db().insert_findings(&rows[20..]).unwrap();

        let reader = CatalogReader::open(temp.path()).unwrap();
        let loaded = reader.load().unwrap();
        assert_eq!(loaded.len(), 40);
        for (a, b) in rows.iter().zip(&loaded) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.hash, b.hash);
            assert_eq!(a.object.to_record_bytes(), b.object.to_record_bytes());
        }
        assert_eq!(loaded[0].object.theta.to_bits(), 0x7ff8_0000_0000_1234);
    }

    #[test]
    fn test_auto_photometry_survives_storage() {
        let temp = TempDir::new().unwrap();
        let store = CatalogStore::create(temp.path()).unwrap();
        let mut row = finding(0, 300.0);
        row.object.auto = Some(AutoPhotometry {
            mag_auto: f64::NAN,
            flux_auto: -3.0,
            flux_radius: 2.25,
        });
        store.db().insert_findings(std::slice::from_ref(&row)).unwrap();

        let back = CatalogReader::open(temp.path()).unwrap().get("0").unwrap();
        let auto = back.object.auto.unwrap();
        assert!(auto.mag_auto.is_nan());
        assert_eq!(auto.flux_auto, -3.0);
        assert_eq!(auto.flux_radius, 2.25);
    }

    #[test]
    fn test_failed_batch_leaves_nothing_behind() {
        let temp = TempDir::new().unwrap();
        let store = CatalogStore::create(temp.path()).unwrap();
        store.db().insert_findings(&[finding(0, 1.0)]).unwrap();
        // Second batch repeats an identifier halfway through
        let batch = vec![finding(1, 2.0), finding(0, 3.0)];
        assert!(store.db().insert_findings(&batch).is_err());
        assert_eq!(store.db().count_findings().unwrap(), 1);
    }

    #[test]
    fn test_existing_store_is_not_reused() {
        let temp = TempDir::new().unwrap();
        let _first = CatalogStore::create(temp.path()).unwrap();
        assert!(matches!(
            CatalogStore::create(temp.path()),
            Err(StoreWriteError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_run_metadata() {
        let conn = Connection::open_in_memory().unwrap();
        let db = Database::new(&conn);
        db.create_tables().unwrap();
        assert_eq!(db.latest_run().unwrap(), None);

        let run = db.begin_run("surface-brightness", "{}").unwrap();
        let open = db.latest_run().unwrap().unwrap();
        assert_eq!(open.strategy, "surface-brightness");
        assert_eq!(open.finished_at, None);

        db.finish_run(run, 7).unwrap();
        let done = db.latest_run().unwrap().unwrap();
        assert_eq!(done.accepted, Some(7));
        assert!(done.finished_at.is_some());
        assert!(chrono::DateTime::parse_from_rfc3339(&done.started_at).is_ok());
    }

    #[test]
    fn test_identifier_lookups() {
        let temp = TempDir::new().unwrap();
        let store = CatalogStore::create(temp.path()).unwrap();
        store.db().insert_findings(&[finding(35, 10.0)]).unwrap();

        let reader = CatalogReader::open(temp.path()).unwrap();
        assert_eq!(reader.get("z").unwrap().id, "Z");
        assert!(matches!(reader.get("10"), Err(ReadError::UnknownIdentifier(_))));
        assert!(matches!(reader.get("!"), Err(ReadError::Identifier(_))));
    }

    #[test]
    fn test_get_cutout_by_number_and_name() {
        let temp = TempDir::new().unwrap();
        let _store = CatalogStore::create(temp.path()).unwrap();
        let cutout = Cutout {
            x0: 4,
            y0: 9,
            data: DMatrix::from_fn(5, 7, |r, c| (r * 7 + c) as f64),
        };
        let header = ImageHeader {
            zeropoint: 20.0,
            sb_sig: Some(3.0),
            width: 64,
            height: 64,
        };
        let wcs = Wcs::new((32.0, 32.0), (10.0, 10.0), Matrix2::new(-0.002, 0.0, 0.0, 0.002)).unwrap();
        write_cutout(&cutout_path(temp.path(), &to_base36(46)), &cutout, &header, &wcs).unwrap();

        let reader = CatalogReader::open(temp.path()).unwrap();
        assert_eq!(reader.get_cutout(46).unwrap(), cutout);
        assert_eq!(reader.get_cutout_by_name("1a").unwrap(), cutout);
        assert!(matches!(reader.get_cutout(47), Err(ReadError::Cutout { .. })));
        assert!(matches!(reader.get_cutout_by_name(""), Err(ReadError::Identifier(_))));
    }
}
