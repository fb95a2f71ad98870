use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use rusqlite::{params, Connection};

use crate::error::{ForecastError, Result};
use crate::ingestion::DatasetSplit;
use crate::model::price_bar::PriceBar;

const PARTITION_TRAIN: &str = "train";
const PARTITION_TEST: &str = "test";

/// SQLite-backed staging area for raw train/test partitions between the
/// ingest and train stages. One dataset key per symbol plus one for the
/// pooled dataset.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self {
            path: path.to_path_buf(),
        };
        store.connect()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS price_bars (
                dataset TEXT NOT NULL,
                partition TEXT NOT NULL,
                seq INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                date TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                PRIMARY KEY(dataset, partition, seq)
            );

            CREATE TABLE IF NOT EXISTS datasets (
                dataset TEXT PRIMARY KEY,
                train_rows INTEGER NOT NULL,
                test_rows INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection> {
        Ok(Connection::open(&self.path)?)
    }

    /// Replace whatever was staged for `dataset` with `split`.
    pub fn save_split(&self, dataset: &str, split: &DatasetSplit) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM price_bars WHERE dataset = ?1", [dataset])?;
        for (partition, rows) in [(PARTITION_TRAIN, &split.train), (PARTITION_TEST, &split.test)] {
            for (seq, bar) in rows.iter().enumerate() {
                tx.execute(
                    r#"
                    INSERT INTO price_bars (
                        dataset, partition, seq, symbol, date, open, high, low, close, volume
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                    "#,
                    params![
                        dataset,
                        partition,
                        seq as i64,
                        bar.symbol,
                        bar.date.to_string(),
                        bar.open,
                        bar.high,
                        bar.low,
                        bar.close,
                        bar.volume,
                    ],
                )?;
            }
        }
        tx.execute(
            r#"
            INSERT INTO datasets (dataset, train_rows, test_rows, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(dataset) DO UPDATE SET
                train_rows = excluded.train_rows,
                test_rows = excluded.test_rows,
                updated_at_ms = excluded.updated_at_ms
            "#,
            params![
                dataset,
                split.train.len() as i64,
                split.test.len() as i64,
                chrono::Utc::now().timestamp_millis(),
            ],
        )?;
        tx.commit()?;
        tracing::info!(
            dataset,
            train_rows = split.train.len(),
            test_rows = split.test.len(),
            "Staged dataset split"
        );
        Ok(())
    }

    /// `None` when nothing has been staged for `dataset`.
    pub fn load_split(&self, dataset: &str) -> Result<Option<DatasetSplit>> {
        let conn = self.connect()?;
        let known: Option<i64> = conn
            .prepare("SELECT train_rows FROM datasets WHERE dataset = ?1")?
            .query_row([dataset], |row| row.get(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        if known.is_none() {
            return Ok(None);
        }

        let train = load_partition(&conn, dataset, PARTITION_TRAIN)?;
        let test = load_partition(&conn, dataset, PARTITION_TEST)?;
        Ok(Some(DatasetSplit { train, test }))
    }

    pub fn datasets(&self) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT dataset FROM datasets ORDER BY dataset ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn load_partition(conn: &Connection, dataset: &str, partition: &str) -> Result<Vec<PriceBar>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT symbol, date, open, high, low, close, volume
        FROM price_bars
        WHERE dataset = ?1 AND partition = ?2
        ORDER BY seq ASC
        "#,
    )?;
    let rows = stmt.query_map([dataset, partition], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, f64>(2)?,
            row.get::<_, f64>(3)?,
            row.get::<_, f64>(4)?,
            row.get::<_, f64>(5)?,
            row.get::<_, f64>(6)?,
        ))
    })?;

    let mut bars = Vec::new();
    for row in rows {
        let (symbol, date, open, high, low, close, volume) = row?;
        let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|e| {
            ForecastError::UpstreamFetch(format!("stored date '{}' is invalid: {}", date, e))
        })?;
        bars.push(PriceBar {
            symbol,
            date,
            open,
            high,
            low,
            close,
            volume,
        });
    }
    Ok(bars)
}
