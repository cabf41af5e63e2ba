//! Local dataset file: atomic writes, monthly snapshots, and reads for push paths.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use rentsync_core::{parse_date, LocalTable, MergedRow, DATASET_HEADER};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct WrittenDataset {
    pub path: PathBuf,
    pub rows: usize,
    pub content_hash: String,
    /// The previous file at `path` held identical bytes.
    pub unchanged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Written(PathBuf),
    Kept(PathBuf),
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn encode_dataset(rows: &[MergedRow]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(DATASET_HEADER)
        .context("writing dataset header")?;
    for row in rows {
        writer
            .write_record(row.to_cells())
            .with_context(|| format!("writing dataset row for {}", row.entity))?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing dataset buffer: {}", err.error()))
}

/// Write merged rows via a temp file + rename so readers never see a partial file.
pub async fn write_dataset_atomic(
    path: impl AsRef<Path>,
    rows: &[MergedRow],
) -> anyhow::Result<WrittenDataset> {
    let path = path.as_ref();
    let bytes = encode_dataset(rows)?;
    let content_hash = sha256_hex(&bytes);

    let unchanged = match fs::read(path).await {
        Ok(existing) => sha256_hex(&existing) == content_hash,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
        Err(err) => {
            return Err(err).with_context(|| format!("reading existing dataset {}", path.display()))
        }
    };

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating dataset directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "dataset.csv".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp dataset file {}", temp_path.display()))?;
    file.write_all(&bytes)
        .await
        .with_context(|| format!("writing temp dataset file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp dataset file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp dataset {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    tracing::info!(path = %path.display(), rows = rows.len(), unchanged, "wrote dataset");
    Ok(WrittenDataset {
        path: path.to_path_buf(),
        rows: rows.len(),
        content_hash,
        unchanged,
    })
}

/// `<history_dir>/<stem>_<YYYY-MM>.csv`, month of the latest parseable row date.
pub fn snapshot_path(history_dir: &Path, stem: &str, rows: &[MergedRow], today: NaiveDate) -> PathBuf {
    let month = rows
        .iter()
        .filter_map(|r| parse_date(&r.date))
        .max()
        .unwrap_or(today)
        .format("%Y-%m");
    history_dir.join(format!("{stem}_{month}.csv"))
}

pub async fn write_snapshot(
    history_dir: &Path,
    stem: &str,
    rows: &[MergedRow],
    today: NaiveDate,
    force: bool,
) -> anyhow::Result<SnapshotOutcome> {
    let path = snapshot_path(history_dir, stem, rows, today);
    let exists = fs::try_exists(&path)
        .await
        .with_context(|| format!("checking snapshot path {}", path.display()))?;
    if exists && !force {
        tracing::info!(path = %path.display(), "snapshot exists, keeping it");
        return Ok(SnapshotOutcome::Kept(path));
    }
    write_dataset_atomic(&path, rows).await?;
    Ok(SnapshotOutcome::Written(path))
}

/// Load any delimited file with a header row.
pub async fn read_dataset(path: impl AsRef<Path>) -> anyhow::Result<LocalTable> {
    let path = path.as_ref();
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading dataset {}", path.display()))?;
    let mut reader = csv::Reader::from_reader(bytes.as_slice());
    let columns: Vec<String> = reader
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("parsing {} row {}", path.display(), line + 2))?;
        rows.push(
            columns
                .iter()
                .cloned()
                .zip(record.iter().map(str::to_string))
                .collect(),
        );
    }
    Ok(LocalTable { columns, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rentsync_core::{Category, CategoryAmounts};
    use tempfile::tempdir;

    fn row(date: &str, entity: &str, groceries: f64) -> MergedRow {
        let mut amounts = CategoryAmounts::default();
        amounts.set(Category::Groceries, groceries);
        MergedRow {
            date: date.into(),
            entity: entity.into(),
            configuration: "1 BR / 1 BA".into(),
            price: 800.0,
            amounts,
        }
    }

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_write_reports_unchanged_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data").join("rents.csv");
        let rows = vec![row("2025-05-01", "David", 250.0)];

        let first = write_dataset_atomic(&path, &rows).await.expect("first write");
        let second = write_dataset_atomic(&path, &rows).await.expect("second write");
        assert!(!first.unchanged);
        assert!(second.unchanged);
        assert_eq!(first.content_hash, second.content_hash);

        let text = std::fs::read_to_string(&path).expect("read back");
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("Date,City/Neighborhood,Configuration,Average Price (USD),Utilities,Groceries,Internet,Cell Phone,Dining,Entertainment,Travel")
        );
        assert_eq!(lines.next(), Some("2025-05-01,David,1 BR / 1 BA,800,0,250,0,0,0,0,0"));

        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn snapshot_month_comes_from_latest_row_date() {
        let today = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();
        let rows = vec![row("03/10/2025", "David", 0.0), row("2025-05-01", "Boquete", 0.0)];
        assert_eq!(
            snapshot_path(Path::new("hist"), "rents", &rows, today),
            PathBuf::from("hist/rents_2025-05.csv")
        );
        let undated = vec![row("soon", "David", 0.0)];
        assert_eq!(
            snapshot_path(Path::new("hist"), "rents", &undated, today),
            PathBuf::from("hist/rents_2026-01.csv")
        );
    }

    #[tokio::test]
    async fn existing_snapshot_is_kept_unless_forced() {
        let dir = tempdir().expect("tempdir");
        let today = NaiveDate::from_ymd_opt(2025, 5, 20).unwrap();
        let rows = vec![row("2025-05-01", "David", 1.0)];

        let first = write_snapshot(dir.path(), "rents", &rows, today, false).await.unwrap();
        assert!(matches!(first, SnapshotOutcome::Written(_)));
        let again = write_snapshot(dir.path(), "rents", &rows, today, false).await.unwrap();
        assert!(matches!(again, SnapshotOutcome::Kept(_)));
        let forced = write_snapshot(dir.path(), "rents", &rows, today, true).await.unwrap();
        assert!(matches!(forced, SnapshotOutcome::Written(_)));
    }

    #[tokio::test]
    async fn read_dataset_keys_cells_by_header() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("custom.csv");
        std::fs::write(&path, "Date, City/Neighborhood ,Price\n2025-05-01,Boquete,\"1,200\"\n").unwrap();

        let table = read_dataset(&path).await.expect("read");
        assert_eq!(table.columns, vec!["Date", "City/Neighborhood", "Price"]);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0]["Price"], "1,200");
        assert_eq!(table.rows[0]["City/Neighborhood"], "Boquete");
    }
}
