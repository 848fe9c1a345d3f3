//! CSV loaders for raw station batches (spec.md section 6).
//!
//! Reads `X/<station_id>.csv` (`M_TIMESTAMP, S_original, BU_original[,
//! missing]`) and the paired `y/<station_id>.csv` (`label`) per station,
//! using the `csv` crate with `serde`-derived row structs — grounded in
//! several `other_examples` manifests that reach for `csv` rather than
//! hand-rolling a parser, since the teacher crate has no CSV ingestion of
//! its own to generalize from.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::types::{RawLabel, RawStation, StationBatch};

#[derive(Debug, Error)]
pub enum IoError {
    #[error("failed to read directory {path:?}: {source}")]
    ReadDir { path: PathBuf, source: std::io::Error },
    #[error("failed to open {path:?}: {source}")]
    Open { path: PathBuf, source: csv::Error },
    #[error("malformed row in {path:?}: {source}")]
    Row { path: PathBuf, source: csv::Error },
    #[error("station {station_id}: X has {x_len} rows but y has {y_len}")]
    LengthMismatch { station_id: String, x_len: usize, y_len: usize },
    #[error("no station CSVs found under {0:?}/X")]
    NoStations(PathBuf),
}

#[derive(Debug, Deserialize)]
struct XRow {
    #[serde(rename = "M_TIMESTAMP")]
    m_timestamp: i64,
    #[serde(rename = "S_original")]
    s_original: Option<f64>,
    #[serde(rename = "BU_original")]
    bu_original: Option<f64>,
    #[serde(default)]
    missing: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct YRow {
    label: Option<RawLabel>,
}

fn read_rows<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, IoError> {
    let mut reader = csv::Reader::from_path(path).map_err(|source| IoError::Open { path: path.to_path_buf(), source })?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        let row: T = record.map_err(|source| IoError::Row { path: path.to_path_buf(), source })?;
        rows.push(row);
    }
    Ok(rows)
}

/// Load one station's `X`/`y` CSV pair into a [`RawStation`].
pub fn load_station(station_id: &str, x_path: &Path, y_path: &Path) -> Result<RawStation, IoError> {
    let x_rows: Vec<XRow> = read_rows(x_path)?;
    let y_rows: Vec<YRow> = read_rows(y_path)?;

    if x_rows.len() != y_rows.len() {
        return Err(IoError::LengthMismatch {
            station_id: station_id.to_string(),
            x_len: x_rows.len(),
            y_len: y_rows.len(),
        });
    }

    let has_missing_col = x_rows.iter().any(|r| r.missing.is_some());

    Ok(RawStation {
        station_id: station_id.to_string(),
        timestamp: x_rows.iter().map(|r| r.m_timestamp).collect(),
        s_original: x_rows.iter().map(|r| r.s_original).collect(),
        bu_original: x_rows.iter().map(|r| r.bu_original).collect(),
        label: y_rows.iter().map(|r| r.label).collect(),
        missing: if has_missing_col {
            Some(x_rows.iter().map(|r| r.missing.unwrap_or(false)).collect())
        } else {
            None
        },
    })
}

/// Load every station under `base_dir/X` (paired with `base_dir/y`) into a
/// [`StationBatch`], ordered by station-id file name (spec.md section 5's
/// ordering guarantee starts here: downstream stages never reorder).
pub fn load_station_batch(base_dir: &Path) -> Result<StationBatch, IoError> {
    let x_dir = base_dir.join("X");
    let y_dir = base_dir.join("y");

    let mut station_ids: Vec<String> = std::fs::read_dir(&x_dir)
        .map_err(|source| IoError::ReadDir { path: x_dir.clone(), source })?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "csv"))
        .filter_map(|entry| entry.path().file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect();
    station_ids.sort();

    if station_ids.is_empty() {
        return Err(IoError::NoStations(base_dir.to_path_buf()));
    }

    let mut stations = Vec::with_capacity(station_ids.len());
    for station_id in &station_ids {
        let x_path = x_dir.join(format!("{station_id}.csv"));
        let y_path = y_dir.join(format!("{station_id}.csv"));
        tracing::debug!(station_id, "loading station CSV pair");
        stations.push(load_station(station_id, &x_path, &y_path)?);
    }

    Ok(StationBatch::new(stations))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn loads_one_station_with_missing_values() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(
            &dir.path().join("X/s1.csv"),
            "M_TIMESTAMP,S_original,BU_original\n0,1.0,2.0\n1,,3.0\n2,4.0,5.0\n",
        );
        write_csv(&dir.path().join("y/s1.csv"), "label\n0\n0\n1\n");

        let batch = load_station_batch(dir.path()).unwrap();
        assert_eq!(batch.len(), 1);
        let s = &batch.stations[0];
        assert_eq!(s.station_id, "s1");
        assert_eq!(s.s_original, vec![Some(1.0), None, Some(4.0)]);
        assert_eq!(s.label, vec![Some(0), Some(0), Some(1)]);
        assert!(s.missing.is_none());
    }

    #[test]
    fn loads_multiple_stations_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        for id in ["s2", "s1"] {
            write_csv(&dir.path().join(format!("X/{id}.csv")), "M_TIMESTAMP,S_original,BU_original\n0,1.0,1.0\n");
            write_csv(&dir.path().join(format!("y/{id}.csv")), "label\n0\n");
        }
        let batch = load_station_batch(dir.path()).unwrap();
        assert_eq!(batch.stations[0].station_id, "s1");
        assert_eq!(batch.stations[1].station_id, "s2");
    }

    #[test]
    fn mismatched_lengths_are_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(&dir.path().join("X/s1.csv"), "M_TIMESTAMP,S_original,BU_original\n0,1.0,1.0\n1,2.0,2.0\n");
        write_csv(&dir.path().join("y/s1.csv"), "label\n0\n");
        let err = load_station("s1", &dir.path().join("X/s1.csv"), &dir.path().join("y/s1.csv")).unwrap_err();
        assert!(matches!(err, IoError::LengthMismatch { .. }));
    }

    #[test]
    fn missing_column_is_honored_when_present() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(
            &dir.path().join("X/s1.csv"),
            "M_TIMESTAMP,S_original,BU_original,missing\n0,1.0,1.0,false\n1,2.0,2.0,true\n",
        );
        write_csv(&dir.path().join("y/s1.csv"), "label\n0\n0\n");
        let batch = load_station_batch(dir.path()).unwrap();
        assert_eq!(batch.stations[0].missing, Some(vec![false, true]));
    }

    #[test]
    fn empty_x_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("X")).unwrap();
        std::fs::create_dir_all(dir.path().join("y")).unwrap();
        assert!(matches!(load_station_batch(dir.path()), Err(IoError::NoStations(_))));
    }
}
