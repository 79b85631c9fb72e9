//! Scan profile export with clean feature flag handling.
use crate::error::{ScanResult, ScannerError};
use crate::scan::ScanProfile;
use std::path::Path;

/// Pretty-printed JSON of the whole profile.
pub fn to_json(profile: &ScanProfile) -> ScanResult<String> {
    serde_json::to_string_pretty(profile)
        .map_err(|e| ScannerError::Export(format!("Failed to serialize profile to JSON: {}", e)))
}

// ============================================================================
// CSV Writer
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use serde::Serialize;
    use std::fs::File;
    use std::io::Write;
    use tracing::info;

    /// Descriptive header written ahead of the layer table.
    #[derive(Debug, Serialize)]
    struct ProfileSummary {
        captured_at: String,
        layer_height: f64,
        layers: usize,
        total_volume: f64,
    }

    impl ProfileSummary {
        fn new(profile: &ScanProfile) -> Self {
            Self {
                captured_at: profile.captured_at.to_rfc3339(),
                layer_height: profile.layer_height,
                layers: profile.len(),
                total_volume: profile.total_volume(),
            }
        }
    }

    /// Write `profile` to `path` as `layer,height,volume,radius` rows.
    ///
    /// The table is preceded by `# `-prefixed JSON describing the scan. The
    /// radius column is empty when the profile has fewer than two layers.
    pub fn write_csv(profile: &ScanProfile, path: &Path) -> ScanResult<()> {
        let radii = profile.radii().ok();

        let mut file = File::create(path)?;
        let summary = serde_json::to_string_pretty(&ProfileSummary::new(profile))
            .map_err(|e| ScannerError::Export(format!("Failed to serialize summary: {}", e)))?;
        for line in summary.lines() {
            file.write_all(b"# ")
                .and_then(|_| file.write_all(line.as_bytes()))
                .and_then(|_| file.write_all(b"\n"))?;
        }

        let mut writer = csv::Writer::from_writer(file);
        writer
            .write_record(["layer", "height", "volume", "radius"])
            .map_err(csv_error)?;

        for (layer, (height, volume)) in profile.heights.iter().zip(&profile.volumes).enumerate() {
            let radius = radii
                .as_ref()
                .and_then(|r| r.get(layer))
                .map_or(String::new(), |r| r.to_string());
            writer
                .write_record(&[
                    layer.to_string(),
                    height.to_string(),
                    volume.to_string(),
                    radius,
                ])
                .map_err(csv_error)?;
        }
        writer.flush()?;

        info!(path = %path.display(), layers = profile.len(), "Scan profile written");
        Ok(())
    }

    fn csv_error(e: csv::Error) -> ScannerError {
        ScannerError::Export(format!("Failed to write CSV record: {}", e))
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;

    /// CSV export is not compiled into this build.
    pub fn write_csv(_profile: &ScanProfile, _path: &Path) -> ScanResult<()> {
        Err(ScannerError::FeatureNotEnabled("storage_csv".to_string()))
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::write_csv;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::write_csv;

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> ScanProfile {
        ScanProfile::from_measurements(&[0.0, 10.0, 25.0], &[0.0, 2.0, 4.0], 1.0, 2.0).unwrap()
    }

    #[test]
    fn test_json_contains_series() {
        let json = to_json(&profile()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["volumes"], serde_json::json!([10.0, 15.0]));
        assert_eq!(value["heights"], serde_json::json!([0.0, 2.0]));
        assert_eq!(value["layer_height"], 2.0);
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn test_csv_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.csv");
        write_csv(&profile(), &path).unwrap();

        let mut reader = csv::ReaderBuilder::new()
            .comment(Some(b'#'))
            .from_path(&path)
            .unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec!["layer", "height", "volume", "radius"]
        );

        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[1][0], "1");
        assert_eq!(&rows[1][2], "15");
        let radius: f64 = rows[0][3].parse().unwrap();
        let expected = (10.0 / (2.0 * std::f64::consts::PI)).sqrt();
        assert!((radius - expected).abs() < 1e-12);
    }
}
