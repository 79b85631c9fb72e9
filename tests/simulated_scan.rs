//! End-to-end scan against the in-process instrument model.

use immersion_scanner::config::{ScannerConfig, SimulationConfig, TimingConfig, TransportKind};
use immersion_scanner::{export, Scanner};
use std::f64::consts::PI;

const RADIUS: f64 = 0.02;
const LAYER_HEIGHT: f64 = 0.01;

fn simulated_config() -> ScannerConfig {
    let mut config = ScannerConfig::default();
    config.transport.kind = TransportKind::Simulated;
    config.timing = TimingConfig::immediate();
    config.simulation = SimulationConfig {
        object_radius: RADIUS,
        ..SimulationConfig::default()
    };
    config.validate().unwrap();
    config
}

#[tokio::test]
async fn scan_recovers_cylinder_volume_and_radius() {
    let config = simulated_config();
    let mut scanner = Scanner::open(&config).await.unwrap();
    assert!(scanner.get_id().await.unwrap().starts_with("IMMERSION-SIM"));

    let profile = scanner.scan(LAYER_HEIGHT, 3, 200).await.unwrap();
    scanner.close().await.unwrap();

    let layer_volume = PI * RADIUS * RADIUS * LAYER_HEIGHT;
    assert_eq!(profile.len(), 3);
    for volume in &profile.volumes {
        assert!(
            (volume - layer_volume).abs() / layer_volume < 0.03,
            "layer volume {} too far from {}",
            volume,
            layer_volume
        );
    }
    for (i, height) in profile.heights.iter().enumerate() {
        assert!((height - i as f64 * LAYER_HEIGHT).abs() < 1e-12);
    }
    for radius in profile.radii().unwrap() {
        assert!((radius - RADIUS).abs() / RADIUS < 0.02);
    }
}

#[tokio::test]
async fn filtered_measurement_discards_outliers() {
    let mut config = simulated_config();
    config.simulation.outlier_probability = 0.03;
    let mut scanner = Scanner::open(&config).await.unwrap();

    scanner.set_motor_on().await.unwrap();
    scanner.move_to(-1600.0).await.unwrap();
    let result = scanner.measure_and_filter(500).await.unwrap();
    scanner.close().await.unwrap();

    assert_eq!(result.raw_samples.len(), 500);
    assert!(result.filtered_samples.len() < 500);
    let expected = PI * RADIUS * RADIUS * LAYER_HEIGHT;
    assert!((result.average - expected).abs() / expected < 0.03);
}

#[cfg(feature = "storage_csv")]
#[tokio::test]
async fn scan_exports_csv_and_json() {
    let config = simulated_config();
    let mut scanner = Scanner::open(&config).await.unwrap();
    let profile = scanner.scan(LAYER_HEIGHT, 2, 100).await.unwrap();
    scanner.close().await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scan.csv");
    export::write_csv(&profile, &path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("# {"));
    let table: Vec<&str> = text.lines().filter(|l| !l.starts_with('#')).collect();
    assert_eq!(table[0], "layer,height,volume,radius");
    assert_eq!(table.len(), 3);

    let json = export::to_json(&profile).unwrap();
    let json: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(json["volumes"].as_array().map(Vec::len), Some(2));
}
