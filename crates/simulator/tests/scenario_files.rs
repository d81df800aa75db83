use std::io::Write;

use simulator::{run, SimulationConfig};
use tempfile::{NamedTempFile, TempDir};

const SCENARIO: &str = r#"{
    "world_size": 2,
    "osd": {
        "optim_state_dict": {"layout": "OrigParams"},
        "sharding": {"aligned_numel": 4}
    },
    "units": [
        {"prefix": "block0", "params": [
            {"name": "weight", "shape": [3, 3]},
            {"name": "bias", "shape": [3]}
        ]},
        {"prefix": "block1", "params": [{"name": "weight", "shape": [2, 5]}]}
    ],
    "plain_params": [{"name": "scale", "shape": [1]}]
}"#;

#[test]
fn test_scenario_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(SCENARIO.as_bytes()).unwrap();

    let config = SimulationConfig::from_file(file.path()).unwrap();
    assert_eq!(config.units.len(), 2);
    assert_eq!(config.osd.sharding.aligned_numel, 4);

    let report = run(&config).unwrap();
    assert!(report.round_trip_ok());
    assert_eq!(report.ranks.len(), 2);
    for rank in &report.ranks {
        assert_eq!(rank.round_trip, Some(true));
        assert_eq!(rank.entries, 4);
    }
}

#[test]
fn test_report_written_as_json() {
    let mut config = SimulationConfig::from_json_str(SCENARIO).unwrap();
    config.osd.optim_state_dict.rank0_only = true;
    let report = run(&config).unwrap();
    assert_eq!(report.ranks[0].round_trip, Some(true));
    assert_eq!(report.ranks[1].round_trip, None);

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("report.json");
    report.write_to(&path).unwrap();
    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(written["world_size"], 2);
    assert_eq!(written["layout"], "OrigParams");
    assert_eq!(written["ranks"][1]["saver"], false);
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = TempDir::new().unwrap();
    let result = SimulationConfig::from_file(dir.path().join("absent.json"));
    assert!(matches!(result, Err(shard_core::Error::Io(_))));
}
