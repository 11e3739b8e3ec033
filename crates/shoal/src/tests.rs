use std::io::Write as _;

use shoal_sim::SimDrive;
use shoal_types::ClusterLimits;

use super::*;

// ============================================================================
// Path parsing
// ============================================================================

#[test]
fn parse_valid_path() {
    let (cluster, name) = FileIo::parse_path("kinetic://alpha/logs/app.log").unwrap();
    assert_eq!(cluster, "alpha");
    assert_eq!(name, "logs/app.log");
}

#[test]
fn parse_rejects_malformed_paths() {
    for path in [
        "kinetic:/alpha/name",
        "http://alpha/name",
        "kinetic://alpha",
        "kinetic:///name",
        "kinetic://alpha/",
        "",
    ] {
        let err = FileIo::parse_path(path).unwrap_err();
        assert!(matches!(err, ShoalError::InvalidPath(_)), "path {path:?}");
        assert_eq!(err.to_errno(), libc::EINVAL);
    }
}

#[test]
fn errno_mapping() {
    assert_eq!(
        ShoalError::UnknownCluster("x".into()).to_errno(),
        libc::ENODEV
    );
    assert_eq!(
        ShoalError::NotConnected("x".into()).to_errno(),
        libc::ENXIO
    );
    assert_eq!(ShoalError::Io("x".into()).to_errno(), libc::EIO);
    assert_eq!(
        ShoalError::InvalidArgument("x".into()).to_errno(),
        libc::EINVAL
    );
}

// ============================================================================
// Configuration
// ============================================================================

const LOCATIONS: &str = r#"[
    {"wwn": "d0", "inet4": [{"host": "10.0.0.1", "port": 8123}, {"host": "10.0.1.1", "port": 8123}]},
    {"wwn": "d1", "inet4": [{"host": "10.0.0.2", "port": 8123}]}
]"#;

const SECURITY: &str = r#"[
    {"wwn": "d0", "userId": "tester", "key": "hush"},
    {"wwn": "d1", "userId": "tester", "key": "hush"}
]"#;

const DEFINITION: &str = r#"{
    "configuration": {
        "cacheCapacity": 1000000,
        "readaheadWindow": 8,
        "maxBackgroundIoThreads": 2,
        "maxBackgroundIoQueue": 16
    },
    "clusters": [
        {
            "clusterID": "alpha",
            "numData": 1,
            "numParity": 1,
            "chunkSizeKB": 1024,
            "minReconnectInterval": 2,
            "timeout": 5,
            "drives": [{"wwn": "d0"}, {"wwn": "d1"}]
        }
    ]
}"#;

#[test]
fn config_parses_and_merges_security() {
    let config = Config::from_json(LOCATIONS, SECURITY, DEFINITION).unwrap();

    assert_eq!(config.settings.cache_capacity, 1_000_000);
    // Unspecified target defaults to 70% of capacity.
    assert_eq!(config.settings.cache_target_size, 700_000);
    assert_eq!(config.settings.readahead_window, 8);

    let (primary, secondary) = &config.drives["d0"];
    assert_eq!(primary.host, "10.0.0.1");
    assert_eq!(secondary.host, "10.0.1.1");
    assert_eq!(primary.user_id.as_deref(), Some("tester"));
    assert_eq!(primary.secret.as_deref(), Some("hush"));

    // A single-homed drive uses its one endpoint for both slots.
    let (primary, secondary) = &config.drives["d1"];
    assert_eq!(primary.host, secondary.host);

    let alpha = &config.clusters["alpha"];
    assert_eq!(alpha.num_data, 1);
    assert_eq!(alpha.num_parity, 1);
    assert_eq!(alpha.drives, vec!["d0".to_owned(), "d1".to_owned()]);
    assert_eq!(alpha.operation_timeout.as_secs(), 5);
}

#[test]
fn config_rejects_unknown_drive_reference() {
    let definition = DEFINITION.replace("\"d1\"", "\"ghost\"");
    let err = Config::from_json(LOCATIONS, SECURITY, &definition).unwrap_err();
    assert!(matches!(err, ShoalError::Config(_)));
    assert_eq!(err.to_errno(), libc::EINVAL);
}

#[test]
fn config_rejects_garbage_documents() {
    assert!(matches!(
        Config::from_json("not json", SECURITY, DEFINITION),
        Err(ShoalError::Config(_))
    ));
    assert!(matches!(
        Config::from_json(LOCATIONS, SECURITY, "[]"),
        Err(ShoalError::Config(_))
    ));
}

#[test]
fn config_loads_from_env_with_file_indirection() {
    let mut location_file = tempfile::NamedTempFile::new().unwrap();
    location_file.write_all(LOCATIONS.as_bytes()).unwrap();

    std::env::set_var(
        config::ENV_DRIVE_LOCATION,
        location_file.path().as_os_str(),
    );
    std::env::set_var(config::ENV_DRIVE_SECURITY, SECURITY);
    std::env::set_var(config::ENV_CLUSTER_DEFINITION, DEFINITION);

    let config = Config::from_env().unwrap();
    assert!(config.clusters.contains_key("alpha"));
    assert_eq!(config.drives.len(), 2);
}

// ============================================================================
// File I/O against the simulator
// ============================================================================

fn test_library(drives: &[SimDrive], num_data: usize, num_parity: usize) -> Library {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let locations: Vec<String> = drives
        .iter()
        .enumerate()
        .map(|(i, d)| {
            format!(
                r#"{{"wwn": "d{i}", "inet4": [{{"host": "127.0.0.1", "port": {}}}]}}"#,
                d.addr().port()
            )
        })
        .collect();
    let locations = format!("[{}]", locations.join(","));

    let security: Vec<String> = (0..drives.len())
        .map(|i| format!(r#"{{"wwn": "d{i}", "userId": "tester", "key": "hush"}}"#))
        .collect();
    let security = format!("[{}]", security.join(","));

    let members: Vec<String> = (0..drives.len())
        .map(|i| format!(r#"{{"wwn": "d{i}"}}"#))
        .collect();
    let definition = format!(
        r#"{{
            "configuration": {{
                "cacheCapacity": 65536,
                "readaheadWindow": 4,
                "maxBackgroundIoThreads": 1,
                "maxBackgroundIoQueue": 8
            }},
            "clusters": [{{
                "clusterID": "alpha",
                "numData": {num_data},
                "numParity": {num_parity},
                "chunkSizeKB": 1,
                "minReconnectInterval": 1,
                "timeout": 2,
                "drives": [{}]
            }}]
        }}"#,
        members.join(",")
    );

    let config = Config::from_json(&locations, &security, &definition).unwrap();
    Library::from_config(config).unwrap()
}

fn small_fleet() -> Vec<SimDrive> {
    (0..3)
        .map(|_| {
            SimDrive::with_limits(ClusterLimits {
                max_key_size: 4096,
                max_value_size: 64,
                max_version_size: 4096,
            })
            .unwrap()
        })
        .collect()
}

#[test]
fn file_roundtrip_across_blocks() {
    let drives = small_fleet();
    let library = test_library(&drives, 2, 1);
    let file = library.make_file_io("kinetic://alpha/data.bin").unwrap();

    // Logical block size is 2 * 64 = 128; 300 bytes span three blocks.
    let payload: Vec<u8> = (0..300_u32).map(|i| (i % 241) as u8).collect();
    assert_eq!(file.write(0, &payload).unwrap(), 300);
    file.flush().unwrap();
    assert_eq!(file.size().unwrap(), 300);

    let mut read_back = vec![0_u8; 300];
    assert_eq!(file.read(0, &mut read_back).unwrap(), 300);
    assert_eq!(read_back, payload);

    // Short read at end of file.
    let mut tail = [0_u8; 20];
    assert_eq!(file.read(290, &mut tail).unwrap(), 10);
    assert_eq!(&tail[..10], &payload[290..]);
    assert_eq!(file.read(300, &mut tail).unwrap(), 0);
}

#[test]
fn file_truncate_and_remove() {
    let drives = small_fleet();
    let library = test_library(&drives, 2, 1);
    let file = library.make_file_io("kinetic://alpha/trunc.bin").unwrap();

    let payload = vec![7_u8; 300];
    file.write(0, &payload).unwrap();
    file.flush().unwrap();

    file.truncate(100).unwrap();
    assert_eq!(file.size().unwrap(), 100);

    // Reads past the truncation point hit end of file.
    let mut buf = [0_u8; 64];
    assert_eq!(file.read(100, &mut buf).unwrap(), 0);

    file.remove().unwrap();
    assert_eq!(file.size().unwrap(), 0);
    for drive in &drives {
        assert_eq!(drive.key_count(), 0);
    }
}

#[test]
fn file_overwrite_updates_content() {
    let drives = small_fleet();
    let library = test_library(&drives, 2, 1);
    let file = library.make_file_io("kinetic://alpha/edit.bin").unwrap();

    file.write(0, &[b'a'; 200]).unwrap();
    file.flush().unwrap();
    file.write(64, b"PATCH").unwrap();
    file.flush().unwrap();

    let mut read_back = vec![0_u8; 200];
    assert_eq!(file.read(0, &mut read_back).unwrap(), 200);
    assert_eq!(&read_back[..64], &[b'a'; 64][..]);
    assert_eq!(&read_back[64..69], b"PATCH");
    assert_eq!(&read_back[69..], &[b'a'; 131][..]);
}

#[test]
fn unknown_cluster_is_enodev() {
    let drives = small_fleet();
    let library = test_library(&drives, 2, 1);
    let err = library
        .make_file_io("kinetic://missing/file")
        .unwrap_err();
    assert!(matches!(err, ShoalError::UnknownCluster(_)));
    assert_eq!(err.to_errno(), libc::ENODEV);
}

#[test]
fn two_files_share_the_cache() {
    let drives = small_fleet();
    let library = test_library(&drives, 2, 1);

    let writer = library.make_file_io("kinetic://alpha/shared").unwrap();
    writer.write(0, b"cross-file visibility").unwrap();
    writer.flush().unwrap();

    let reader = library.make_file_io("kinetic://alpha/shared").unwrap();
    let mut buf = [0_u8; 21];
    assert_eq!(reader.read(0, &mut buf).unwrap(), 21);
    assert_eq!(&buf, b"cross-file visibility");
}
