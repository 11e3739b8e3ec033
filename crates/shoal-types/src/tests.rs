use proptest::prelude::*;

use super::*;

#[test]
fn version_encodes_size() {
    let v = ValueVersion::generate(8_388_608);
    assert_eq!(v.decode_size(), 8_388_608);
    assert_eq!(v.as_bytes().len(), 24);
}

#[test]
fn version_is_unique_per_generation() {
    let a = ValueVersion::generate(42);
    let b = ValueVersion::generate(42);
    assert_ne!(a, b);
    assert_eq!(a.decode_size(), b.decode_size());
}

#[test]
fn malformed_version_decodes_zero() {
    let v = ValueVersion::from_bytes(vec![1_u8, 2, 3]);
    assert_eq!(v.decode_size(), 0);
    let empty = ValueVersion::from_bytes(Vec::new());
    assert_eq!(empty.decode_size(), 0);
}

#[test]
fn version_roundtrips_through_raw_bytes() {
    let v = ValueVersion::generate(1234);
    let raw = v.to_vec();
    let back = ValueVersion::from_bytes(raw);
    assert_eq!(back, v);
    assert_eq!(back.decode_size(), 1234);
}

#[test]
fn block_key_layout() {
    assert_eq!(&block_key("kinetic:cl:file", 0)[..], b"kinetic:cl:file_0");
    assert_eq!(&block_key("f", 17)[..], b"f_17");
}

#[test]
fn status_display() {
    let status = DriveStatus::new(StatusCode::IoError, "network timeout");
    assert_eq!(status.to_string(), "IO_ERROR: network timeout");
    assert!(!status.is_ok());
    assert_eq!(DriveStatus::ok().to_string(), "OK");
}

proptest! {
    #[test]
    fn version_size_roundtrip(size in any::<u64>()) {
        let v = ValueVersion::generate(size);
        prop_assert_eq!(v.decode_size(), size);
    }
}
