use volume_io::{read_volume, write_volume, ElementType, Volume, VolumeError};

fn ramp(shape: [usize; 3]) -> Volume {
    let len = shape.iter().product::<usize>();
    // Values are computed in f32 so they are exactly representable on disk.
    let data = (0..len).map(|i| (i as f32 / len as f32) as f64).collect();
    Volume::new(shape, ElementType::F32, data).unwrap()
}

#[test]
fn mha_file_round_trips_voxel_for_voxel() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("case_t2w.mha");
    let volume = ramp([4, 4, 4]);

    write_volume(&volume, &path).unwrap();
    let loaded = read_volume(&path).unwrap();

    assert!(loaded.same_voxels(&volume));
    assert_eq!(loaded.element_type(), ElementType::F32);
    assert_eq!(loaded.source(), Some(path.as_path()));
}

#[test]
fn nifti_gz_file_round_trips_voxel_for_voxel() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("prediction.nii.gz");
    let volume = ramp([3, 5, 2]);

    write_volume(&volume, &path).unwrap();
    let loaded = read_volume(&path).unwrap();

    assert!(loaded.same_voxels(&volume));
}

#[test]
fn nifti_source_can_be_restaged_as_mha() {
    let dir = tempfile::tempdir().unwrap();
    let nifti = dir.path().join("adc.nii");
    let mha = dir.path().join("case_adc.mha");
    let volume = Volume::new([1, 2, 2], ElementType::I16, vec![-5.0, 0.0, 900.0, 1200.0]).unwrap();

    write_volume(&volume, &nifti).unwrap();
    write_volume(&read_volume(&nifti).unwrap(), &mha).unwrap();

    let restaged = read_volume(&mha).unwrap();
    assert!(restaged.same_voxels(&volume));
    assert_eq!(restaged.element_type(), ElementType::I16);
}

#[test]
fn unknown_extension_is_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scan.dcm");
    std::fs::write(&path, b"DICM").unwrap();

    let err = read_volume(&path).unwrap_err();
    assert!(matches!(err, VolumeError::UnsupportedFormat { .. }));
}

#[test]
fn missing_file_reports_io_error_with_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.mha");

    let err = read_volume(&path).unwrap_err();
    assert!(matches!(err, VolumeError::Io { .. }));
    assert!(err.to_string().contains("absent.mha"));
}

#[test]
fn corrupt_mha_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("corrupt.mha");
    std::fs::write(&path, b"this is not a volume").unwrap();

    assert!(read_volume(&path).is_err());
}
