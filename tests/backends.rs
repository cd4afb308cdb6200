use std::path::Path;
use superio::factory::select_by_extension;
use superio::{
    ArrayInfo, ArrayIo, AttrValue, Backend, BackendKind, DistArray, LocalCluster, SelfComm,
    TypeTag,
};

fn floats(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn ramp(index: &[usize]) -> f32 {
    index.iter().fold(0.0, |acc, &i| acc * 10.0 + i as f32)
}

fn open_write(ext: &str, base: &Path) -> Box<dyn Backend> {
    let mut io = select_by_extension(ext, None, SelfComm::shared()).unwrap();
    assert!(io.open_write(base), "{}", io.errors().drain());
    io
}

#[test]
fn test_var_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("test");
    let values: Vec<f32> = (0..60).map(|v| v as f32 * 0.5).collect();
    let info = ArrayInfo::serial(TypeTag::Float, &[3, 4, 5]).unwrap();

    let mut io = open_write("hdf", &base);
    assert!(io.write_variable("testVar", "testData", &info, &floats(&values)));
    assert!(io.write_attribute("units", "testData/testVar", &AttrValue::from("megaTests")));
    assert!(io.close());
    assert!(dir.path().join("test.hdf").exists());

    assert!(io.open_read(&base));
    assert_eq!(io.super_size(), Some(1));
    assert_eq!(io.variable_names(), vec!["testData/testVar".to_string()]);
    assert_eq!(io.attribute_names(), vec!["superSize".to_string(), "rank".to_string()]);

    let mut stored = ArrayInfo::default();
    assert!(io.get_local_array_info("testData/testVar", &mut stored));
    assert_eq!(stored.data_type, TypeTag::Float);
    assert_eq!(stored.global(), &[3, 4, 5]);
    assert_eq!(stored.n_vars, 1);
    assert_eq!(stored.bytes, 240);

    let mut buffer = vec![0u8; 240];
    assert!(io.read_variable("testVar", "testData", &info, &mut buffer));
    assert_eq!(buffer, floats(&values));
    assert_eq!(
        io.read_attribute("units", "testData/testVar"),
        Some(AttrValue::Str("megaTests".into()))
    );
    assert!(io.close());
}

#[test]
fn rank_mismatch_is_reported_without_touching_the_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("test");
    let info = ArrayInfo::serial(TypeTag::Float, &[3, 4, 5]).unwrap();

    let mut io = open_write("dmp", &base);
    assert!(io.write_variable("testVar", "testData", &info, &floats(&[1.0; 60])));
    assert!(io.close());

    assert!(io.open_read(&base));
    let flat = ArrayInfo::serial(TypeTag::Float, &[12, 5]).unwrap();
    let mut buffer = vec![7u8; 240];
    assert!(!io.read_variable("testVar", "testData", &flat, &mut buffer));
    assert!(buffer.iter().all(|&b| b == 7));

    let report = io.errors().drain();
    assert!(report.contains("testData/testVar"));
    assert!(report.contains("stored rank 3 but descriptor rank 2"));
    assert!(io.errors().is_empty());

    let wider = ArrayInfo::serial(TypeTag::Float, &[3, 4, 6]).unwrap();
    assert!(!io.verify_shape("testVar", "testData", &wider));
    let report = io.errors().drain();
    assert!(report.contains("Dim 2: expect 5 have 6"));
}

#[test]
fn attributes_are_replaced_not_appended() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("attrs");

    let mut io = open_write("hdf4", &base);
    assert!(io.write_attribute("note", "meta", &AttrValue::from("first value")));
    assert!(io.write_attribute("count", "meta", &AttrValue::from(vec![1i32, 2, 3])));
    assert!(io.write_attribute("note", "meta", &AttrValue::from("short")));
    assert!(io.write_attribute("note", "meta", &AttrValue::from("short")));
    assert!(io.close());

    assert!(io.open_read(&base));
    let note = io.read_attribute("note", "meta").unwrap();
    assert_eq!(note, AttrValue::Str("short".into()));
    assert_eq!(note.len(), 5);
    assert_eq!(
        io.read_attribute("count", "meta"),
        Some(AttrValue::Int(vec![1, 2, 3]))
    );
    assert!(io.read_attribute("missing", "meta").is_none());
    assert!(io.errors().drain().contains("Attribute missing does not exist"));
}

#[test]
fn diagnostics_drain_in_order() {
    let mut io = select_by_extension("hdf4", None, SelfComm::shared()).unwrap();
    let info = ArrayInfo::serial(TypeTag::Int, &[2]).unwrap();
    assert!(!io.write_variable("a", "", &info, &[0; 8]));
    assert!(io.close());
    assert_eq!(io.errors().len(), 1);
    assert!(!io.open_read(Path::new("/nonexistent/superio/run")));

    let report = io.errors().drain();
    let lines: Vec<&str> = report.lines().collect();
    assert!(lines[0].starts_with("write a: File is not open for write"));
    assert!(lines.last().unwrap().contains("/nonexistent/superio/run"));
    assert!(io.errors().drain().is_empty());
}

#[test]
fn superdomain_regathers_four_writers_onto_two_files_for_three_readers() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("restart");
    let dims = [16, 15, 13];

    LocalCluster::new(4)
        .run(|comm| {
            let mut array = DistArray::<f32>::new(comm.clone(), &dims).unwrap();
            array.fill_with(ramp);
            let mut io = select_by_extension("hdf4", Some(2), comm).unwrap();
            assert!(io.open_write(&base));
            assert_eq!(io.super_size(), Some(2));
            ArrayIo::new(io.as_mut())
                .write_var_units("rho", "fluid", &array, "amu/cc")
                .unwrap();
            assert!(io.close());
        })
        .unwrap();
    assert!(dir.path().join("restart_0.hdf4").exists());
    assert!(dir.path().join("restart_1.hdf4").exists());
    assert!(!dir.path().join("restart_2.hdf4").exists());

    let results = LocalCluster::new(3)
        .run(|comm| {
            let mut array = DistArray::<f32>::new(comm.clone(), &dims).unwrap();
            let mut io = select_by_extension("hdf4", None, comm).unwrap();
            assert!(io.open_read(&base));
            let units = ArrayIo::new(io.as_mut())
                .read_var_units("rho", "fluid", &mut array)
                .unwrap();
            let super_size = io.super_size();
            assert!(io.close());

            let start = array.region().start.clone();
            let wrong = array
                .local()
                .indexed_iter()
                .filter(|(local, value)| {
                    let index: Vec<usize> = (0..3).map(|a| start[a] + local[a]).collect();
                    **value != ramp(&index)
                })
                .count();
            (units, super_size, array.local().len(), wrong)
        })
        .unwrap();

    let mut total = 0;
    for (units, super_size, len, wrong) in results {
        assert_eq!(units.as_deref(), Some("amu/cc"));
        assert_eq!(super_size, Some(2));
        assert_eq!(wrong, 0);
        total += len;
    }
    assert_eq!(total, 16 * 15 * 13);
}

#[test]
fn stored_superdomain_larger_than_readers_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("wide");

    LocalCluster::new(3)
        .run(|comm| {
            let mut io = select_by_extension("hdf4", None, comm).unwrap();
            assert!(io.open_write(&base));
            assert!(io.close());
        })
        .unwrap();

    let abort = LocalCluster::new(2)
        .run(|comm| {
            let mut io = select_by_extension("hdf4", None, comm).unwrap();
            io.open_read(&base)
        })
        .unwrap_err();
    assert!(abort.reason.contains("Superdomain size 3 exceeds live process count 2"));
}

#[test]
fn typed_read_of_a_different_shape_aborts_the_group() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("shape");

    LocalCluster::new(2)
        .run(|comm| {
            let array = DistArray::<i32>::new(comm.clone(), &[8, 4]).unwrap();
            let mut io = select_by_extension("hdf4", None, comm).unwrap();
            assert!(io.open_write(&base));
            ArrayIo::new(io.as_mut()).write_variable("ids", "", &array).unwrap();
            assert!(io.close());
        })
        .unwrap();

    let abort = LocalCluster::new(2)
        .run(|comm| {
            let mut array = DistArray::<i32>::new(comm.clone(), &[8, 5]).unwrap();
            let mut io = select_by_extension("hdf4", None, comm).unwrap();
            assert!(io.open_read(&base));
            let _ = ArrayIo::new(io.as_mut()).read_variable("ids", "", &mut array);
        })
        .unwrap_err();
    assert!(abort.reason.contains("Failed to read ids"));
}

#[test]
fn factory_covers_every_extension() {
    let expected = [
        ("hdf", BackendKind::Legacy),
        ("dmp", BackendKind::Legacy),
        ("hdf4", BackendKind::SequentialV1),
        ("hdf5", BackendKind::SequentialV2),
        ("phdf5", BackendKind::Parallel),
    ];
    for (ext, kind) in expected {
        let io = select_by_extension(ext, None, SelfComm::shared()).unwrap();
        assert_eq!(io.kind(), kind);
    }
    assert!(select_by_extension("h5", None, SelfComm::shared()).is_none());
}

const FIXED_WIDTH: [TypeTag; 7] = [
    TypeTag::Byte,
    TypeTag::Char,
    TypeTag::Short,
    TypeTag::Int,
    TypeTag::Long,
    TypeTag::Float,
    TypeTag::Double,
];

/// `len` distinct elements of type `tag` as native bytes.
fn sample(tag: TypeTag, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len * tag.size_of());
    for i in 0..len {
        match tag {
            TypeTag::Byte => out.push(i as u8),
            TypeTag::Char => out.extend_from_slice(&(i as i8 - 64).to_ne_bytes()),
            TypeTag::Short => out.extend_from_slice(&(i as i16 * -3).to_ne_bytes()),
            TypeTag::Int => out.extend_from_slice(&(i as i32 * 1001).to_ne_bytes()),
            TypeTag::Long => out.extend_from_slice(&(i as i64 * -(1 << 40)).to_ne_bytes()),
            TypeTag::Float => out.extend_from_slice(&(i as f32 * 0.25).to_ne_bytes()),
            TypeTag::Double => out.extend_from_slice(&(i as f64 / 3.0).to_ne_bytes()),
            other => panic!("{other} has no fixed width"),
        }
    }
    out
}

#[test]
fn every_type_and_rank_round_trips_on_every_backend() {
    let dir = tempfile::tempdir().unwrap();
    let extents = [3, 2, 4, 1, 2, 2];

    for ext in ["hdf", "dmp", "hdf4", "hdf5", "phdf5"] {
        let base = dir.path().join(format!("matrix_{ext}"));
        let mut io = select_by_extension(ext, None, SelfComm::shared()).unwrap();
        if !io.is_enabled() {
            continue;
        }

        assert!(io.open_write(&base), "{ext}: {}", io.errors().drain());
        for tag in FIXED_WIDTH {
            for rank in 1..=6 {
                let dims = &extents[..rank];
                let info = ArrayInfo::serial(tag, dims).unwrap();
                let data = sample(tag, info.local_len());
                let name = format!("v{rank}");
                assert!(
                    io.write_variable(&name, tag.name(), &info, &data),
                    "{ext} {tag} rank {rank}: {}",
                    io.errors().drain()
                );
            }
        }
        assert!(io.close(), "{ext}: {}", io.errors().drain());

        assert!(io.open_read(&base), "{ext}: {}", io.errors().drain());
        assert_eq!(io.variable_names().len(), FIXED_WIDTH.len() * 6);
        for tag in FIXED_WIDTH {
            for rank in 1..=6 {
                let dims = &extents[..rank];
                let info = ArrayInfo::serial(tag, dims).unwrap();
                let name = format!("v{rank}");
                let path = format!("{}/{name}", tag.name());

                let mut stored = ArrayInfo::default();
                assert!(io.get_local_array_info(&path, &mut stored), "{ext} {path}");
                assert_eq!(stored.data_type, tag, "{ext} {path}");
                assert_eq!(stored.global(), dims, "{ext} {path}");

                let mut out = vec![0u8; info.bytes];
                assert!(
                    io.read_variable(&name, tag.name(), &info, &mut out),
                    "{ext} {path}: {}",
                    io.errors().drain()
                );
                assert_eq!(out, sample(tag, info.local_len()), "{ext} {path}");
            }
        }
        assert!(io.close());
    }
}

#[cfg(not(feature = "netcdf"))]
#[test]
fn netcdf_backends_report_themselves_disabled() {
    let dir = tempfile::tempdir().unwrap();
    for ext in ["hdf5", "phdf5"] {
        let mut io = select_by_extension(ext, None, SelfComm::shared()).unwrap();
        assert!(!io.is_enabled());
        assert!(!io.open_write(&dir.path().join("off")));
        assert!(io.errors().drain().contains("is disabled in this build"));
        assert!(io.variable_names().is_empty());
        assert!(io.attribute_names().is_empty());
    }
}

#[cfg(feature = "netcdf")]
#[test]
fn shared_file_round_trip_through_netcdf() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("shared");
    let dims = [6, 5, 4];

    LocalCluster::new(4)
        .run(|comm| {
            let mut array = DistArray::<f32>::new(comm.clone(), &dims).unwrap();
            array.fill_with(ramp);
            let mut io = select_by_extension("phdf5", Some(2), comm).unwrap();
            assert!(io.open_write(&base), "{}", io.errors().drain());
            ArrayIo::new(io.as_mut())
                .write_variable("testVar", "testData", &array)
                .unwrap();
            assert!(io.close());
        })
        .unwrap();
    assert!(dir.path().join("shared.phdf5").exists());

    let wrong = LocalCluster::new(3)
        .run(|comm| {
            let mut array = DistArray::<f32>::new(comm.clone(), &dims).unwrap();
            let mut io = select_by_extension("phdf5", None, comm).unwrap();
            assert!(io.open_read(&base), "{}", io.errors().drain());
            ArrayIo::new(io.as_mut())
                .read_variable("testVar", "testData", &mut array)
                .unwrap();
            let start = array.region().start.clone();
            array
                .local()
                .indexed_iter()
                .filter(|(local, value)| {
                    let index: Vec<usize> = (0..3).map(|a| start[a] + local[a]).collect();
                    **value != ramp(&index)
                })
                .count()
        })
        .unwrap();
    assert!(wrong.iter().all(|&n| n == 0));
}

#[cfg(feature = "netcdf")]
#[test]
fn sequential_netcdf_shards_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("shards");
    let info = ArrayInfo::serial(TypeTag::Float, &[3, 4, 5]).unwrap();
    let values: Vec<f32> = (0..60).map(|v| v as f32).collect();

    let mut io = open_write("hdf5", &base);
    assert!(io.write_variable("testVar", "testData", &info, &floats(&values)));
    assert!(io.close());
    assert!(dir.path().join("shards_0.hdf5").exists());

    assert!(io.open_read(&base));
    let mut buffer = vec![0u8; 240];
    assert!(io.read_variable("testVar", "testData", &info, &mut buffer));
    assert_eq!(buffer, floats(&values));
}
