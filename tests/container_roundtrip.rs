//! End-to-end create, write, reopen and read tests
//!
//! Every test works in its own temporary directory.

use hfa_rs::{
    Access, ColorTable, Container, Coordinate, CreateOptions, Datum, DatumKind, HfaError, LayerType, MapInfo,
    PixelType, ProParameters, Spheroid,
};
use tempfile::TempDir;

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn test_multi_band_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bands.img");

    let mut img = Container::create(&path, 150, 90, 3, PixelType::U16, &CreateOptions::default()).unwrap();
    let block_len = 64 * 64 * 2;
    for band in 0..3 {
        img.write_block(band, 2, 1, &pattern(block_len, band as u8)).unwrap();
    }
    img.close().unwrap();

    let mut img = Container::open(&path, Access::ReadOnly).unwrap();
    assert_eq!((img.width(), img.height(), img.band_count()), (150, 90, 3));
    assert_eq!(img.pixel_type(2).unwrap(), PixelType::U16);
    for band in 0..3 {
        assert_eq!(img.read_block(band, 2, 1).unwrap(), pattern(block_len, band as u8));
        assert_eq!(img.read_block(band, 0, 0).unwrap(), vec![0u8; block_len]);
    }
}

#[test]
fn test_compressed_blocks_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("rle.img");
    let options = CreateOptions {
        compressed: true,
        ..CreateOptions::default()
    };

    let mut img = Container::create(&path, 128, 64, 1, PixelType::F32, &options).unwrap();
    assert!(img.is_compressed(0).unwrap());

    let flat: Vec<u8> = std::iter::repeat(1.5f32.to_ne_bytes()).take(64 * 64).flatten().collect();
    let noisy: Vec<u8> = (0..64 * 64).flat_map(|i| (i as f32 * 0.25).to_ne_bytes()).collect();
    img.write_block(0, 0, 0, &flat).unwrap();
    img.write_block(0, 1, 0, &noisy).unwrap();
    // Rewriting with data that compresses worse must move the block
    img.write_block(0, 0, 0, &noisy).unwrap();
    img.close().unwrap();

    let mut img = Container::open(&path, Access::ReadOnly).unwrap();
    assert_eq!(img.read_block(0, 0, 0).unwrap(), noisy);
    assert_eq!(img.read_block(0, 1, 0).unwrap(), noisy);
}

#[test]
fn test_nodata_fills_unwritten_blocks() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nodata.img");

    let mut img = Container::create(&path, 64, 64, 1, PixelType::S16, &CreateOptions::default()).unwrap();
    img.set_nodata(0, -9999.0).unwrap();
    img.close().unwrap();

    let mut img = Container::open(&path, Access::ReadOnly).unwrap();
    assert_eq!(img.nodata(0).unwrap(), Some(-9999.0));
    let block = img.read_block(0, 0, 0).unwrap();
    assert!(block
        .chunks_exact(2)
        .all(|c| i16::from_ne_bytes([c[0], c[1]]) == -9999));
}

#[test]
fn test_thematic_band_with_colors() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("classes.img");

    let mut img = Container::create(&path, 64, 64, 1, PixelType::U8, &CreateOptions::default()).unwrap();
    let table = ColorTable {
        red: vec![1.0, 0.0, 0.0],
        green: vec![0.0, 1.0, 0.0],
        blue: vec![0.0, 0.0, 1.0],
        alpha: vec![1.0, 1.0, 0.5],
    };
    img.set_color_table(0, &table).unwrap();
    img.set_metadata(
        Some(0),
        &[("CLASS_SOURCE".to_string(), "survey 2019".to_string())],
    )
    .unwrap();
    img.set_metadata(None, &[("AREA_OR_POINT".to_string(), "Area".to_string())])
        .unwrap();
    img.close().unwrap();

    let mut img = Container::open(&path, Access::ReadOnly).unwrap();
    assert_eq!(img.layer_type(0).unwrap(), Some(LayerType::Thematic));
    assert_eq!(img.color_table(0).unwrap(), Some(table));
    assert_eq!(
        img.metadata(Some(0)).unwrap(),
        vec![("CLASS_SOURCE".to_string(), "survey 2019".to_string())]
    );
    assert_eq!(
        img.metadata(None).unwrap(),
        vec![("AREA_OR_POINT".to_string(), "Area".to_string())]
    );
}

#[test]
fn test_georeferencing_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("utm.img");

    let mut img = Container::create(&path, 100, 100, 2, PixelType::U8, &CreateOptions::default()).unwrap();
    let info = MapInfo {
        projection: "UTM".to_string(),
        upper_left: Coordinate { x: 500015.0, y: 4199985.0 },
        lower_right: Coordinate { x: 502985.0, y: 4197015.0 },
        pixel_width: 30.0,
        pixel_height: 30.0,
        units: "meters".to_string(),
    };
    let pro = ProParameters {
        number: 1,
        name: "UTM".to_string(),
        zone: 11,
        params: [0.0; 15],
        spheroid: Spheroid {
            name: "WGS 84".to_string(),
            a: 6378137.0,
            b: 6356752.314245,
            e_squared: 0.00669437999,
            radius: 6378137.0,
        },
        ..ProParameters::default()
    };
    let datum = Datum {
        name: "WGS 84".to_string(),
        kind: DatumKind::Parametric,
        params: [0.0; 7],
        grid_name: None,
    };
    img.set_map_info(&info).unwrap();
    img.set_pro_parameters(&pro).unwrap();
    img.set_datum(&datum).unwrap();
    img.close().unwrap();

    let mut img = Container::open(&path, Access::ReadOnly).unwrap();
    assert_eq!(img.map_info().unwrap(), Some(info));
    assert_eq!(img.pro_parameters().unwrap(), Some(pro));
    assert_eq!(img.datum().unwrap(), Some(datum));
    assert_eq!(
        img.geo_transform().unwrap(),
        Some([500000.0, 30.0, 0.0, 4200000.0, 0.0, -30.0])
    );
}

#[test]
fn test_pe_string_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("esri.img");
    let pe = "PROJCS[\"NAD_1983_UTM_Zone_10N\",GEOGCS[\"GCS_North_American_1983\",\
              DATUM[\"D_North_American_1983\",SPHEROID[\"GRS_1980\",6378137.0,298.257222101]]]]";

    let mut img = Container::create(&path, 64, 64, 2, PixelType::U8, &CreateOptions::default()).unwrap();
    assert_eq!(img.pe_string().unwrap(), None);
    img.set_pe_string(pe).unwrap();
    img.close().unwrap();

    let mut img = Container::open(&path, Access::ReadOnly).unwrap();
    assert_eq!(img.pe_string().unwrap().as_deref(), Some(pe));
    // Every band carries its own copy
    assert_eq!(img.dump_tree().unwrap().matches("ProjectionX(Eprj_MapProjection842)").count(), 2);
    assert!(matches!(img.set_pe_string(""), Err(HfaError::ReadOnly)));
}

#[test]
fn test_empty_pe_string_adds_nothing() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("plain.img");

    let mut img = Container::create(&path, 64, 64, 1, PixelType::U8, &CreateOptions::default()).unwrap();
    img.set_pe_string("").unwrap();
    assert!(!img.dump_tree().unwrap().contains("ProjectionX"));
    img.close().unwrap();

    let mut img = Container::open(&path, Access::ReadOnly).unwrap();
    assert_eq!(img.pe_string().unwrap(), None);
}

#[test]
fn test_update_in_place() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("edit.img");

    let img = Container::create(&path, 64, 64, 1, PixelType::U8, &CreateOptions::default()).unwrap();
    img.close().unwrap();

    let mut img = Container::open(&path, Access::Update).unwrap();
    img.write_block(0, 0, 0, &pattern(64 * 64, 5)).unwrap();
    img.set_band_name(0, "Elevation").unwrap();
    img.close().unwrap();

    let mut img = Container::open(&path, Access::ReadOnly).unwrap();
    assert_eq!(img.band_name(0).unwrap(), "Elevation");
    assert_eq!(img.read_block(0, 0, 0).unwrap(), pattern(64 * 64, 5));
}

#[test]
fn test_block_outside_grid() {
    let dir = TempDir::new().unwrap();
    let mut img = Container::create(
        dir.path().join("small.img"),
        64,
        64,
        1,
        PixelType::U8,
        &CreateOptions::default(),
    )
    .unwrap();
    assert!(matches!(img.read_block(0, 1, 0), Err(HfaError::InvalidArgument(_))));
    assert!(matches!(
        img.write_block(0, 0, 0, &[0u8; 10]),
        Err(HfaError::InvalidArgument(_))
    ));
}
