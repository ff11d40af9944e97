//! Overview discovery and creation across primary and dependent files

use hfa_rs::{Access, BandSource, Container, CreateOptions, HfaConfig, PixelType};
use tempfile::TempDir;

fn base_image(dir: &TempDir, name: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let img = Container::create(&path, 300, 200, 2, PixelType::U8, &CreateOptions::default()).unwrap();
    img.close().unwrap();
    path
}

#[test]
fn test_overviews_discovered_largest_first() {
    let dir = TempDir::new().unwrap();
    let path = base_image(&dir, "pyramid.img");

    let mut img = Container::open(&path, Access::Update).unwrap();
    for level in [8, 2, 4] {
        img.create_overview(1, level).unwrap();
    }
    img.close().unwrap();

    let mut img = Container::open(&path, Access::ReadOnly).unwrap();
    assert_eq!(img.overview_count(0).unwrap(), 0);
    assert_eq!(img.overview_count(1).unwrap(), 3);
    let widths: Vec<usize> = (0..3).map(|i| img.overview(1, i).unwrap().width()).collect();
    assert_eq!(widths, vec![150, 75, 38]);
    assert_eq!(img.overview(1, 2).unwrap().height(), 25);
}

#[test]
fn test_overviews_in_dependent_file() {
    let dir = TempDir::new().unwrap();
    let path = base_image(&dir, "scene.img");

    let config = HfaConfig {
        use_rrd: true,
        ..HfaConfig::default()
    };
    let mut img = Container::open_with(&path, Access::Update, config).unwrap();
    let first = img.create_overview(0, 2).unwrap();
    img.write_overview_block(0, first, 0, 0, &vec![42u8; 64 * 64]).unwrap();
    img.create_overview(1, 2).unwrap();
    img.close().unwrap();

    let rrd = dir.path().join("scene.rrd");
    assert!(rrd.is_file());

    let mut img = Container::open(&path, Access::ReadOnly).unwrap();
    assert_eq!(img.overview_count(0).unwrap(), 1);
    assert_eq!(img.overview_count(1).unwrap(), 1);
    assert_eq!(img.overview(0, 0).unwrap().source(), BandSource::Dependent);
    assert_eq!(img.read_overview_block(0, 0, 0, 0).unwrap(), vec![42u8; 64 * 64]);

    // The dependent holds one proxy layer per band and no pixels of its own
    let dump = Container::open(&rrd, Access::ReadOnly)
        .unwrap()
        .dump_tree()
        .unwrap();
    assert!(dump.contains("  Layer_1(Eimg_Layer)"));
    assert!(dump.contains("    _ss_2_(Eimg_Layer_SubSample)"));
    assert!(dump.contains("DependentLayerName(Eimg_DependentLayerName)"));
}

#[test]
fn test_overview_survives_primary_rename() {
    let dir = TempDir::new().unwrap();
    let path = base_image(&dir, "before.img");

    let config = HfaConfig {
        use_rrd: true,
        ..HfaConfig::default()
    };
    let mut img = Container::open_with(&path, Access::Update, config).unwrap();
    img.create_overview(0, 3).unwrap();
    img.close().unwrap();

    let new_img = dir.path().join("after.img");
    let new_rrd = dir.path().join("after.rrd");
    std::fs::rename(&path, &new_img).unwrap();
    std::fs::rename(dir.path().join("before.rrd"), &new_rrd).unwrap();

    // Stale names fall back to the dependent next to the renamed file
    let mut img = Container::open(&new_img, Access::ReadOnly).unwrap();
    assert_eq!(img.overview_count(0).unwrap(), 1);
    drop(img);

    let mut img = Container::open(&new_img, Access::Update).unwrap();
    img.dependent("after.rrd").unwrap().unwrap();
    img.rename_references("after", "before").unwrap();
    img.close().unwrap();

    let mut img = Container::open(&new_img, Access::ReadOnly).unwrap();
    let node = img.band(0).unwrap().node();
    let tree = img.tree();
    let list = tree.named_child(node, "RRDNamesList").unwrap().unwrap();
    assert_eq!(
        tree.get_string(list, "nameList[0].string").unwrap(),
        "after.rrd(:Layer_1:_ss_3_)"
    );

    let mut rrd = Container::open(&new_rrd, Access::ReadOnly).unwrap();
    let tree = rrd.tree();
    let root = tree.root();
    let dep = tree.named_child(root, "DependentFile").unwrap().unwrap();
    assert_eq!(tree.get_string(dep, "dependent.string").unwrap(), "after.img");
}

#[test]
fn test_legacy_subsample_children() {
    let dir = TempDir::new().unwrap();
    let path = base_image(&dir, "legacy.img");

    // Overviews created in place and then unlisted behave like old files
    let mut img = Container::open(&path, Access::Update).unwrap();
    img.create_overview(0, 2).unwrap();
    let node = img.band(0).unwrap().node();
    let tree = img.tree();
    let list = tree.named_child(node, "RRDNamesList").unwrap().unwrap();
    tree.remove(list).unwrap();
    img.close().unwrap();

    let mut img = Container::open(&path, Access::ReadOnly).unwrap();
    assert_eq!(img.overview_count(0).unwrap(), 1);
    assert_eq!(img.overview(0, 0).unwrap().width(), 150);
}
