use std::path::Path;

use clap::Parser;
use image::{Rgba, RgbaImage};
use terrapaint::cli::{CellEntry, CliArgs, execute};

const SQUARE: &str = r#"{
  "type": "Feature",
  "properties": {},
  "geometry": {
    "type": "Polygon",
    "coordinates": [[[0.0, 0.0], [2.0, 0.0], [2.0, 2.0], [0.0, 2.0], [0.0, 0.0]]]
  }
}"#;

fn args(dir: &Path, extra: &[&str]) -> CliArgs {
    let geometry = dir.join("plot.geojson");
    std::fs::write(&geometry, SQUARE).unwrap();
    let config = dir.join("missing-settings.toml");
    let mut argv = vec![
        "terrapaint".to_string(),
        "--geometry".into(),
        geometry.display().to_string(),
        "--config".into(),
        config.display().to_string(),
        "--grid".into(),
        "8".into(),
    ];
    argv.extend(extra.iter().map(|s| s.to_string()));
    CliArgs::try_parse_from(argv).unwrap()
}

#[tokio::test]
async fn merges_pixels_and_writes_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let pixels = dir.path().join("in.json");
    std::fs::write(
        &pixels,
        r##"[{"x":0,"y":0,"color":"#ff0000"},{"x":7,"y":7,"color":"#00f"}]"##,
    )
    .unwrap();
    let out = dir.path().join("out.json");
    let render = dir.path().join("view.png");
    let export = dir.path().join("grid.png");

    let summary = execute(args(
        dir.path(),
        &[
            "--pixels",
            pixels.to_str().unwrap(),
            "--out-pixels",
            out.to_str().unwrap(),
            "--render",
            render.to_str().unwrap(),
            "--viewport",
            "64x48",
            "--export",
            export.to_str().unwrap(),
        ],
    ))
    .await
    .unwrap();

    assert_eq!(summary.painted, 2);
    assert_eq!(summary.editable, 64);
    assert_eq!(summary.grid_cells, 64);
    assert!((summary.coverage() - 1.0).abs() < 1e-9);

    let written: Vec<CellEntry> = serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(written.len(), 2);
    assert_eq!(written[1].color.to_string(), "#0000FF");

    assert_eq!(image::open(&render).unwrap().into_rgba8().dimensions(), (64, 48));
    let grid = image::open(&export).unwrap().into_rgba8();
    assert_eq!(grid.dimensions(), (8, 8));
    assert_eq!(grid.get_pixel(0, 0), &Rgba([255, 0, 0, 255]));
}

#[tokio::test]
async fn stamps_an_image_into_the_grid() {
    let dir = tempfile::tempdir().unwrap();
    let stamp = dir.path().join("logo.png");
    let mut img = RgbaImage::from_pixel(4, 4, Rgba([0, 128, 0, 255]));
    img.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
    img.save(&stamp).unwrap();

    let summary = execute(args(
        dir.path(),
        &["--stamp", stamp.to_str().unwrap(), "--stamp-rect", "2,2,4,4"],
    ))
    .await
    .unwrap();
    assert_eq!(summary.stamped, 15);
    assert_eq!(summary.painted, 15);
}

#[tokio::test]
async fn bad_geometry_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut parsed = args(dir.path(), &[]);
    let broken = dir.path().join("broken.geojson");
    std::fs::write(&broken, "{\"type\":\"Point\"}").unwrap();
    parsed.geometry = broken;
    assert!(execute(parsed).await.is_err());
}
