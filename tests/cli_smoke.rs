use std::{collections::BTreeMap, path::PathBuf};

use framix::{
    AssetSource, Background, CompositionSettings, Layer, LayerTransform, Project,
};

#[test]
fn cli_still_writes_png() {
    let dir = PathBuf::from("target").join("cli_smoke");
    std::fs::create_dir_all(&dir).unwrap();

    let art_path = dir.join("art.png");
    let art: Vec<u8> = std::iter::repeat_n([40u8, 90, 220, 255], 64).flatten().collect();
    image::save_buffer_with_format(
        &art_path,
        &art,
        8,
        8,
        image::ColorType::Rgba8,
        image::ImageFormat::Png,
    )
    .unwrap();

    let proj_path = dir.join("project.json");
    let out_path = dir.join("out.png");
    let _ = std::fs::remove_file(&out_path);

    let mut assets = BTreeMap::new();
    assets.insert(
        "art".to_string(),
        AssetSource::Still {
            source: "art.png".to_string(),
        },
    );
    let project = Project {
        settings: CompositionSettings {
            width: 64,
            height: 64,
            fps: 30.0,
            loop_duration_ms: None,
            background: Background::Color {
                rgba: [0, 0, 0, 255],
            },
        },
        layers: vec![Layer::new("l0", "art", LayerTransform::at(32.0, 32.0))],
        assets,
    };

    let f = std::fs::File::create(&proj_path).unwrap();
    serde_json::to_writer_pretty(f, &project).unwrap();

    let exe = std::env::var_os("CARGO_BIN_EXE_framix")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let mut p = PathBuf::from("target").join("debug");
            p.push(if cfg!(windows) {
                "framix.exe"
            } else {
                "framix"
            });
            p
        });

    let proj_arg = proj_path.to_string_lossy().to_string();
    let out_arg = out_path.to_string_lossy().to_string();

    let status = std::process::Command::new(exe)
        .args(["still", "--in", proj_arg.as_str(), "--time-ms", "0", "--out"])
        .arg(out_arg.as_str())
        .status()
        .unwrap();

    assert!(status.success());
    assert!(out_path.exists());
}
