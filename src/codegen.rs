use image::Luma;
use qrcode::QrCode;
use std::path::{Path, PathBuf};

/// Renders the student's unique id as a QR PNG under `<workspace>/codes/`
/// and returns the written path. The scanner marks attendance by decoding
/// exactly this payload back out of a camera frame.
pub fn generate_code_png(workspace: &Path, unique_id: &str) -> anyhow::Result<PathBuf> {
    let dir = workspace.join("codes");
    std::fs::create_dir_all(&dir)?;

    let code = QrCode::new(unique_id.as_bytes())?;
    let img = code
        .render::<Luma<u8>>()
        .min_dimensions(256, 256)
        .build();

    let path = dir.join(format!("{}.png", unique_id));
    img.save(&path)?;
    Ok(path)
}
