use image::GrayImage;
use log::debug;

/// Decodes zero or more scannable codes out of a single frame. Pure with
/// respect to the frame; every code found in a frame is handed back before
/// the next frame is pulled.
pub trait CodeDecoder {
    fn decode(&self, frame: &GrayImage) -> Vec<DecodedCode>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCode {
    pub payload: String,
    pub region: Region,
}

/// Axis-aligned bounding box of a decoded code within its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// QR decoder over rqrr. A grid that is detected but fails to decode is a
/// miss, not an error; the payload carries no checksum beyond what the
/// symbology itself provides, so garbage reads are filtered downstream by
/// the identity lookup.
pub struct RqrrDecoder;

impl CodeDecoder for RqrrDecoder {
    fn decode(&self, frame: &GrayImage) -> Vec<DecodedCode> {
        let mut prepared = rqrr::PreparedImage::prepare(frame.clone());
        let mut codes = Vec::new();
        for grid in prepared.detect_grids() {
            let region = region_from_bounds(&grid.bounds);
            match grid.decode() {
                Ok((_meta, payload)) => codes.push(DecodedCode { payload, region }),
                Err(e) => debug!("undecodable grid at {:?}: {}", region, e),
            }
        }
        codes
    }
}

fn region_from_bounds(bounds: &[rqrr::Point; 4]) -> Region {
    let min_x = bounds.iter().map(|p| p.x).min().unwrap_or(0);
    let max_x = bounds.iter().map(|p| p.x).max().unwrap_or(0);
    let min_y = bounds.iter().map(|p| p.y).min().unwrap_or(0);
    let max_y = bounds.iter().map(|p| p.y).max().unwrap_or(0);
    Region {
        x: min_x,
        y: min_y,
        width: max_x - min_x,
        height: max_y - min_y,
    }
}
