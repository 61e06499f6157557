//! Tile extraction with edge replication.

use ndarray::Array4;

use crate::raster::Image;
use crate::tiling::TileOrigin;

/// Fill `tile` (`[1, 3, tile_h, tile_w]`) from `image` starting at `origin`.
///
/// Coordinates past the right or bottom edge read the last column or row.
/// Single-channel images feed the same plane to all three model channels.
pub fn extract_tile(image: &Image, origin: TileOrigin, tile: &mut Array4<f32>) {
    let (tile_h, tile_w) = (tile.shape()[2], tile.shape()[3]);
    let last_x = image.width().saturating_sub(1);
    let last_y = image.height().saturating_sub(1);
    let mono = image.channels() == 1;
    let src = image.data();

    for c in 0..tile.shape()[1] {
        let src_c = if mono { 0 } else { c };
        for y in 0..tile_h {
            let sy = (origin.y + y).min(last_y);
            for x in 0..tile_w {
                let sx = (origin.x + x).min(last_x);
                tile[[0, c, y, x]] = src[[src_c, sy, sx]];
            }
        }
    }
}
