use image::{Rgb, RgbImage, imageops};

/// Neutral fill used when a patch runs past the image border.
pub const PAD_COLOR: Rgb<u8> = Rgb([128, 128, 128]);
pub const PATCH_SIZE: u32 = 256;

/// Part of a patch window that lies inside the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropBounds {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl CropBounds {
    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

#[derive(Debug, Clone)]
pub struct Patch {
    /// Always `patch_size`×`patch_size`.
    pub image: RgbImage,
    /// Unclipped square window centred on the box.
    pub window: [i32; 4],
    pub bounds: CropBounds,
}

/// Cuts a `patch_size` square centred on `bbox` (integer corners). Whatever
/// falls outside the image is replaced by gray padding around the centred crop.
pub fn extract_patch(image: &RgbImage, bbox: [i32; 4], patch_size: u32) -> Patch {
    let (img_w, img_h) = (image.width() as i64, image.height() as i64);
    let half = (patch_size / 2) as i64;
    let [x1, y1, x2, y2] = bbox.map(i64::from);
    let cx = (x1 + x2).div_euclid(2);
    let cy = (y1 + y2).div_euclid(2);
    let (wx1, wy1, wx2, wy2) = (cx - half, cy - half, cx + half, cy + half);

    let cx1 = wx1.clamp(0, img_w);
    let cy1 = wy1.clamp(0, img_h);
    let cx2 = wx2.clamp(cx1, img_w);
    let cy2 = wy2.clamp(cy1, img_h);
    let bounds = CropBounds {
        x1: cx1 as u32,
        y1: cy1 as u32,
        x2: cx2 as u32,
        y2: cy2 as u32,
    };

    let crop = imageops::crop_imm(image, bounds.x1, bounds.y1, bounds.width(), bounds.height()).to_image();
    let image = pad_to_square(&crop, patch_size);
    let clamp_i32 = |v: i64| v.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
    Patch {
        image,
        window: [clamp_i32(wx1), clamp_i32(wy1), clamp_i32(wx2), clamp_i32(wy2)],
        bounds,
    }
}

/// Centres `crop` on a `size`×`size` gray canvas; exact-size crops pass through.
pub fn pad_to_square(crop: &RgbImage, size: u32) -> RgbImage {
    let (w, h) = crop.dimensions();
    if w == size && h == size {
        return crop.clone();
    }
    let mut canvas = RgbImage::from_pixel(size, size, PAD_COLOR);
    let x = (size as i64 - w as i64).div_euclid(2);
    let y = (size as i64 - h as i64).div_euclid(2);
    imageops::overlay(&mut canvas, crop, x, y);
    canvas
}
