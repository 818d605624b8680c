//! Raw sampler buffers → top-down 24-bit RGB images.
//!
//! Input layout is Windows-DIB order (see [`SampleFormat`]): BGR / BGRX /
//! 16-bit BGR, optionally stored bottom row first. 48 bpp input keeps the
//! high byte of each channel.

use camgrab_core::{CaptureError, CaptureResult, Rotation, SampleFormat};
use image::{imageops, RgbImage};

/// Bit depths the converter understands.
pub const CONVERTIBLE_DEPTHS: [u16; 3] = [24, 32, 48];

/// Convert `raw` to RGB and apply `rotation`.
pub fn convert(raw: &[u8], format: &SampleFormat, rotation: Rotation) -> CaptureResult<RgbImage> {
    let image = to_rgb(raw, format)?;
    Ok(rotate(image, rotation))
}

/// Convert `raw` to a top-down RGB image without rotating it.
pub fn to_rgb(raw: &[u8], format: &SampleFormat) -> CaptureResult<RgbImage> {
    if !CONVERTIBLE_DEPTHS.contains(&format.bits_per_pixel) {
        return Err(CaptureError::UnsupportedPixelFormat { bits_per_pixel: format.bits_per_pixel });
    }
    let expected = format.frame_len().ok_or(CaptureError::FrameSize {
        expected: usize::MAX,
        actual: raw.len(),
    })?;
    if raw.len() != expected {
        return Err(CaptureError::FrameSize { expected, actual: raw.len() });
    }

    let width = format.width as usize;
    let height = format.height as usize;
    let pixel = format.bytes_per_pixel();
    let stride = width * pixel;

    let mut rgb = Vec::with_capacity(width * height * 3);
    for row in 0..height {
        let src = if format.bottom_up { height - 1 - row } else { row };
        let line = &raw[src * stride..(src + 1) * stride];
        if format.bits_per_pixel == 48 {
            // B,G,R little-endian u16: high bytes sit at odd offsets
            for px in line.chunks_exact(6) {
                rgb.extend_from_slice(&[px[5], px[3], px[1]]);
            }
        } else {
            for px in line.chunks_exact(pixel) {
                rgb.extend_from_slice(&[px[2], px[1], px[0]]);
            }
        }
    }

    RgbImage::from_raw(format.width, format.height, rgb).ok_or(CaptureError::FrameSize {
        expected: width * height * 3,
        actual: 0,
    })
}

/// Apply a rotate/flip to an already converted image.
pub fn rotate(image: RgbImage, rotation: Rotation) -> RgbImage {
    match rotation {
        Rotation::None => image,
        Rotation::Cw90 => imageops::rotate90(&image),
        Rotation::Cw180 => imageops::rotate180(&image),
        Rotation::Cw270 => imageops::rotate270(&image),
        Rotation::FlipX => imageops::flip_horizontal(&image),
        Rotation::Cw90FlipX => imageops::flip_horizontal(&imageops::rotate90(&image)),
        Rotation::FlipY => imageops::flip_vertical(&image),
        Rotation::Cw270FlipX => imageops::flip_horizontal(&imageops::rotate270(&image)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    const RED: Rgb<u8> = Rgb([255, 0, 0]);
    const BLUE: Rgb<u8> = Rgb([0, 0, 255]);

    #[test]
    fn bgr_bottom_up_to_rgb_top_down() {
        // 2x2, bottom row blue, top row red, stored bottom row first
        let mut bgr = vec![0u8; 12];
        bgr[0] = 255;
        bgr[3] = 255;
        bgr[8] = 255;
        bgr[11] = 255;
        let format = SampleFormat { bottom_up: true, ..SampleFormat::new(2, 2, 24) };

        let img = to_rgb(&bgr, &format).unwrap();
        assert_eq!(*img.get_pixel(0, 0), RED);
        assert_eq!(*img.get_pixel(1, 0), RED);
        assert_eq!(*img.get_pixel(0, 1), BLUE);
        assert_eq!(*img.get_pixel(1, 1), BLUE);
    }

    #[test]
    fn bgrx_drops_padding_byte() {
        let raw = [10u8, 20, 30, 99];
        let img = to_rgb(&raw, &SampleFormat::new(1, 1, 32)).unwrap();
        assert_eq!(*img.get_pixel(0, 0), Rgb([30, 20, 10]));
    }

    #[test]
    fn deep_colour_keeps_high_bytes() {
        // B=0x1100, G=0x2200, R=0x3300 little-endian
        let raw = [0x00u8, 0x11, 0x00, 0x22, 0x00, 0x33];
        let img = to_rgb(&raw, &SampleFormat::new(1, 1, 48)).unwrap();
        assert_eq!(*img.get_pixel(0, 0), Rgb([0x33, 0x22, 0x11]));
    }

    #[test]
    fn rejects_unsupported_depth() {
        let err = to_rgb(&[0u8; 8], &SampleFormat::new(2, 2, 16)).unwrap_err();
        assert!(matches!(err, CaptureError::UnsupportedPixelFormat { bits_per_pixel: 16 }));
    }

    #[test]
    fn rejects_short_buffer() {
        let err = to_rgb(&[0u8; 5], &SampleFormat::new(2, 1, 24)).unwrap_err();
        assert!(matches!(err, CaptureError::FrameSize { expected: 6, actual: 5 }));
    }

    #[test]
    fn quarter_turns_swap_axes() {
        // 2x1 image: red then blue
        let raw = [0u8, 0, 255, 255, 0, 0];
        let format = SampleFormat::new(2, 1, 24);

        let cw90 = convert(&raw, &format, Rotation::Cw90).unwrap();
        assert_eq!(cw90.dimensions(), (1, 2));
        assert_eq!(*cw90.get_pixel(0, 0), RED);
        assert_eq!(*cw90.get_pixel(0, 1), BLUE);

        let cw270 = convert(&raw, &format, Rotation::Cw270).unwrap();
        assert_eq!(*cw270.get_pixel(0, 0), BLUE);
        assert_eq!(*cw270.get_pixel(0, 1), RED);
    }

    #[test]
    fn flips_mirror_the_right_axis() {
        let raw = [0u8, 0, 255, 255, 0, 0];
        let format = SampleFormat::new(2, 1, 24);

        let flip_x = convert(&raw, &format, Rotation::FlipX).unwrap();
        assert_eq!(*flip_x.get_pixel(0, 0), BLUE);

        let flip_y = convert(&raw, &format, Rotation::FlipY).unwrap();
        assert_eq!(*flip_y.get_pixel(0, 0), RED);
        assert_eq!(flip_y.dimensions(), (2, 1));
    }
}
