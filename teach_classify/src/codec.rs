//! Conversion of images into fixed-size tensors.
//!
//! Tensors are `[1, size, size, 3]` with channel values left on the 0–255 pixel scale.
//! Normalization for a particular network is done by the extractor.
use std::path::Path;

use image::{imageops, imageops::FilterType, RgbImage};
use ndarray::Array4;
use rand::Rng;

use crate::{tensor::Tracked, Error, ImageTensor, Result};

/// Resize the whole image to `size × size` and convert it to a tensor.
pub fn encode(image: &RgbImage, size: u32) -> ImageTensor {
    let resized = imageops::resize(image, size, size, FilterType::Triangle);
    to_tensor(&resized)
}

/// Like [`encode`], but flips the image horizontally with probability 0.5.
///
/// Only used for training samples.
pub fn encode_augmented<R: Rng + ?Sized>(image: &RgbImage, size: u32, rng: &mut R) -> ImageTensor {
    let mut resized = imageops::resize(image, size, size, FilterType::Triangle);
    if rng.gen_bool(0.5) {
        imageops::flip_horizontal_in_place(&mut resized);
    }
    to_tensor(&resized)
}

/// Cut the `w × h` rectangle at `(x, y)` out of `canvas` and encode it.
///
/// The rectangle is clamped to the canvas and to at least one pixel per side.
pub fn crop_then_encode(canvas: &RgbImage, x: u32, y: u32, w: u32, h: u32, size: u32) -> ImageTensor {
    let (width, height) = canvas.dimensions();
    let x = x.min(width.saturating_sub(1));
    let y = y.min(height.saturating_sub(1));
    let w = w.max(1).min(width - x).max(1);
    let h = h.max(1).min(height - y).max(1);

    let tile = imageops::crop_imm(canvas, x, y, w, h).to_image();
    encode(&tile, size)
}

/// Decode an image file into RGB.
pub fn decode_file(path: impl AsRef<Path>) -> Result<RgbImage> {
    Ok(image::open(path)?.to_rgb8())
}

/// Wrap a raw RGB8 frame, e.g. a decoded camera frame.
pub fn from_raw_frame(width: u32, height: u32, data: Vec<u8>) -> Result<RgbImage> {
    let len = data.len();
    RgbImage::from_raw(width, height, data).ok_or_else(|| {
        Error::mismatch(format!(
            "frame of {len} bytes does not hold {width}x{height} RGB pixels"
        ))
    })
}

fn to_tensor(image: &RgbImage) -> ImageTensor {
    let (width, height) = image.dimensions();
    let tensor = Array4::from_shape_fn(
        (1, height as usize, width as usize, 3),
        |(_, y, x, c)| image[(x as _, y as _)][c] as f32,
    );

    Tracked::new(tensor)
}

#[cfg(test)]
mod test {
    use image::Rgb;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn half_and_half(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, _| {
            if x < width / 2 {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 0, 255])
            }
        })
    }

    #[test]
    fn encode_resizes_to_square_tensor() {
        let image = RgbImage::from_pixel(64, 32, Rgb([10, 20, 30]));

        let tensor = encode(&image, 16);

        assert_eq!(tensor.dim(), (1, 16, 16, 3));
        assert_eq!(tensor[[0, 5, 7, 0]], 10.0);
        assert_eq!(tensor[[0, 5, 7, 2]], 30.0);
    }

    #[test]
    fn augmentation_flips_about_half_of_the_time() {
        let image = half_and_half(8, 8);
        let mut rng = StdRng::seed_from_u64(7);

        let flipped = (0..200)
            .filter(|_| {
                let tensor = encode_augmented(&image, 8, &mut rng);
                // Blue on the left means the image was mirrored
                tensor[[0, 0, 0, 2]] > tensor[[0, 0, 0, 0]]
            })
            .count();

        assert!((60..140).contains(&flipped), "flipped {flipped} of 200");
    }

    #[test]
    fn crop_selects_the_requested_region() {
        let image = half_and_half(20, 10);

        let right = crop_then_encode(&image, 10, 0, 10, 10, 4);
        assert!(right.iter().step_by(3).all(|r| *r == 0.0));

        let left = crop_then_encode(&image, 0, 0, 10, 10, 4);
        assert!(left.iter().step_by(3).all(|r| *r == 255.0));
    }

    #[test]
    fn crop_is_clamped_to_the_canvas() {
        let image = half_and_half(20, 10);

        let empty = crop_then_encode(&image, 5, 5, 0, 0, 4);
        assert_eq!(empty.dim(), (1, 4, 4, 3));

        let outside = crop_then_encode(&image, 50, 50, 10, 10, 4);
        assert_eq!(outside.dim(), (1, 4, 4, 3));
    }

    #[test]
    fn raw_frames_need_matching_length() {
        assert!(from_raw_frame(2, 2, vec![0; 12]).is_ok());
        assert!(matches!(
            from_raw_frame(2, 2, vec![0; 10]),
            Err(Error::ConfigurationMismatch(_))
        ));
    }
}
