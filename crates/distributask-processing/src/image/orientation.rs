use image::{imageops, DynamicImage, Rgba};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};

use distributask_core::models::FlipAxis;

/// Image orientation operations (rotation and flipping)
pub struct ImageOrientation;

impl ImageOrientation {
    /// Rotate clockwise by `angle` degrees.
    ///
    /// Quarter turns are exact and swap dimensions for 90/270. Any other angle
    /// rotates about the centre on the original canvas, filling uncovered corners
    /// with transparent pixels.
    pub fn rotate(img: DynamicImage, angle: f64) -> DynamicImage {
        let normalized = angle.rem_euclid(360.0);
        match Self::quarter_turn(normalized) {
            Some(0) => img,
            Some(90) => DynamicImage::ImageRgba8(imageops::rotate90(&img.to_rgba8())),
            Some(180) => DynamicImage::ImageRgba8(imageops::rotate180(&img.to_rgba8())),
            Some(270) => DynamicImage::ImageRgba8(imageops::rotate270(&img.to_rgba8())),
            _ => {
                tracing::debug!(angle = normalized, "Rotating by arbitrary angle");
                let rotated = rotate_about_center(
                    &img.to_rgba8(),
                    normalized.to_radians() as f32,
                    Interpolation::Bilinear,
                    Rgba([0, 0, 0, 0]),
                );
                DynamicImage::ImageRgba8(rotated)
            }
        }
    }

    fn quarter_turn(normalized: f64) -> Option<u16> {
        const EPSILON: f64 = 1e-9;
        [0u16, 90, 180, 270, 360]
            .into_iter()
            .find(|quarter| (normalized - f64::from(*quarter)).abs() < EPSILON)
            .map(|quarter| quarter % 360)
    }

    /// `x` mirrors left to right, `y` flips top to bottom.
    pub fn flip(img: DynamicImage, axis: FlipAxis) -> DynamicImage {
        match axis {
            FlipAxis::X => DynamicImage::ImageRgba8(imageops::flip_horizontal(&img.to_rgba8())),
            FlipAxis::Y => DynamicImage::ImageRgba8(imageops::flip_vertical(&img.to_rgba8())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, RgbaImage};

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
    const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);

    /// 3x2 image, red everywhere except a blue top-left pixel.
    fn marked() -> DynamicImage {
        let mut img = RgbaImage::from_pixel(3, 2, RED);
        img.put_pixel(0, 0, BLUE);
        DynamicImage::ImageRgba8(img)
    }

    #[test]
    fn test_quarter_turns_swap_dimensions() {
        assert_eq!(ImageOrientation::rotate(marked(), 90.0).dimensions(), (2, 3));
        assert_eq!(ImageOrientation::rotate(marked(), 180.0).dimensions(), (3, 2));
        assert_eq!(ImageOrientation::rotate(marked(), 270.0).dimensions(), (2, 3));
        assert_eq!(ImageOrientation::rotate(marked(), -90.0).dimensions(), (2, 3));
        assert_eq!(ImageOrientation::rotate(marked(), 360.0).dimensions(), (3, 2));
    }

    #[test]
    fn test_rotate_90_is_clockwise() {
        // Top-left moves to top-right under a clockwise quarter turn.
        let rotated = ImageOrientation::rotate(marked(), 90.0);
        assert_eq!(rotated.get_pixel(1, 0), BLUE);
        assert_eq!(rotated.get_pixel(0, 0), RED);
    }

    #[test]
    fn test_negative_quarter_turn_matches_270() {
        let a = ImageOrientation::rotate(marked(), -90.0);
        let b = ImageOrientation::rotate(marked(), 270.0);
        assert_eq!(a.to_rgba8(), b.to_rgba8());
    }

    #[test]
    fn test_arbitrary_angle_keeps_canvas() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(40, 10, RED));
        let rotated = ImageOrientation::rotate(img, 45.0);
        assert_eq!(rotated.dimensions(), (40, 10));
        // Corners fall outside the rotated source.
        assert_eq!(rotated.get_pixel(0, 0), Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn test_flip_axes() {
        let mirrored = ImageOrientation::flip(marked(), FlipAxis::X);
        assert_eq!(mirrored.dimensions(), (3, 2));
        assert_eq!(mirrored.get_pixel(2, 0), BLUE);

        let flipped = ImageOrientation::flip(marked(), FlipAxis::Y);
        assert_eq!(flipped.get_pixel(0, 1), BLUE);
    }
}
