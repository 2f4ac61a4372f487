//! Math used to sample the current buffer: the texture-coordinate matrix and
//! the crop adjustment of the scale-crop scaling mode.
use crate::buffer::{GraphicBuffer, Transform};
use crate::Rect;

/// A 4x4 matrix stored in column-major order, as expected by GL.
pub type Mat4 = [f32; 16];

pub const IDENTITY: Mat4 = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0, //
];

const FLIP_H: Mat4 = [
    -1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    1.0, 0.0, 0.0, 1.0, //
];

const FLIP_V: Mat4 = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, -1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 1.0, 0.0, 1.0, //
];

const ROT_90: Mat4 = [
    0.0, 1.0, 0.0, 0.0, //
    -1.0, 0.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    1.0, 0.0, 0.0, 1.0, //
];

/// Returns `a * b`.
fn mul(a: &Mat4, b: &Mat4) -> Mat4 {
    let mut res = [0.0f32; 16];
    for col in 0..4 {
        for row in 0..4 {
            res[col * 4 + row] = (0..4).map(|k| a[k * 4 + row] * b[col * 4 + k]).sum();
        }
    }
    res
}

/// Compute the matrix that maps texture coordinates of the displayed surface
/// to texture coordinates of `buffer`.
///
/// The matrix applies `transform`, then restricts sampling to `crop`, then
/// flips vertically since the top of a window texture is at `y = 0`. When
/// `filtering` is enabled the crop is shrunk so bilinear sampling does not
/// bleed in texels from outside of it.
pub fn compute_transform_matrix(
    buffer: Option<&GraphicBuffer>,
    crop: &Rect,
    transform: Transform,
    filtering: bool,
) -> Mat4 {
    let mut xform = IDENTITY;
    if transform.contains(Transform::FLIP_H) {
        xform = mul(&xform, &FLIP_H);
    }
    if transform.contains(Transform::FLIP_V) {
        xform = mul(&xform, &FLIP_V);
    }
    if transform.contains(Transform::ROT_90) {
        xform = mul(&xform, &ROT_90);
    }

    if let Some(buffer) = buffer.filter(|_| !crop.is_empty()) {
        let (mut tx, mut ty, mut sx, mut sy) = (0.0f32, 0.0f32, 1.0f32, 1.0f32);
        let buffer_width = buffer.width as f32;
        let buffer_height = buffer.height as f32;

        // Subsampled chroma planes need a full texel of margin.
        let shrink = match (filtering, buffer.format.is_unsubsampled_rgb()) {
            (false, _) => 0.0,
            (true, true) => 0.5,
            (true, false) => 1.0,
        };

        if (crop.width() as f32) < buffer_width {
            tx = (crop.left as f32 + shrink) / buffer_width;
            sx = (crop.width() as f32 - 2.0 * shrink) / buffer_width;
        }
        if (crop.height() as f32) < buffer_height {
            ty = ((buffer.height as i32 - crop.bottom) as f32 + shrink) / buffer_height;
            sy = (crop.height() as f32 - 2.0 * shrink) / buffer_height;
        }

        let crop_mtx: Mat4 = [
            sx, 0.0, 0.0, 0.0, //
            0.0, sy, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, //
            tx, ty, 0.0, 1.0, //
        ];
        xform = mul(&crop_mtx, &xform);
    }

    mul(&FLIP_V, &xform)
}

/// Shrink `crop` around its center so it gets the aspect ratio of a
/// `width`x`height` window.
pub fn scale_down_crop(crop: &Rect, width: u32, height: u32) -> Rect {
    if width == 0 || height == 0 || crop.is_empty() {
        return *crop;
    }

    let crop_width = crop.width() as u64;
    let crop_height = crop.height() as u64;
    let (width, height) = (width as u64, height as u64);
    let mut new_width = crop_width;
    let mut new_height = crop_height;

    if new_width * height > new_height * width {
        new_width = new_height * width / height;
    } else if new_width * height < new_height * width {
        new_height = new_width * height / width;
    }

    let mut out = *crop;
    if new_width < crop_width {
        let dw = (crop_width - new_width) as i32;
        out.left += dw / 2;
        out.right -= dw - dw / 2;
    } else if new_height < crop_height {
        let dh = (crop_height - new_height) as i32;
        out.top += dh / 2;
        out.bottom -= dh - dh / 2;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Usage;
    use crate::PixelFormat;

    fn assert_mat_eq(actual: &Mat4, expected: &Mat4) {
        for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
            assert!(
                (a - e).abs() < 1e-5,
                "element {} differs: {:?} != {:?}",
                i,
                actual,
                expected
            );
        }
    }

    #[test]
    fn test_matrix_without_buffer_only_flips() {
        let mtx = compute_transform_matrix(None, &Rect::new(0, 0, 10, 10), Transform::empty(), true);
        assert_mat_eq(&mtx, &FLIP_V);
    }

    #[test]
    fn test_matrix_rot90() {
        let mtx = compute_transform_matrix(None, &Rect::EMPTY, Transform::ROT_90, false);
        assert_mat_eq(
            &mtx,
            &[
                0.0, -1.0, 0.0, 0.0, //
                -1.0, 0.0, 0.0, 0.0, //
                0.0, 0.0, 1.0, 0.0, //
                1.0, 1.0, 0.0, 1.0, //
            ],
        );
    }

    #[test]
    fn test_matrix_rot180_is_both_flips() {
        let a = compute_transform_matrix(None, &Rect::EMPTY, Transform::ROT_180, false);
        let b = mul(&FLIP_V, &mul(&FLIP_H, &FLIP_V));
        assert_mat_eq(&a, &b);
    }

    #[test]
    fn test_matrix_crop() {
        let buffer = GraphicBuffer::new(100, 100, PixelFormat::RGBA_8888, Usage::HW_TEXTURE);
        let crop = Rect::new(10, 20, 60, 70);

        let mtx = compute_transform_matrix(Some(&*buffer), &crop, Transform::empty(), false);
        assert_mat_eq(
            &mtx,
            &[
                0.5, 0.0, 0.0, 0.0, //
                0.0, -0.5, 0.0, 0.0, //
                0.0, 0.0, 1.0, 0.0, //
                0.1, 0.7, 0.0, 1.0, //
            ],
        );

        // Filtering shrinks the crop by half a texel on each side for RGB.
        let mtx = compute_transform_matrix(Some(&*buffer), &crop, Transform::empty(), true);
        assert_mat_eq(
            &mtx,
            &[
                0.49, 0.0, 0.0, 0.0, //
                0.0, -0.49, 0.0, 0.0, //
                0.0, 0.0, 1.0, 0.0, //
                0.105, 0.695, 0.0, 1.0, //
            ],
        );

        // And by a whole texel for subsampled formats.
        let yuv = GraphicBuffer::new(100, 100, PixelFormat::YV12, Usage::HW_TEXTURE);
        let mtx = compute_transform_matrix(Some(&*yuv), &crop, Transform::empty(), true);
        assert!((mtx[0] - 0.48).abs() < 1e-5);
        assert!((mtx[12] - 0.11).abs() < 1e-5);
    }

    #[test]
    fn test_full_buffer_crop_is_noop() {
        let buffer = GraphicBuffer::new(64, 64, PixelFormat::RGBA_8888, Usage::HW_TEXTURE);
        let mtx = compute_transform_matrix(Some(&*buffer), &buffer.bounds(), Transform::empty(), true);
        assert_mat_eq(&mtx, &FLIP_V);
    }

    #[test]
    fn test_scale_down_crop() {
        // Too wide: trimmed evenly left and right.
        assert_eq!(
            scale_down_crop(&Rect::new(0, 0, 200, 100), 100, 100),
            Rect::new(50, 0, 150, 100)
        );
        // Too tall: trimmed evenly top and bottom.
        assert_eq!(
            scale_down_crop(&Rect::new(0, 0, 100, 300), 100, 100),
            Rect::new(0, 100, 100, 200)
        );
        // Odd differences put the extra pixel on the right.
        assert_eq!(
            scale_down_crop(&Rect::new(0, 0, 101, 50), 2, 1),
            Rect::new(0, 0, 100, 50)
        );
        // Matching aspect ratio is left alone.
        assert_eq!(
            scale_down_crop(&Rect::new(0, 0, 640, 480), 320, 240),
            Rect::new(0, 0, 640, 480)
        );
        assert_eq!(scale_down_crop(&Rect::new(0, 0, 10, 10), 0, 0), Rect::new(0, 0, 10, 10));
    }
}
