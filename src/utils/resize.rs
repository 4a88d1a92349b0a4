// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 图像缩放工具
/// RGB image scaling backed by fast_image_resize
use fast_image_resize as fr;
use image::RgbImage;

/// 缩放到指定尺寸 (双线性插值)
pub fn resize_rgb(image: &RgbImage, width: u32, height: u32) -> Result<RgbImage, String> {
    if width == 0 || height == 0 || image.width() == 0 || image.height() == 0 {
        return Err(format!(
            "非法缩放尺寸 {}x{} -> {}x{}",
            image.width(),
            image.height(),
            width,
            height
        ));
    }
    if image.dimensions() == (width, height) {
        return Ok(image.clone());
    }

    let src = fr::images::ImageRef::new(
        image.width(),
        image.height(),
        image.as_raw(),
        fr::PixelType::U8x3,
    )
    .map_err(|e| e.to_string())?;
    let mut dst = fr::images::Image::new(width, height, fr::PixelType::U8x3);

    let mut resizer = fr::Resizer::new();
    resizer
        .resize(
            &src,
            &mut dst,
            &fr::ResizeOptions::new()
                .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
        )
        .map_err(|e| e.to_string())?;

    RgbImage::from_raw(width, height, dst.into_vec())
        .ok_or_else(|| "缩放结果尺寸不匹配".to_string())
}

/// 保持长宽比, 缩放到不超过 max_width x max_height 的最大尺寸
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (width, height);
    }
    let scale = (max_width as f64 / width as f64).min(max_height as f64 / height as f64);
    let w = ((width as f64 * scale).round() as u32).max(1);
    let h = ((height as f64 * scale).round() as u32).max(1);
    (w, h)
}
