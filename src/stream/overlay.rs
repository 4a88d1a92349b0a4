// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 叠加层绘制模块
/// HUD (FPS + horizon line) and detection label overlay
use super::types::{Detection, OverlayOptions};
use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::collections::VecDeque;
use std::path::Path;
use std::time::Instant;

/// FPS 滑动窗口默认长度
pub const DEFAULT_FPS_WINDOW: usize = 10;

pub const HUD_COLOR: Rgb<u8> = Rgb([85, 170, 255]);
pub const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const LABEL_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

const FPS_POSITION: (i32, i32) = (40, 30);
const FPS_SCALE: f32 = 40.0;
const LABEL_SCALE: f32 = 24.0;

// 内置字体 (DejaVu Sans Mono, 许可见 assets/font/DejaVu-LICENSE.txt)
const EMBEDDED_FONT: &[u8] = include_bytes!("../../assets/font/DejaVuSansMono.ttf");

/// 固定容量的 FPS 滑动窗口
#[derive(Debug, Clone)]
pub struct FpsWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl FpsWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, fps: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(fps);
    }

    /// 算术平均, 窗口为空返回 None
    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// 叠加层绘制器 (持有 FPS 状态, 只在工作线程使用)
pub struct OverlayCompositor {
    fps: FpsWindow,
    previous: Option<Instant>,
    roll: f32,
    font: Option<FontVec>,
    font_warned: bool,
}

impl OverlayCompositor {
    pub fn new(fps_window: usize, font: Option<FontVec>) -> Self {
        Self {
            fps: FpsWindow::new(fps_window),
            previous: None,
            roll: 0.0,
            font,
            font_warned: false,
        }
    }

    /// 加载 TrueType 字体, 失败返回 None (文字不绘制, 线框照常)
    pub fn load_font(path: &Path) -> Option<FontVec> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("⚠️ 未找到字体文件: {} ({})", path.display(), e);
                return None;
            }
        };
        match FontVec::try_from_vec(bytes) {
            Ok(font) => {
                log::info!("✅ 字体加载成功: {}", path.display());
                Some(font)
            }
            Err(e) => {
                log::warn!("⚠️ 字体加载失败: {}", e);
                None
            }
        }
    }

    /// 内置字体, 未配置 font_path 或加载失败时使用
    pub fn default_font() -> Option<FontVec> {
        match FontVec::try_from_vec(EMBEDDED_FONT.to_vec()) {
            Ok(font) => Some(font),
            Err(e) => {
                log::warn!("⚠️ 内置字体解析失败: {}", e);
                None
            }
        }
    }

    /// 设置地平线横滚角 (弧度)
    pub fn set_roll(&mut self, roll: f32) {
        self.roll = roll;
    }

    pub fn roll(&self) -> f32 {
        self.roll
    }

    pub fn fps_window(&self) -> &FpsWindow {
        &self.fps
    }

    /// 记录一帧时间戳, 返回当前平均 FPS
    ///
    /// 第一帧或间隔 <= 0 时不产生样本
    pub fn record_frame(&mut self, now: Instant) -> Option<f64> {
        if let Some(prev) = self.previous {
            let interval = now.saturating_duration_since(prev).as_secs_f64();
            if interval > 0.0 {
                self.fps.push(1.0 / interval);
            }
        }
        self.previous = Some(now);
        self.fps.mean()
    }

    /// 在图像上绘制 HUD 与检测标签
    pub fn compose(
        &mut self,
        image: &mut RgbImage,
        detections: &[Detection],
        now: Instant,
        options: OverlayOptions,
    ) {
        if options.show_hud {
            let avg_fps = self.record_frame(now);
            if let Some(fps) = avg_fps {
                self.draw_text(image, HUD_COLOR, FPS_POSITION, FPS_SCALE, &format!("{}", fps as i64));
            }
            let (p1, p2) = horizon_endpoints(image.width(), image.height(), self.roll);
            draw_thick_line(image, p1, p2, HUD_COLOR);
        }

        if options.show_labels {
            for det in detections.iter().filter(|d| d.is_tracked()) {
                let bbox = &det.bbox;
                draw_thick_rect(image, bbox.left, bbox.top, bbox.width, bbox.height, BOX_COLOR);

                let label_y = (bbox.top - LABEL_SCALE).max(0.0) as i32;
                self.draw_text(
                    image,
                    LABEL_COLOR,
                    (bbox.left as i32, label_y),
                    LABEL_SCALE,
                    &det.track_id.to_string(),
                );
            }
        }
    }

    fn draw_text(&mut self, image: &mut RgbImage, color: Rgb<u8>, at: (i32, i32), scale: f32, text: &str) {
        match &self.font {
            Some(font) => draw_text_mut(image, color, at.0, at.1, PxScale::from(scale), font, text),
            None => {
                if !self.font_warned {
                    log::warn!("⚠️ 未加载字体, 叠加层文字不绘制");
                    self.font_warned = true;
                }
            }
        }
    }
}

/// 地平线端点: 以画面中心为轴, 覆盖中间 2/3 宽度, 按横滚角旋转
pub fn horizon_endpoints(width: u32, height: u32, roll: f32) -> ((f32, f32), (f32, f32)) {
    let cx = width as f32 / 2.0;
    let cy = height as f32 / 2.0;
    let half = width as f32 / 3.0;
    let (dx, dy) = (half * roll.cos(), half * roll.sin());
    ((cx - dx, cy + dy), (cx + dx, cy - dy))
}

// 线宽2: 画两条相邻的线
fn draw_thick_line(image: &mut RgbImage, p1: (f32, f32), p2: (f32, f32), color: Rgb<u8>) {
    draw_line_segment_mut(image, p1, p2, color);
    draw_line_segment_mut(image, (p1.0, p1.1 + 1.0), (p2.0, p2.1 + 1.0), color);
}

fn draw_thick_rect(image: &mut RgbImage, left: f32, top: f32, width: f32, height: f32, color: Rgb<u8>) {
    let (x, y) = (left as i32, top as i32);
    let (w, h) = (width as u32, height as u32);
    if w == 0 || h == 0 {
        return;
    }
    draw_hollow_rect_mut(image, Rect::at(x, y).of_size(w, h), color);
    if w > 2 && h > 2 {
        draw_hollow_rect_mut(image, Rect::at(x + 1, y + 1).of_size(w - 2, h - 2), color);
    }
}
