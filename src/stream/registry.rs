// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 目标登记表 (Target registry)
//! 职责: 按跟踪ID去重, 首次出现时截取缩略图, 每次出现都更新位置

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use image::{imageops, RgbImage};

use super::types::{BBox, Detection, NewTarget, PositionUpdate, TargetRecord};

/// 缩略图外扩比例
pub const THUMBNAIL_MARGIN: f32 = 0.1;

/// 正方形裁剪区域 (未裁边前, 可能超出图像)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropRegion {
    pub left: f32,
    pub top: f32,
    pub side: f32,
}

impl CropRegion {
    /// 以检测框中心为中心, 取长边并外扩10%
    pub fn around(bbox: &BBox) -> Self {
        let side = bbox.width.max(bbox.height) * (1.0 + THUMBNAIL_MARGIN);
        let (cx, cy) = bbox.center();
        Self {
            left: cx - side / 2.0,
            top: cy - side / 2.0,
            side,
        }
    }

    /// 裁到图像范围内, 返回 (x, y, w, h)
    pub fn clip(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let clamp = |v: f32, max: u32| v.round().max(0.0).min(max as f32) as u32;
        let x0 = clamp(self.left, width);
        let y0 = clamp(self.top, height);
        let x1 = clamp(self.left + self.side, width);
        let y1 = clamp(self.top + self.side, height);
        (x0, y0, x1 - x0, y1 - y0)
    }
}

/// 一次 observe 产生的事件 (保持输入顺序)
#[derive(Debug, Default)]
pub struct Observation {
    pub new_targets: Vec<NewTarget>,
    pub position_updates: Vec<PositionUpdate>,
}

impl Observation {
    pub fn is_empty(&self) -> bool {
        self.new_targets.is_empty() && self.position_updates.is_empty()
    }

    /// 合并后续事件: 新目标全部保留, 位置更新每个ID只保留最新一条
    pub fn merge(&mut self, later: Observation) {
        self.new_targets.extend(later.new_targets);
        for update in later.position_updates {
            match self
                .position_updates
                .iter_mut()
                .find(|u| u.track_id == update.track_id)
            {
                Some(existing) => *existing = update,
                None => self.position_updates.push(update),
            }
        }
    }
}

/// 目标登记表
///
/// 只增不减: 会话期间每个ID最多触发一次新目标事件
#[derive(Default)]
pub struct TargetRegistry {
    targets: HashMap<i64, TargetRecord>,
    order: Vec<i64>, // 首次出现顺序
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(
        &mut self,
        detections: &[Detection],
        source: &RgbImage,
        now: DateTime<Utc>,
    ) -> Observation {
        let mut observation = Observation::default();

        for det in detections.iter().filter(|d| d.is_tracked()) {
            if !self.targets.contains_key(&det.track_id) {
                let thumbnail = crop_thumbnail(source, &det.bbox);
                log::info!(
                    "🎯 新目标: ID {} 位置 ({:.6}, {:.6})",
                    det.track_id,
                    det.position[0],
                    det.position[1]
                );

                let record = TargetRecord {
                    track_id: det.track_id,
                    thumbnail,
                    position: det.position,
                    first_seen_time: now,
                    last_seen_time: now,
                };
                observation.new_targets.push(NewTarget {
                    track_id: record.track_id,
                    thumbnail: record.thumbnail.clone(),
                    position: record.position,
                    first_seen_time: now,
                    last_seen_time: now,
                });
                self.targets.insert(det.track_id, record);
                self.order.push(det.track_id);
            }

            if let Some(record) = self.targets.get_mut(&det.track_id) {
                record.last_seen_time = now;
                record.position = det.position;
            }
            observation.position_updates.push(PositionUpdate {
                track_id: det.track_id,
                position: det.position,
                time: now,
            });
        }

        observation
    }

    pub fn get(&self, track_id: i64) -> Option<&TargetRecord> {
        self.targets.get(&track_id)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// 按首次出现顺序遍历
    pub fn targets(&self) -> impl Iterator<Item = &TargetRecord> {
        self.order.iter().filter_map(|id| self.targets.get(id))
    }
}

/// 截取正方形缩略图, 完全在图像外时返回空图
pub fn crop_thumbnail(source: &RgbImage, bbox: &BBox) -> RgbImage {
    let (x, y, w, h) = CropRegion::around(bbox).clip(source.width(), source.height());
    imageops::crop_imm(source, x, y, w, h).to_image()
}
