// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 视频流接收系统数据结构定义
/// Data structures for the ground-station stream receiver
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ========== 枚举类型 ==========

/// 工作线程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Connecting,
    Streaming,
    Failed,
    Stopped,
}

impl WorkerState {
    /// 是否已经结束 (不会再发布任何帧)
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Stopped)
    }
}

/// 检测框校验策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationPolicy {
    /// 宽高为负直接判定为协议错误
    Reject,
    /// 宽高为负时截断为0
    #[default]
    Clamp,
}

// ========== 数据结构 ==========

/// 检测框 (像素坐标, 左上角 + 宽高)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BBox {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    pub fn new(left: f32, top: f32, width: f32, height: f32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn right(&self) -> f32 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.top + self.height
    }

    pub fn center(&self) -> (f32, f32) {
        (self.left + self.width / 2.0, self.top + self.height / 2.0)
    }
}

/// 单个目标观测
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// 跟踪ID, <= 0 表示未跟踪/噪声
    pub track_id: i64,
    pub bbox: BBox,
    /// 地理位置 (lat, lon)
    pub position: [f64; 2],
}

impl Detection {
    pub fn new(track_id: i64, bbox: BBox, position: [f64; 2]) -> Self {
        Self {
            track_id,
            bbox,
            position,
        }
    }

    /// 只有正数ID参与标注与目标登记
    pub fn is_tracked(&self) -> bool {
        self.track_id > 0
    }
}

/// 完整接收的一帧数据包 (状态文本 + 压缩图像 + 检测列表)
#[derive(Debug, Clone, PartialEq)]
pub struct FrameEnvelope {
    pub status_text: String,
    pub image_bytes: Vec<u8>,
    pub detections: Vec<Detection>,
}

/// 解码后的帧
#[derive(Clone)]
pub struct DecodedFrame {
    pub status_text: String,
    pub image: RgbImage,
    pub detections: Vec<Detection>,
}

/// 目标记录 (首次出现时的快照)
#[derive(Clone, Debug)]
pub struct TargetRecord {
    pub track_id: i64,
    pub thumbnail: RgbImage,
    pub position: [f64; 2],
    pub first_seen_time: DateTime<Utc>,
    pub last_seen_time: DateTime<Utc>,
}

/// 新目标事件
#[derive(Clone, Debug)]
pub struct NewTarget {
    pub track_id: i64,
    pub thumbnail: RgbImage,
    pub position: [f64; 2],
    pub first_seen_time: DateTime<Utc>,
    pub last_seen_time: DateTime<Utc>,
}

/// 目标位置更新事件
#[derive(Clone, Debug, PartialEq)]
pub struct PositionUpdate {
    pub track_id: i64,
    pub position: [f64; 2],
    pub time: DateTime<Utc>,
}

/// 叠加层开关
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayOptions {
    pub show_hud: bool,
    pub show_labels: bool,
}

impl OverlayOptions {
    pub fn any(&self) -> bool {
        self.show_hud || self.show_labels
    }
}

// ========== 线程间消息 ==========

/// 发布给显示层的一帧结果 (工作线程 → 显示线程)
#[derive(Clone)]
pub struct PublishedFrame {
    pub frame_id: u64, // 帧序号
    pub image: RgbImage,
    pub status_text: String,
    pub new_targets: Vec<NewTarget>,
    pub position_updates: Vec<PositionUpdate>,
}

/// 工作线程发布的事件
#[derive(Clone)]
pub enum StreamEvent {
    Frame(PublishedFrame),
    StateChanged(WorkerState),
    /// 显示队列满时未能随帧送达的目标事件, 会话结束前补发
    Targets {
        new_targets: Vec<NewTarget>,
        position_updates: Vec<PositionUpdate>,
    },
    /// 会话结束, reason 为 None 表示正常结束
    Disconnected { reason: Option<String> },
}

/// 控制命令 (显示线程 → 工作线程)
#[derive(Clone, Debug)]
pub enum WorkerCommand {
    SetOptions(OverlayOptions),
    /// 地平线横滚角 (弧度)
    SetRoll(f32),
    StartRecording(PathBuf),
    StopRecording,
    PauseRecording,
    ResumeRecording,
    /// 发送文本消息给机载端
    SendMessage(String),
}
