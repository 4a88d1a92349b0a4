// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 视频流配置 - 通过JSON文件调整参数

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::stream::overlay::DEFAULT_FPS_WINDOW;
use crate::stream::reassembler::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_SEGMENT_LEN};
use crate::stream::recorder::MAX_FILE_BYTES;
use crate::stream::types::{OverlayOptions, ValidationPolicy};

/// 录像参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    pub path: Option<PathBuf>, // None 表示不录像
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub max_file_bytes: u64, // 单个录像文件上限, 写满后停止录像
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            path: None,
            fps: 30,
            width: 1280,
            height: 720,
            max_file_bytes: MAX_FILE_BYTES,
        }
    }
}

/// 视频流参数配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    // === 连接参数 ===
    pub endpoint: String,        // 机载端地址 host:port
    pub connect_timeout_ms: u64, // 连接超时
    pub read_timeout_ms: u64,    // 读超时, 0 表示不限

    // === 协议参数 ===
    pub chunk_size: usize,                    // 单次读取字节数
    pub max_segment_len: u64,                 // 单个分段最大长度
    pub validation_policy: ValidationPolicy,  // 检测框校验策略

    // === 显示参数 ===
    pub overlay: OverlayOptions,
    pub fps_window: usize,             // FPS 滑动窗口长度
    pub font_path: Option<PathBuf>,    // 叠加层字体
    pub display_size: Option<(u32, u32)>, // 发布前缩放 (保持长宽比)
    pub publish_capacity: usize,       // 发布队列长度

    // === 录像参数 ===
    pub record: RecordConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:5050".to_string(),
            connect_timeout_ms: 5000,
            read_timeout_ms: 5000,

            chunk_size: DEFAULT_CHUNK_SIZE,
            max_segment_len: DEFAULT_MAX_SEGMENT_LEN,
            validation_policy: ValidationPolicy::default(),

            overlay: OverlayOptions::default(),
            fps_window: DEFAULT_FPS_WINDOW,
            font_path: None,
            display_size: Some((640, 480)),
            publish_capacity: 4,

            record: RecordConfig::default(),
        }
    }
}

impl StreamConfig {
    /// 从JSON文件加载配置
    pub fn load(path: &str) -> Self {
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(config) => {
                    log::info!("✅ 配置已从 {} 加载", path);
                    config
                }
                Err(e) => {
                    log::warn!("⚠️  配置文件解析失败: {}, 使用默认值", e);
                    Self::default()
                }
            },
            Err(_) => {
                log::info!("📝 配置文件不存在,创建默认配置...");
                let config = Self::default();
                config.save(path);
                config
            }
        }
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: &str) {
        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if let Err(e) = fs::write(path, json) {
                    log::error!("❌ 保存配置失败: {}", e);
                } else {
                    log::info!("💾 配置已保存到 {}", path);
                }
            }
            Err(e) => log::error!("❌ 序列化配置失败: {}", e),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    /// 打印当前配置
    pub fn print_summary(&self) {
        println!("\n🎛️  当前视频流配置:");
        println!("  机载端地址: {}", self.endpoint);
        println!("  读超时: {} ms", self.read_timeout_ms);
        println!("  校验策略: {:?}", self.validation_policy);
        println!(
            "  叠加层: HUD={} 标签={}",
            self.overlay.show_hud, self.overlay.show_labels
        );
        match &self.record.path {
            Some(path) => println!(
                "  录像: {} ({}x{} @ {} fps)\n",
                path.display(),
                self.record.width,
                self.record.height,
                self.record.fps
            ),
            None => println!("  录像: 关闭\n"),
        }
    }
}
