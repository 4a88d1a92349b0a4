// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod config; // 视频流配置参数
pub mod error; // 错误类型
pub mod stream; // 视频流接收系统
pub mod utils; // 图像工具

pub use crate::config::{RecordConfig, StreamConfig};
pub use crate::error::{Result, StreamError, TransportError};

/// 生成时间字符串 (北京时间), 用于录像/缩略图文件名
pub fn gen_time_string(delimiter: &str) -> String {
    let t_now = match chrono::FixedOffset::east_opt(8 * 60 * 60) {
        Some(offset) => chrono::Utc::now().with_timezone(&offset),
        None => chrono::Utc::now().fixed_offset(),
    };
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S{}%f",
        delimiter, delimiter, delimiter, delimiter, delimiter, delimiter
    );
    t_now.format(&fmt).to_string()
}
