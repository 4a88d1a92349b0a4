// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

use anyhow::Context;
use clap::Parser;
/// 地面站视频流接收 (无界面显示层)
///
/// 主程序入口 - 直接运行: cargo run --bin gcs-stream -- -e 127.0.0.1:5050
use gcs_stream::stream::{
    NewTarget, PositionUpdate, StreamEvent, StreamWorker, WorkerCommand, WorkerState,
};
use gcs_stream::{gen_time_string, StreamConfig};
use std::io::BufRead;
use std::path::{Path, PathBuf};

/// 地面站视频流接收程序
#[derive(Parser, Debug)]
#[command(author, version, about = "地面站视频流接收", long_about = None)]
struct Args {
    /// 配置文件路径 (不存在时自动创建)
    #[arg(short, long, default_value = "gcs_stream.json")]
    config: String,

    /// 机载端地址 host:port (覆盖配置文件)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// 录像文件路径, 传入目录时自动按时间命名
    #[arg(short, long)]
    record: Option<PathBuf>,

    /// 显示 FPS 与地平线
    #[arg(long)]
    hud: bool,

    /// 显示目标框与跟踪ID
    #[arg(long)]
    labels: bool,

    /// 新目标缩略图输出目录
    #[arg(short, long, default_value = "targets")]
    output: PathBuf,

    /// 收到指定帧数后停止 (0 表示不限)
    #[arg(long, default_value_t = 0)]
    max_frames: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = StreamConfig::load(&args.config);
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(record) = args.record {
        config.record.path = Some(if record.is_dir() {
            record.join(format!("{}.avi", gen_time_string("-")))
        } else {
            record
        });
    }
    config.overlay.show_hud |= args.hud;
    config.overlay.show_labels |= args.labels;
    config.print_summary();

    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("无法创建输出目录 {}", args.output.display()))?;

    let mut worker = StreamWorker::new(config);
    let mut handle = worker.start()?;

    // 标准输入: 每行一条消息发给机载端, EOF (Ctrl-D) 停止
    let commands = handle.commands();
    let stopper = handle.stop_handle();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines().map_while(Result::ok) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let command = match line {
                "pause" => WorkerCommand::PauseRecording,
                "resume" => WorkerCommand::ResumeRecording,
                "stop-record" => WorkerCommand::StopRecording,
                text => WorkerCommand::SendMessage(text.to_string()),
            };
            if commands.send(command).is_err() {
                return;
            }
        }
        log::info!("⏹️ 标准输入已关闭, 停止接收");
        stopper.stop();
    });

    let mut frames = 0u64;
    for event in handle.events().clone().iter() {
        match event {
            StreamEvent::Frame(frame) => {
                frames += 1;
                if !frame.status_text.is_empty() {
                    log::debug!("📡 状态: {}", frame.status_text);
                }
                report_targets(&args.output, &frame.new_targets, &frame.position_updates);
                if args.max_frames > 0 && frames >= args.max_frames {
                    log::info!("✅ 已接收 {} 帧, 停止", frames);
                    handle.stop();
                }
            }
            StreamEvent::Targets {
                new_targets,
                position_updates,
            } => report_targets(&args.output, &new_targets, &position_updates),
            StreamEvent::StateChanged(state) => {
                log::info!("🔄 状态: {:?}", state);
            }
            StreamEvent::Disconnected { reason } => {
                match reason {
                    Some(reason) => log::error!("❌ 连接断开: {}", reason),
                    None => log::info!("👋 连接已结束"),
                }
                break;
            }
        }
    }

    handle.join();
    if handle.state() == WorkerState::Stopped {
        if let Some(err) = handle.last_error() {
            anyhow::bail!("视频流失败: {}", err);
        }
    }
    Ok(())
}

/// 保存新目标缩略图并打印位置
fn report_targets(output: &Path, new_targets: &[NewTarget], position_updates: &[PositionUpdate]) {
    for target in new_targets {
        let path = output.join(format!(
            "target_{}_{}.png",
            target.track_id,
            target.first_seen_time.format("%H%M%S")
        ));
        if target.thumbnail.width() == 0 || target.thumbnail.height() == 0 {
            log::warn!("⚠️ 目标 {} 缩略图为空, 跳过保存", target.track_id);
        } else if let Err(e) = target.thumbnail.save(&path) {
            log::error!("❌ 保存缩略图失败 {}: {}", path.display(), e);
        } else {
            log::info!("🖼️ 缩略图已保存: {}", path.display());
        }
    }
    for update in position_updates {
        println!(
            "{} id={} lat={:.7} lon={:.7}",
            update.time.format("%H:%M:%S%.3f"),
            update.track_id,
            update.position[0],
            update.position[1]
        );
    }
}
