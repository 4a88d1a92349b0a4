// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

use anyhow::Context;
use clap::Parser;
/// 模拟机载端推流 (测试/演示用)
///
/// 主程序入口 - 直接运行: cargo run --bin mock-producer -- -p 5050
use gcs_stream::stream::{encode_envelope, BBox, Detection, FrameReassembler, DISCONNECT_MESSAGE};
use image::{codecs::jpeg::JpegEncoder, ExtendedColorType, Rgb, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 模拟机载端程序
#[derive(Parser, Debug)]
#[command(author, version, about = "模拟机载端推流", long_about = None)]
struct Args {
    /// 监听地址
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// 监听端口
    #[arg(short, long, default_value_t = 5050)]
    port: u16,

    /// 帧率
    #[arg(short, long, default_value_t = 15)]
    fps: u32,

    /// 画面宽度
    #[arg(long, default_value_t = 1280)]
    width: u32,

    /// 画面高度
    #[arg(long, default_value_t = 720)]
    height: u32,

    /// 模拟目标数量
    #[arg(short, long, default_value_t = 3)]
    targets: usize,

    /// 每个连接发送的帧数 (0 表示不限)
    #[arg(long, default_value_t = 0)]
    frames: u64,
}

// 模拟位置: Canberra 机场附近
const ORIGIN: [f64; 2] = [-35.363261, 149.165230];

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let listener = TcpListener::bind((args.host.as_str(), args.port))
        .with_context(|| format!("无法监听 {}:{}", args.host, args.port))?;
    log::info!("🚁 模拟机载端已启动: {}", listener.local_addr()?);

    for conn in listener.incoming() {
        let conn = match conn {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("⚠️ 接受连接失败: {}", e);
                continue;
            }
        };
        let peer = conn.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        log::info!("🔗 地面站已连接: {}", peer);
        match serve(conn, &args) {
            Ok(sent) => log::info!("👋 连接结束: {} ({} 帧)", peer, sent),
            Err(e) => log::warn!("⚠️ 连接中断: {} ({})", peer, e),
        }
    }
    Ok(())
}

/// 为一个地面站推流, 返回发送的帧数
fn serve(mut conn: TcpStream, args: &Args) -> anyhow::Result<u64> {
    let disconnected = Arc::new(AtomicBool::new(false));
    spawn_message_reader(conn.try_clone()?, disconnected.clone());

    let interval = Duration::from_secs_f64(1.0 / args.fps.max(1) as f64);
    let mut sent = 0u64;
    let start = Instant::now();

    while !disconnected.load(Ordering::SeqCst) {
        if args.frames > 0 && sent >= args.frames {
            break;
        }
        let t = start.elapsed().as_secs_f64();
        let detections = simulate_detections(t, args.targets, args.width, args.height);
        let image = render_frame(&detections, args.width, args.height);

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, 80).encode(
            image.as_raw(),
            args.width,
            args.height,
            ExtendedColorType::Rgb8,
        )?;

        let status = format!("MODE: AUTO | ALT: {:.1} m | T+{:.1}s", 50.0 + 5.0 * (t * 0.2).sin(), t);
        let bytes = encode_envelope(&status, &jpeg, &detections)?;
        conn.write_all(&bytes)?;
        sent += 1;

        std::thread::sleep(interval);
    }
    Ok(sent)
}

/// 读取地面站上行消息
fn spawn_message_reader(mut conn: TcpStream, disconnected: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        let mut reassembler = FrameReassembler::default();
        loop {
            let segment = match reassembler.pull_segment(&mut conn) {
                Ok(segment) => segment,
                Err(_) => break,
            };
            let text = String::from_utf8_lossy(&segment);
            if text == DISCONNECT_MESSAGE {
                log::info!("📴 地面站请求断开");
                break;
            }
            log::info!("📨 收到地面站消息: {}", text);
        }
        disconnected.store(true, Ordering::SeqCst);
    });
}

/// 目标沿椭圆轨迹移动, 第一个目标为未跟踪噪声 (track_id = 0)
fn simulate_detections(t: f64, count: usize, width: u32, height: u32) -> Vec<Detection> {
    (0..count)
        .map(|i| {
            let phase = t * 0.3 + i as f64 * 2.1;
            let cx = width as f64 * (0.5 + 0.35 * phase.cos());
            let cy = height as f64 * (0.5 + 0.3 * phase.sin());
            let (w, h) = (60.0 + 10.0 * i as f64, 40.0 + 15.0 * i as f64);
            let bbox = BBox::new((cx - w / 2.0) as f32, (cy - h / 2.0) as f32, w as f32, h as f32);
            let position = [
                ORIGIN[0] + 0.0005 * phase.sin(),
                ORIGIN[1] + 0.0005 * phase.cos(),
            ];
            Detection::new(i as i64, bbox, position)
        })
        .collect()
}

fn render_frame(detections: &[Detection], width: u32, height: u32) -> RgbImage {
    let mut image = RgbImage::from_fn(width, height, |x, y| {
        let g = (y * 120 / height.max(1)) as u8;
        Rgb([30 + (x % 64) as u8 / 8, 60 + g, 40])
    });
    for det in detections {
        let b = &det.bbox;
        let (w, h) = (b.width.max(1.0) as u32, b.height.max(1.0) as u32);
        draw_filled_rect_mut(
            &mut image,
            Rect::at(b.left as i32, b.top as i32).of_size(w, h),
            Rgb([200, 200, 210]),
        );
    }
    image
}
