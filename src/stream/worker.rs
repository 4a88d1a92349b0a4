// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 视频流工作线程 (StreamWorker)
/// 职责: 连接机载端 → 重组数据包 → 解码 → 目标登记 → 叠加层/录像 → 发布给显示层
use super::envelope::EnvelopeDecoder;
use super::overlay::OverlayCompositor;
use super::reassembler::FrameReassembler;
use super::recorder::VideoRecorder;
use super::registry::{Observation, TargetRegistry};
use super::transport::{TcpTransport, TransportCloser};
use super::types::{
    DecodedFrame, OverlayOptions, PublishedFrame, StreamEvent, WorkerCommand, WorkerState,
};
use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::utils::{fit_within, resize_rgb};
use chrono::Utc;
use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError};
use image::RgbImage;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// 状态通知的最长等待时间 (帧数据不等待, 队列满直接丢弃)
const NOTICE_TIMEOUT: Duration = Duration::from_millis(200);

/// 断开连接消息
pub const DISCONNECT_MESSAGE: &str = "!DISCONNECT";

// ========== 共享状态 ==========

/// 工作线程与控制端共享的状态
struct Shared {
    state: Mutex<WorkerState>,
    stop: AtomicBool,
    closer: Mutex<Option<TransportCloser>>,
    last_error: Mutex<Option<String>>,
    detached: AtomicBool, // 控制端不再读取事件
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(WorkerState::Idle),
            stop: AtomicBool::new(false),
            closer: Mutex::new(None),
            last_error: Mutex::new(None),
            detached: AtomicBool::new(false),
        }
    }

    fn state(&self) -> WorkerState {
        self.state.lock().map(|s| *s).unwrap_or(WorkerState::Failed)
    }

    fn set_state(&self, state: WorkerState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    fn set_closer(&self, closer: Option<TransportCloser>) {
        if let Ok(mut guard) = self.closer.lock() {
            *guard = closer;
        }
    }

    fn close_transport(&self) {
        if let Ok(guard) = self.closer.lock() {
            if let Some(closer) = guard.as_ref() {
                closer.close();
            }
        }
    }

    fn set_last_error(&self, err: &StreamError) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.to_string());
        }
    }
}

// ========== 控制端 ==========

/// 视频流工作者 (未启动时可修改连接地址)
pub struct StreamWorker {
    config: StreamConfig,
    shared: Arc<Shared>,
}

impl StreamWorker {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::new()),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// 上一个会话已结束时回到 Idle
    fn recycle(&mut self) {
        if self.shared.state() == WorkerState::Stopped {
            self.shared = Arc::new(Shared::new());
        }
    }

    /// 修改机载端地址, 只允许在 Idle 状态 (含上一会话 Stopped 之后) 调用
    pub fn set_endpoint(&mut self, endpoint: impl Into<String>) -> Result<()> {
        self.recycle();
        let state = self.state();
        if state != WorkerState::Idle {
            return Err(StreamError::InvalidState(state));
        }
        self.config.endpoint = endpoint.into();
        Ok(())
    }

    /// 启动工作线程
    pub fn start(&mut self) -> Result<WorkerHandle> {
        self.recycle();
        let state = self.state();
        if state != WorkerState::Idle {
            return Err(StreamError::InvalidState(state));
        }
        self.shared.set_state(WorkerState::Connecting);

        let (event_tx, event_rx) = crossbeam_channel::bounded(self.config.publish_capacity.max(1));
        let (command_tx, command_rx) = crossbeam_channel::unbounded();

        let mut session = Session::new(self.config.clone(), self.shared.clone(), event_tx, command_rx);
        let thread = std::thread::Builder::new()
            .name("gcs-stream-worker".to_string())
            .spawn(move || session.run())
            .map_err(|e| {
                self.shared.set_state(WorkerState::Idle);
                StreamError::Transport(e.into())
            })?;

        Ok(WorkerHandle {
            shared: self.shared.clone(),
            thread: Some(thread),
            events: event_rx,
            commands: command_tx,
        })
    }
}

/// 运行中的工作线程句柄, Drop 时停止并等待线程退出
///
/// 会话结束时工作线程会等待显示层取走剩余目标事件与 Disconnected,
/// 应先读到 Disconnected 再调用 join
pub struct WorkerHandle {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    events: Receiver<StreamEvent>,
    commands: Sender<WorkerCommand>,
}

/// 可跨线程传递的停止句柄
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<Shared>,
}

impl StopHandle {
    /// 请求停止: 设置停止标志并关闭套接字读方向, 阻塞中的读取立即返回
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.close_transport();
    }
}

impl WorkerHandle {
    pub fn stop(&self) {
        self.stop_handle().stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: self.shared.clone(),
        }
    }

    /// 等待工作线程退出, 未取走的会话结束事件将被放弃
    pub fn join(&mut self) {
        self.shared.detached.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("❌ 工作线程异常退出");
                self.shared.set_state(WorkerState::Stopped);
            }
        }
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// 发送控制命令, 工作线程已退出时返回 false
    pub fn send(&self, command: WorkerCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// 命令发送端, 可交给其他线程使用
    pub fn commands(&self) -> Sender<WorkerCommand> {
        self.commands.clone()
    }

    pub fn events(&self) -> &Receiver<StreamEvent> {
        &self.events
    }

    /// 导致会话失败的错误
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().ok().and_then(|e| e.clone())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

// ========== 工作线程 ==========

/// 会话结束原因
#[derive(Debug)]
enum SessionEnd {
    PeerClosed,
    StopRequested,
    Failed(StreamError),
}

/// 工作线程独占的会话状态
struct Session {
    config: StreamConfig,
    shared: Arc<Shared>,
    events: Sender<StreamEvent>,
    commands: Receiver<WorkerCommand>,

    decoder: EnvelopeDecoder,
    reassembler: FrameReassembler,
    registry: TargetRegistry,
    compositor: OverlayCompositor,
    recorder: Option<VideoRecorder>,
    options: OverlayOptions,
    pending: Observation, // 显示队列满时未送达的目标事件

    // 统计
    frame_id: u64,
    dropped_frames: u64,
    decode_errors: u64,
}

impl Session {
    fn new(
        config: StreamConfig,
        shared: Arc<Shared>,
        events: Sender<StreamEvent>,
        commands: Receiver<WorkerCommand>,
    ) -> Self {
        let font = config
            .font_path
            .as_deref()
            .and_then(OverlayCompositor::load_font)
            .or_else(OverlayCompositor::default_font);
        Self {
            decoder: EnvelopeDecoder::new(config.validation_policy),
            reassembler: FrameReassembler::new(config.chunk_size, config.max_segment_len),
            registry: TargetRegistry::new(),
            compositor: OverlayCompositor::new(config.fps_window, font),
            recorder: None,
            options: config.overlay,
            pending: Observation::default(),
            frame_id: 0,
            dropped_frames: 0,
            decode_errors: 0,
            config,
            shared,
            events,
            commands,
        }
    }

    fn run(&mut self) {
        self.set_state(WorkerState::Connecting);
        log::info!("🔌 连接机载端: {}", self.config.endpoint);

        let end = match TcpTransport::connect(
            &self.config.endpoint,
            self.config.connect_timeout(),
            self.config.read_timeout(),
        ) {
            Ok(mut transport) => {
                let end = self.stream(&mut transport);
                self.shared.set_closer(None);
                if matches!(end, SessionEnd::StopRequested) {
                    if let Err(e) = transport.send_message(DISCONNECT_MESSAGE) {
                        log::debug!("断开消息发送失败: {}", e);
                    }
                }
                transport.close();
                end
            }
            Err(e) if self.shared.stop_requested() => {
                log::debug!("连接期间收到停止请求: {}", e);
                SessionEnd::StopRequested
            }
            Err(e) => SessionEnd::Failed(e),
        };

        // 释放录像
        if let Some(mut recorder) = self.recorder.take() {
            if let Err(e) = recorder.finish() {
                log::error!("❌ {}", e);
            }
        }

        let reason = match end {
            SessionEnd::PeerClosed => {
                log::info!("🔚 机载端关闭连接");
                None
            }
            SessionEnd::StopRequested => {
                log::info!("⏹️ 视频流已停止");
                None
            }
            SessionEnd::Failed(e) => {
                log::error!("❌ 视频流失败: {}", e);
                self.shared.set_last_error(&e);
                self.set_state(WorkerState::Failed);
                Some(e.to_string())
            }
        };

        log::info!(
            "📊 共 {} 帧, 丢弃 {} 帧, 解码失败 {} 帧, 目标 {} 个",
            self.frame_id,
            self.dropped_frames,
            self.decode_errors,
            self.registry.len()
        );
        self.set_state(WorkerState::Stopped);

        // 补发丢帧时未送达的目标事件, 再通知断开
        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            self.deliver(StreamEvent::Targets {
                new_targets: pending.new_targets,
                position_updates: pending.position_updates,
            });
        }
        self.deliver(StreamEvent::Disconnected { reason });
    }

    fn stream(&mut self, transport: &mut TcpTransport) -> SessionEnd {
        match transport.closer() {
            Ok(closer) => self.shared.set_closer(Some(closer)),
            Err(e) => return SessionEnd::Failed(e),
        }
        // 连接过程中收到的停止请求
        if self.shared.stop_requested() {
            return SessionEnd::StopRequested;
        }

        self.set_state(WorkerState::Streaming);
        log::info!("✅ 已连接: {}", transport.endpoint());

        if let Some(path) = self.config.record.path.clone() {
            self.start_recording(&path);
        }

        loop {
            if self.shared.stop_requested() {
                return SessionEnd::StopRequested;
            }
            self.drain_commands(transport);

            let envelope = match self.decoder.read_envelope(&mut self.reassembler, transport) {
                Ok(Some(envelope)) => envelope,
                Ok(None) if self.shared.stop_requested() => return SessionEnd::StopRequested,
                Ok(None) => return SessionEnd::PeerClosed,
                Err(_) if self.shared.stop_requested() => return SessionEnd::StopRequested,
                Err(e) => return SessionEnd::Failed(e),
            };

            match self.decoder.decode(envelope) {
                Ok(frame) => self.process(frame),
                Err(e) if e.is_recoverable() => {
                    self.decode_errors += 1;
                    log::warn!("⚠️ 丢弃损坏帧: {}", e);
                }
                Err(e) => return SessionEnd::Failed(e),
            }
        }
    }

    /// 处理一帧: 目标登记 → 录像 → 叠加层 → 缩放 → 发布
    fn process(&mut self, frame: DecodedFrame) {
        let DecodedFrame {
            status_text,
            mut image,
            detections,
        } = frame;

        let mut observation = std::mem::take(&mut self.pending);
        observation.merge(self.registry.observe(&detections, &image, Utc::now()));

        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(e) = recorder.append(&image) {
                log::error!("❌ 录像写入失败, 停止录像: {}", e);
                self.recorder = None;
            }
        }

        if self.options.any() {
            self.compositor
                .compose(&mut image, &detections, Instant::now(), self.options);
        }

        let image = self.scale_for_display(image);

        self.frame_id += 1;
        let published = PublishedFrame {
            frame_id: self.frame_id,
            image,
            status_text,
            new_targets: observation.new_targets,
            position_updates: observation.position_updates,
        };

        match self.events.try_send(StreamEvent::Frame(published)) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped_frames += 1;
                log::debug!("显示队列已满, 丢弃第 {} 帧", self.frame_id);
                // 图像可以丢, 目标事件留给下一帧
                if let StreamEvent::Frame(frame) = event {
                    self.pending = Observation {
                        new_targets: frame.new_targets,
                        position_updates: frame.position_updates,
                    };
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("显示端已断开");
            }
        }
    }

    fn scale_for_display(&self, image: RgbImage) -> RgbImage {
        let Some((max_w, max_h)) = self.config.display_size else {
            return image;
        };
        let (w, h) = fit_within(image.width(), image.height(), max_w, max_h);
        if (w, h) == image.dimensions() {
            return image;
        }
        match resize_rgb(&image, w, h) {
            Ok(scaled) => scaled,
            Err(e) => {
                log::warn!("⚠️ 显示缩放失败: {}", e);
                image
            }
        }
    }

    fn drain_commands(&mut self, transport: &mut TcpTransport) {
        while let Ok(command) = self.commands.try_recv() {
            log::debug!("收到命令: {:?}", command);
            match command {
                WorkerCommand::SetOptions(options) => self.options = options,
                WorkerCommand::SetRoll(roll) => self.compositor.set_roll(roll),
                WorkerCommand::StartRecording(path) => self.start_recording(&path),
                WorkerCommand::StopRecording => {
                    if let Some(mut recorder) = self.recorder.take() {
                        if let Err(e) = recorder.finish() {
                            log::error!("❌ {}", e);
                        }
                    }
                }
                WorkerCommand::PauseRecording => {
                    if let Some(recorder) = self.recorder.as_mut() {
                        recorder.pause();
                    }
                }
                WorkerCommand::ResumeRecording => {
                    if let Some(recorder) = self.recorder.as_mut() {
                        recorder.resume();
                    }
                }
                WorkerCommand::SendMessage(text) => {
                    if let Err(e) = transport.send_message(&text) {
                        log::warn!("⚠️ 消息发送失败: {}", e);
                    }
                }
            }
        }
    }

    /// 打开录像文件, 失败只关闭录像
    fn start_recording(&mut self, path: &Path) {
        // 先结束旧文件
        if let Some(mut recorder) = self.recorder.take() {
            if let Err(e) = recorder.finish() {
                log::error!("❌ {}", e);
            }
        }
        let record = &self.config.record;
        match VideoRecorder::create(path, record.fps, record.width, record.height)
            .map(|recorder| recorder.with_size_limit(record.max_file_bytes))
        {
            Ok(recorder) => self.recorder = Some(recorder),
            Err(e) => log::error!("❌ 无法开始录像, 录像已关闭: {}", e),
        }
    }

    fn set_state(&self, state: WorkerState) {
        self.shared.set_state(state);
        self.notify(StreamEvent::StateChanged(state));
    }

    fn notify(&self, event: StreamEvent) {
        if self.events.send_timeout(event, NOTICE_TIMEOUT).is_err() {
            log::debug!("状态通知未送达");
        }
    }

    /// 阻塞送达, 直到显示层取走、断开或放弃读取
    fn deliver(&self, mut event: StreamEvent) {
        loop {
            match self.events.send_timeout(event, NOTICE_TIMEOUT) {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(unsent)) if !self.shared.detached() => event = unsent,
                Err(_) => {
                    log::debug!("会话结束事件未送达");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::stream::envelope::encode_envelope;
    use crate::stream::envelope::tests::test_jpeg;
    use crate::stream::overlay::HUD_COLOR;
    use crate::stream::types::{BBox, Detection};
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn test_config(endpoint: String) -> StreamConfig {
        StreamConfig {
            endpoint,
            read_timeout_ms: 3000,
            display_size: None,
            publish_capacity: 64,
            ..StreamConfig::default()
        }
    }

    /// 启动一个只服务一次连接的模拟机载端
    fn serve_once<F>(handler: F) -> (String, thread::JoinHandle<()>)
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            handler(conn);
        });
        (endpoint, server)
    }

    fn collect_frames(handle: &WorkerHandle) -> (Vec<PublishedFrame>, Option<String>) {
        let mut frames = Vec::new();
        loop {
            match handle.events().recv_timeout(Duration::from_secs(10)).unwrap() {
                StreamEvent::Frame(frame) => frames.push(frame),
                StreamEvent::StateChanged(_) | StreamEvent::Targets { .. } => {}
                StreamEvent::Disconnected { reason } => return (frames, reason),
            }
        }
    }

    fn tracked(track_id: i64) -> Detection {
        Detection::new(track_id, BBox::new(4.0, 4.0, 8.0, 8.0), [1.0, 2.0])
    }

    #[test]
    fn test_three_envelope_session() {
        let (endpoint, server) = serve_once(|mut conn| {
            let jpeg = test_jpeg(32, 24);
            for detections in [vec![], vec![tracked(1)], vec![tracked(1)]] {
                let bytes = encode_envelope("ARMED", &jpeg, &detections).unwrap();
                conn.write_all(&bytes).unwrap();
            }
        });

        let mut worker = StreamWorker::new(test_config(endpoint));
        let mut handle = worker.start().unwrap();
        let (frames, reason) = collect_frames(&handle);
        handle.join();
        server.join().unwrap();

        assert_eq!(reason, None);
        assert_eq!(frames.len(), 3);
        assert!(frames[0].new_targets.is_empty() && frames[0].position_updates.is_empty());
        assert_eq!(frames[1].new_targets.len(), 1);
        assert_eq!(frames[1].new_targets[0].track_id, 1);
        assert_eq!(frames[1].position_updates[0].position, [1.0, 2.0]);
        assert!(frames[2].new_targets.is_empty());
        assert_eq!(frames[2].position_updates[0].track_id, 1);
        assert_eq!(frames[2].status_text, "ARMED");
        assert_eq!(frames[2].frame_id, 3);
        assert_eq!(handle.state(), WorkerState::Stopped);
        assert!(handle.last_error().is_none());
    }

    #[test]
    fn test_corrupt_image_does_not_end_session() {
        let (endpoint, server) = serve_once(|mut conn| {
            let good = encode_envelope("ok", &test_jpeg(16, 16), &[]).unwrap();
            let bad = encode_envelope("bad", b"definitely not a jpeg", &[tracked(2)]).unwrap();
            conn.write_all(&good).unwrap();
            conn.write_all(&bad).unwrap();
            conn.write_all(&good).unwrap();
        });

        let mut worker = StreamWorker::new(test_config(endpoint));
        let mut handle = worker.start().unwrap();
        let (frames, reason) = collect_frames(&handle);
        handle.join();
        server.join().unwrap();

        assert_eq!(reason, None);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.status_text == "ok"));
    }

    #[test]
    fn test_truncated_prefix_fails_with_transport_error() {
        let (endpoint, server) = serve_once(|mut conn| {
            let good = encode_envelope("ok", &test_jpeg(16, 16), &[]).unwrap();
            conn.write_all(&good).unwrap();
            conn.write_all(&[0, 0, 0]).unwrap();
        });

        let mut worker = StreamWorker::new(test_config(endpoint));
        let mut handle = worker.start().unwrap();
        let (frames, reason) = collect_frames(&handle);
        handle.join();
        server.join().unwrap();

        assert_eq!(frames.len(), 1);
        assert!(reason.is_some());
        let expected = StreamError::Transport(TransportError::Closed).to_string();
        assert_eq!(handle.last_error(), Some(expected));
        assert_eq!(handle.state(), WorkerState::Stopped);
    }

    #[test]
    fn test_set_endpoint_only_when_idle() {
        // 保持连接直到客户端断开
        let (endpoint, server) = serve_once(|mut conn| {
            let _ = conn.read_to_end(&mut Vec::new());
        });

        let mut worker = StreamWorker::new(test_config("127.0.0.1:1".to_string()));
        worker.set_endpoint(endpoint).unwrap();
        let mut handle = worker.start().unwrap();

        let err = worker.set_endpoint("127.0.0.1:2").err().unwrap();
        assert!(matches!(err, StreamError::InvalidState(_)));
        assert!(matches!(worker.start(), Err(StreamError::InvalidState(_))));

        handle.stop();
        collect_frames(&handle);
        handle.join();
        server.join().unwrap();
    }

    #[test]
    fn test_second_session_after_stopped() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            for status in ["first", "second"] {
                let (mut conn, _) = listener.accept().unwrap();
                let bytes = encode_envelope(status, &test_jpeg(16, 16), &[tracked(3)]).unwrap();
                conn.write_all(&bytes).unwrap();
            }
        });

        let mut worker = StreamWorker::new(test_config(endpoint.clone()));
        let mut handle = worker.start().unwrap();
        let (first, reason) = collect_frames(&handle);
        handle.join();
        assert_eq!(reason, None);
        assert_eq!(worker.state(), WorkerState::Stopped);

        // 上一会话结束后可以换地址并重新启动
        worker.set_endpoint(endpoint).unwrap();
        assert_eq!(worker.state(), WorkerState::Idle);
        let mut handle = worker.start().unwrap();
        let (second, reason) = collect_frames(&handle);
        handle.join();
        server.join().unwrap();

        assert_eq!(reason, None);
        assert_eq!(first[0].status_text, "first");
        assert_eq!(second[0].status_text, "second");
        // 新会话的目标登记从头开始
        assert_eq!(second[0].frame_id, 1);
        assert_eq!(second[0].new_targets.len(), 1);
        assert_eq!(handle.state(), WorkerState::Stopped);
    }

    #[test]
    fn test_full_queue_keeps_target_events() {
        let (endpoint, server) = serve_once(|mut conn| {
            let jpeg = test_jpeg(16, 16);
            for i in 0..6 {
                let detections = if i >= 3 { vec![tracked(7)] } else { vec![] };
                let bytes = encode_envelope("ok", &jpeg, &detections).unwrap();
                conn.write_all(&bytes).unwrap();
            }
        });

        let mut config = test_config(endpoint);
        config.publish_capacity = 2;
        let mut worker = StreamWorker::new(config);
        let mut handle = worker.start().unwrap();

        // 显示层在会话结束前不读取, 队列一直是满的
        let deadline = Instant::now() + Duration::from_secs(10);
        while handle.state() != WorkerState::Stopped {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(20));
        }

        let mut new_targets = Vec::new();
        let mut positions = Vec::new();
        let reason = loop {
            match handle.events().recv_timeout(Duration::from_secs(5)).unwrap() {
                StreamEvent::Frame(frame) => {
                    new_targets.extend(frame.new_targets);
                    positions.extend(frame.position_updates);
                }
                StreamEvent::Targets {
                    new_targets: targets,
                    position_updates,
                } => {
                    new_targets.extend(targets);
                    positions.extend(position_updates);
                }
                StreamEvent::StateChanged(_) => {}
                StreamEvent::Disconnected { reason } => break reason,
            }
        };
        handle.join();
        server.join().unwrap();

        assert_eq!(reason, None);
        assert_eq!(new_targets.len(), 1);
        assert_eq!(new_targets[0].track_id, 7);
        assert!(positions.iter().any(|p| p.track_id == 7));
    }

    #[test]
    fn test_unopenable_recording_keeps_streaming() {
        // 父路径是普通文件, 无法创建录像
        let blocker = std::env::temp_dir().join(format!("gcs_stream_blocker_{}", std::process::id()));
        std::fs::write(&blocker, b"x").unwrap();

        let (endpoint, server) = serve_once(|mut conn| {
            let bytes = encode_envelope("ok", &test_jpeg(16, 16), &[]).unwrap();
            for _ in 0..3 {
                conn.write_all(&bytes).unwrap();
            }
        });

        let mut config = test_config(endpoint);
        config.record.path = Some(blocker.join("out.avi"));
        let mut worker = StreamWorker::new(config);
        let mut handle = worker.start().unwrap();
        let (frames, reason) = collect_frames(&handle);
        handle.join();
        server.join().unwrap();
        let _ = std::fs::remove_file(&blocker);

        assert_eq!(frames.len(), 3);
        assert_eq!(reason, None);
        assert!(handle.last_error().is_none());
    }

    #[test]
    fn test_recording_failure_disables_recording_only() {
        let path = std::env::temp_dir().join(format!("gcs_stream_full_{}.avi", std::process::id()));
        let (endpoint, server) = serve_once(|mut conn| {
            let bytes = encode_envelope("ok", &test_jpeg(16, 16), &[]).unwrap();
            for _ in 0..3 {
                conn.write_all(&bytes).unwrap();
            }
        });

        let mut config = test_config(endpoint);
        config.record.path = Some(path.clone());
        config.record.width = 64;
        config.record.height = 48;
        // 只够写文件头, 第一帧就写失败
        config.record.max_file_bytes = 300;
        let mut worker = StreamWorker::new(config);
        let mut handle = worker.start().unwrap();
        let (frames, reason) = collect_frames(&handle);
        handle.join();
        server.join().unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(reason, None);
        assert!(handle.last_error().is_none());

        // 录像已收尾, 没有帧
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes(bytes[48..52].try_into().unwrap()), 0);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_overlay_commands_apply_to_frames() {
        let (endpoint, server) = serve_once(|mut conn| {
            let bytes = encode_envelope("ok", &test_jpeg(64, 48), &[]).unwrap();
            conn.set_read_timeout(Some(Duration::from_millis(50))).unwrap();

            // 持续发帧, 直到客户端确认命令已发出
            let mut prefix = [0u8; 8];
            loop {
                conn.write_all(&bytes).unwrap();
                if conn.read_exact(&mut prefix).is_ok() {
                    break;
                }
            }
            let mut text = vec![0u8; u64::from_be_bytes(prefix) as usize];
            conn.read_exact(&mut text).unwrap();
            assert_eq!(text, b"ready");
            conn.write_all(&bytes).unwrap();
        });

        let mut worker = StreamWorker::new(test_config(endpoint));
        let mut handle = worker.start().unwrap();
        assert!(handle.send(WorkerCommand::SetOptions(OverlayOptions {
            show_hud: true,
            show_labels: false,
        })));
        assert!(handle.send(WorkerCommand::SetRoll(std::f32::consts::FRAC_PI_2)));
        assert!(handle.send(WorkerCommand::SendMessage("ready".to_string())));

        let (frames, reason) = collect_frames(&handle);
        handle.join();
        server.join().unwrap();
        assert_eq!(reason, None);

        // 横滚 90° 时地平线竖直穿过画面中心
        let last = &frames.last().unwrap().image;
        assert_eq!(*last.get_pixel(32, 10), HUD_COLOR);
        assert_ne!(*last.get_pixel(10, 24), HUD_COLOR);
    }

    #[test]
    fn test_stop_unblocks_silent_producer() {
        let (endpoint, server) = serve_once(|mut conn| {
            // 不发送任何数据, 等待客户端断开
            let mut buf = Vec::new();
            let _ = conn.read_to_end(&mut buf);
            assert!(buf.ends_with(DISCONNECT_MESSAGE.as_bytes()));
        });

        let mut config = test_config(endpoint);
        config.read_timeout_ms = 0;
        let mut worker = StreamWorker::new(config);
        let mut handle = worker.start().unwrap();

        // 等待进入 Streaming
        loop {
            let event = handle.events().recv_timeout(Duration::from_secs(5)).unwrap();
            if matches!(event, StreamEvent::StateChanged(WorkerState::Streaming)) {
                break;
            }
        }

        let started = Instant::now();
        handle.stop();
        let (_, reason) = collect_frames(&handle);
        handle.join();
        server.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(reason, None);
        assert_eq!(handle.state(), WorkerState::Stopped);
    }

    #[test]
    fn test_commands_reach_producer() {
        let (endpoint, server) = serve_once(|mut conn| {
            let bytes = encode_envelope("ok", &test_jpeg(16, 16), &[]).unwrap();
            conn.set_read_timeout(Some(Duration::from_millis(50))).unwrap();

            // 持续发帧, 直到收到客户端消息
            let mut prefix = [0u8; 8];
            loop {
                conn.write_all(&bytes).unwrap();
                if conn.read_exact(&mut prefix).is_ok() {
                    break;
                }
            }
            let mut text = vec![0u8; u64::from_be_bytes(prefix) as usize];
            conn.read_exact(&mut text).unwrap();
            assert_eq!(text, b"TAKEOFF");
        });

        let mut worker = StreamWorker::new(test_config(endpoint));
        let mut handle = worker.start().unwrap();
        assert!(handle.send(WorkerCommand::SendMessage("TAKEOFF".to_string())));

        let (frames, reason) = collect_frames(&handle);
        handle.join();
        server.join().unwrap();
        assert!(!frames.is_empty());
        assert_eq!(reason, None);
    }
}
