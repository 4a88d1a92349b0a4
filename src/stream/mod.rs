// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 地面站视频流接收模块
/// Ground-station video/telemetry stream ingest
///
/// 双线程架构(通过crossbeam通道通信):
/// 1. 工作线程: TCP接收 → 数据包重组 → 解码 → 目标登记 → 叠加层/录像 → 发布StreamEvent
/// 2. 显示线程: 接收StreamEvent, 通过WorkerCommand回传控制命令
pub mod envelope;
pub mod overlay;
pub mod reassembler;
pub mod recorder;
pub mod registry;
pub mod transport;
pub mod types;
pub mod worker;

// ========== 重新导出常用类型 ==========

pub use envelope::{encode_envelope, encode_segment, EnvelopeDecoder, WireDetection};
pub use overlay::{FpsWindow, OverlayCompositor};
pub use reassembler::FrameReassembler;
pub use recorder::{VideoRecorder, MAX_FILE_BYTES};
pub use registry::{crop_thumbnail, Observation, TargetRegistry};
pub use transport::{TcpTransport, TransportCloser};
pub use types::{
    BBox, DecodedFrame, Detection, FrameEnvelope, NewTarget, OverlayOptions, PositionUpdate,
    PublishedFrame, StreamEvent, TargetRecord, ValidationPolicy, WorkerCommand, WorkerState,
};
pub use worker::{StopHandle, StreamWorker, WorkerHandle, DISCONNECT_MESSAGE};
