// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 数据包解码器
/// Envelope decoder: status text + compressed image + MessagePack detections
///
/// 线上格式 (每个分段前有8字节大端长度):
/// 1. status_text       UTF-8 文本
/// 2. image_payload     压缩图像 (JPEG等)
/// 3. detection_payload MessagePack 数组, 每个元素是检测记录
use super::reassembler::{FrameReassembler, LENGTH_PREFIX_SIZE};
use super::types::{BBox, DecodedFrame, Detection, FrameEnvelope, ValidationPolicy};
use crate::error::{Result, StreamError};
use serde::{Deserialize, Serialize};
use std::io::Read;

/// 线上检测记录 (字段名与机载端一致)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireDetection {
    pub track_id: i64,
    pub bb_left: f64,
    pub bb_top: f64,
    pub bb_width: f64,
    pub bb_height: f64,
    pub position: [f64; 2],
}

impl From<&Detection> for WireDetection {
    fn from(det: &Detection) -> Self {
        Self {
            track_id: det.track_id,
            bb_left: det.bbox.left as f64,
            bb_top: det.bbox.top as f64,
            bb_width: det.bbox.width as f64,
            bb_height: det.bbox.height as f64,
            position: det.position,
        }
    }
}

/// 数据包解码器
pub struct EnvelopeDecoder {
    policy: ValidationPolicy,
}

impl Default for EnvelopeDecoder {
    fn default() -> Self {
        Self::new(ValidationPolicy::default())
    }
}

impl EnvelopeDecoder {
    pub fn new(policy: ValidationPolicy) -> Self {
        Self { policy }
    }

    /// 读取一个完整数据包
    ///
    /// 三个分段全部收齐后才解析. 在数据包边界处对端关闭返回 Ok(None)
    pub fn read_envelope<R: Read>(
        &self,
        reassembler: &mut FrameReassembler,
        reader: &mut R,
    ) -> Result<Option<FrameEnvelope>> {
        let status = match reassembler.pull_segment(reader) {
            Err(e) if e.is_peer_closed() && reassembler.is_at_boundary() => return Ok(None),
            other => other?,
        };
        let image_bytes = reassembler.pull_segment(reader)?;
        let detection_payload = reassembler.pull_segment(reader)?;

        let status_text = String::from_utf8(status)
            .map_err(|e| StreamError::Protocol(format!("status text is not UTF-8: {}", e)))?;
        let detections = self.parse_detections(&detection_payload)?;

        Ok(Some(FrameEnvelope {
            status_text,
            image_bytes,
            detections,
        }))
    }

    /// 解析 MessagePack 检测列表并按策略校验
    pub fn parse_detections(&self, payload: &[u8]) -> Result<Vec<Detection>> {
        let records: Vec<WireDetection> = rmp_serde::from_slice(payload)
            .map_err(|e| StreamError::Protocol(format!("detection payload: {}", e)))?;

        records
            .into_iter()
            .map(|record| self.validate(record))
            .collect()
    }

    fn validate(&self, record: WireDetection) -> Result<Detection> {
        let numbers = [
            record.bb_left,
            record.bb_top,
            record.bb_width,
            record.bb_height,
            record.position[0],
            record.position[1],
        ];
        if numbers.iter().any(|v| !v.is_finite()) {
            return Err(StreamError::Protocol(format!(
                "track {}: non-finite value in detection",
                record.track_id
            )));
        }

        let (mut width, mut height) = (record.bb_width, record.bb_height);
        if width < 0.0 || height < 0.0 {
            match self.policy {
                ValidationPolicy::Reject => {
                    return Err(StreamError::Protocol(format!(
                        "track {}: negative bbox size {}x{}",
                        record.track_id, width, height
                    )));
                }
                ValidationPolicy::Clamp => {
                    width = width.max(0.0);
                    height = height.max(0.0);
                }
            }
        }

        Ok(Detection {
            track_id: record.track_id,
            bbox: BBox::new(
                record.bb_left as f32,
                record.bb_top as f32,
                width as f32,
                height as f32,
            ),
            position: record.position,
        })
    }

    /// 解码压缩图像, 失败只影响当前帧
    pub fn decode(&self, envelope: FrameEnvelope) -> Result<DecodedFrame> {
        let image = image::load_from_memory(&envelope.image_bytes)
            .map_err(|e| StreamError::Decode(e.to_string()))?
            .to_rgb8();

        Ok(DecodedFrame {
            status_text: envelope.status_text,
            image,
            detections: envelope.detections,
        })
    }
}

// ========== 编码 (机载端模拟 / 上行消息) ==========

/// 为单个分段加上8字节大端长度前缀
pub fn encode_segment(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// 编码一个完整数据包
pub fn encode_envelope(
    status_text: &str,
    image_bytes: &[u8],
    detections: &[Detection],
) -> Result<Vec<u8>> {
    let records: Vec<WireDetection> = detections.iter().map(WireDetection::from).collect();
    let payload = rmp_serde::to_vec_named(&records)
        .map_err(|e| StreamError::Protocol(format!("encode detections: {}", e)))?;

    let mut out = encode_segment(status_text.as_bytes());
    out.extend(encode_segment(image_bytes));
    out.extend(encode_segment(&payload));
    Ok(out)
}
