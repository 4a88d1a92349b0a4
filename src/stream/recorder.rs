// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 录像模块 (Motion-JPEG AVI)
//!
//! 文件布局:
//! ```text
//! RIFF 'AVI '
//!   LIST 'hdrl' { avih, LIST 'strl' { strh, strf } }
//!   LIST 'movi' { '00dc' jpeg ... }
//!   idx1
//! ```
//! 帧数与各块大小在 finish() 时回填

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};

use crate::error::{Result, StreamError};
use crate::utils::resize_rgb;

/// JPEG 压缩质量
pub const JPEG_QUALITY: u8 = 85;

const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;
const FRAME_CHUNK_ID: &[u8; 4] = b"00dc";
const HEADER_LEN: u64 = 224;

/// RIFF 大小字段为32位, 文件不能超过 4 GiB
pub const MAX_FILE_BYTES: u64 = u32::MAX as u64;

/// 回填位置 (文件偏移)
#[derive(Debug, Clone, Copy, Default)]
struct PatchOffsets {
    riff_size: u64,
    total_frames: u64,
    stream_length: u64,
    movi_size: u64,
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    offset: u32,
    size: u32,
}

/// 录像写入器
pub struct VideoRecorder {
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    fps: u32,
    width: u32,
    height: u32,
    patches: PatchOffsets,
    index: Vec<IndexEntry>,
    movi_offset: u64, // 相对 'movi' 标记的偏移
    max_file_bytes: u64,
    paused: bool,
}

impl VideoRecorder {
    /// 创建录像文件并写入文件头
    pub fn create(path: impl AsRef<Path>, fps: u32, width: u32, height: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if fps == 0 || width == 0 || height == 0 {
            return Err(StreamError::Persistence(format!(
                "非法录像参数: {}x{} @ {} fps",
                width, height, fps
            )));
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| persistence(&path, e))?;
        }
        let file = File::create(&path).map_err(|e| persistence(&path, e))?;
        let mut writer = BufWriter::new(file);

        let (header, patches) = build_header(fps, width, height);
        writer.write_all(&header).map_err(|e| persistence(&path, e))?;

        log::info!("🎬 开始录像: {} ({}x{} @ {} fps)", path.display(), width, height, fps);

        Ok(Self {
            writer: Some(writer),
            path,
            fps,
            width,
            height,
            patches,
            index: Vec::new(),
            movi_offset: 4,
            max_file_bytes: MAX_FILE_BYTES,
            paused: false,
        })
    }

    /// 设置文件大小上限 (不超过 4 GiB), 写满后 append 返回错误
    pub fn with_size_limit(mut self, max_file_bytes: u64) -> Self {
        self.max_file_bytes = max_file_bytes.min(MAX_FILE_BYTES);
        self
    }

    /// 追加一帧后的文件总长度 (含索引)
    fn projected_len(&self, size: u64) -> u64 {
        let chunk = 8 + size + (size % 2);
        let index = 8 + (self.index.len() as u64 + 1) * 16;
        HEADER_LEN - 4 + self.movi_offset + chunk + index
    }

    /// 追加一帧 (暂停时忽略)
    pub fn append(&mut self, image: &RgbImage) -> Result<()> {
        if self.paused {
            return Ok(());
        }
        if self.writer.is_none() {
            return Err(StreamError::Persistence("录像已结束".to_string()));
        }
        let path = self.path.clone();

        let jpeg = encode_frame(image, self.width, self.height)?;
        if self.projected_len(jpeg.len() as u64) > self.max_file_bytes {
            return Err(StreamError::Persistence(format!(
                "{}: 录像文件达到 {} 字节上限",
                path.display(),
                self.max_file_bytes
            )));
        }
        let size = jpeg.len() as u32;
        let Some(writer) = self.writer.as_mut() else {
            return Err(StreamError::Persistence("录像已结束".to_string()));
        };

        writer.write_all(FRAME_CHUNK_ID).map_err(|e| persistence(&path, e))?;
        writer.write_all(&size.to_le_bytes()).map_err(|e| persistence(&path, e))?;
        writer.write_all(&jpeg).map_err(|e| persistence(&path, e))?;
        if size % 2 == 1 {
            writer.write_all(&[0]).map_err(|e| persistence(&path, e))?;
        }

        self.index.push(IndexEntry {
            offset: self.movi_offset as u32,
            size,
        });
        self.movi_offset += 8 + u64::from(size) + u64::from(size % 2);
        Ok(())
    }

    /// 写索引并回填文件头, 重复调用无副作用
    pub fn finish(&mut self) -> Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        let path = self.path.clone();
        let frames = self.index.len() as u32;

        let mut idx = Vec::with_capacity(8 + self.index.len() * 16);
        idx.extend_from_slice(b"idx1");
        idx.extend_from_slice(&((self.index.len() * 16) as u32).to_le_bytes());
        for entry in &self.index {
            idx.extend_from_slice(FRAME_CHUNK_ID);
            idx.extend_from_slice(&AVIIF_KEYFRAME.to_le_bytes());
            idx.extend_from_slice(&entry.offset.to_le_bytes());
            idx.extend_from_slice(&entry.size.to_le_bytes());
        }
        writer.write_all(&idx).map_err(|e| persistence(&path, e))?;

        let file_len = writer.stream_position().map_err(|e| persistence(&path, e))?;
        let movi_size = self.movi_offset as u32;
        let patches = [
            (self.patches.riff_size, (file_len - 8) as u32),
            (self.patches.total_frames, frames),
            (self.patches.stream_length, frames),
            (self.patches.movi_size, movi_size),
        ];
        for (offset, value) in patches {
            writer
                .seek(SeekFrom::Start(offset))
                .map_err(|e| persistence(&path, e))?;
            writer
                .write_all(&value.to_le_bytes())
                .map_err(|e| persistence(&path, e))?;
        }
        writer.flush().map_err(|e| persistence(&path, e))?;

        log::info!("💾 录像已保存: {} ({} 帧)", path.display(), frames);
        Ok(())
    }

    pub fn pause(&mut self) {
        if !self.paused {
            log::info!("⏸️ 录像暂停");
        }
        self.paused = true;
    }

    pub fn resume(&mut self) {
        if self.paused {
            log::info!("▶️ 录像继续");
        }
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// 已写入帧数
    pub fn frames(&self) -> usize {
        self.index.len()
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for VideoRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            log::error!("❌ 录像收尾失败: {}", e);
        }
    }
}

fn persistence(path: &Path, err: std::io::Error) -> StreamError {
    StreamError::Persistence(format!("{}: {}", path.display(), err))
}

/// 缩放到录像分辨率并压缩为 JPEG
fn encode_frame(image: &RgbImage, width: u32, height: u32) -> Result<Vec<u8>> {
    let scaled;
    let frame = if image.dimensions() == (width, height) {
        image
    } else {
        scaled = resize_rgb(image, width, height).map_err(StreamError::Persistence)?;
        &scaled
    };

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode(frame.as_raw(), width, height, ExtendedColorType::Rgb8)
        .map_err(|e| StreamError::Persistence(format!("JPEG 编码失败: {}", e)))?;
    Ok(jpeg)
}

// ========== 文件头 ==========

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn build_header(fps: u32, width: u32, height: u32) -> (Vec<u8>, PatchOffsets) {
    let mut buf = Vec::with_capacity(HEADER_LEN as usize);
    let mut patches = PatchOffsets::default();

    buf.extend_from_slice(b"RIFF");
    patches.riff_size = buf.len() as u64;
    put_u32(&mut buf, 0);
    buf.extend_from_slice(b"AVI ");

    // LIST hdrl: 4 + (8 + 56) + (8 + 116)
    buf.extend_from_slice(b"LIST");
    put_u32(&mut buf, 192);
    buf.extend_from_slice(b"hdrl");

    buf.extend_from_slice(b"avih");
    put_u32(&mut buf, 56);
    put_u32(&mut buf, 1_000_000 / fps); // 每帧微秒
    put_u32(&mut buf, 0);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, AVIF_HASINDEX);
    patches.total_frames = buf.len() as u64;
    put_u32(&mut buf, 0);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, 1); // 流数量
    put_u32(&mut buf, width * height * 3);
    put_u32(&mut buf, width);
    put_u32(&mut buf, height);
    for _ in 0..4 {
        put_u32(&mut buf, 0);
    }

    // LIST strl: 4 + (8 + 56) + (8 + 40)
    buf.extend_from_slice(b"LIST");
    put_u32(&mut buf, 116);
    buf.extend_from_slice(b"strl");

    buf.extend_from_slice(b"strh");
    put_u32(&mut buf, 56);
    buf.extend_from_slice(b"vids");
    buf.extend_from_slice(b"MJPG");
    put_u32(&mut buf, 0);
    put_u16(&mut buf, 0);
    put_u16(&mut buf, 0);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, 1); // scale
    put_u32(&mut buf, fps); // rate
    put_u32(&mut buf, 0);
    patches.stream_length = buf.len() as u64;
    put_u32(&mut buf, 0);
    put_u32(&mut buf, width * height * 3);
    put_u32(&mut buf, u32::MAX); // 默认质量
    put_u32(&mut buf, 0);
    put_u16(&mut buf, 0);
    put_u16(&mut buf, 0);
    put_u16(&mut buf, width as u16);
    put_u16(&mut buf, height as u16);

    // BITMAPINFOHEADER
    buf.extend_from_slice(b"strf");
    put_u32(&mut buf, 40);
    put_u32(&mut buf, 40);
    put_u32(&mut buf, width);
    put_u32(&mut buf, height);
    put_u16(&mut buf, 1);
    put_u16(&mut buf, 24);
    buf.extend_from_slice(b"MJPG");
    put_u32(&mut buf, width * height * 3);
    for _ in 0..4 {
        put_u32(&mut buf, 0);
    }

    buf.extend_from_slice(b"LIST");
    patches.movi_size = buf.len() as u64;
    put_u32(&mut buf, 0);
    buf.extend_from_slice(b"movi");

    (buf, patches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("gcs_stream_{}_{}.avi", name, std::process::id()))
    }

    fn read_u32(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn test_header_layout() {
        let (header, patches) = build_header(30, 1280, 720);
        assert_eq!(header.len(), 224);
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(&header[8..12], b"AVI ");
        assert_eq!(&header[212..216], b"LIST");
        assert_eq!(&header[220..224], b"movi");
        assert_eq!(patches.total_frames, 48);
        assert_eq!(patches.stream_length, 140);
        assert_eq!(patches.movi_size, 216);
        assert_eq!(read_u32(&header, 32), 33_333);
    }

    #[test]
    fn test_recorder_writes_frames() {
        let path = temp_path("frames");
        let mut recorder = VideoRecorder::create(&path, 30, 64, 48).unwrap();
        let frame = RgbImage::from_pixel(128, 96, Rgb([10, 200, 30]));
        for _ in 0..3 {
            recorder.append(&frame).unwrap();
        }
        assert_eq!(recorder.frames(), 3);
        recorder.finish().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(read_u32(&bytes, 4) as usize, bytes.len() - 8);
        assert_eq!(read_u32(&bytes, 48), 3);
        assert_eq!(read_u32(&bytes, 140), 3);
        assert_eq!(&bytes[224..228], b"00dc");
        // 第一帧是合法 JPEG
        let size = read_u32(&bytes, 228) as usize;
        let first = image::load_from_memory(&bytes[232..232 + size]).unwrap();
        assert_eq!((first.width(), first.height()), (64, 48));

        let movi_size = read_u32(&bytes, 216) as usize;
        assert_eq!(&bytes[220 + movi_size..224 + movi_size], b"idx1");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_paused_recorder_skips_frames() {
        let path = temp_path("paused");
        let mut recorder = VideoRecorder::create(&path, 10, 32, 32).unwrap();
        let frame = RgbImage::new(32, 32);
        recorder.append(&frame).unwrap();
        recorder.pause();
        recorder.append(&frame).unwrap();
        assert!(recorder.is_paused());
        recorder.resume();
        recorder.append(&frame).unwrap();
        assert_eq!(recorder.frames(), 2);
        drop(recorder);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(read_u32(&bytes, 48), 2);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_size_limit_stops_appends() {
        let frame = RgbImage::from_pixel(32, 32, Rgb([90, 90, 90]));

        // 两帧文件的实际大小作为上限
        let reference = temp_path("limit_ref");
        let mut recorder = VideoRecorder::create(&reference, 30, 32, 32).unwrap();
        recorder.append(&frame).unwrap();
        recorder.append(&frame).unwrap();
        recorder.finish().unwrap();
        let limit = std::fs::metadata(&reference).unwrap().len();
        let _ = std::fs::remove_file(&reference);

        let path = temp_path("limit");
        let mut recorder = VideoRecorder::create(&path, 30, 32, 32)
            .unwrap()
            .with_size_limit(limit);
        recorder.append(&frame).unwrap();
        recorder.append(&frame).unwrap();
        let err = recorder.append(&frame).unwrap_err();
        assert!(matches!(err, StreamError::Persistence(_)));
        assert_eq!(recorder.frames(), 2);
        recorder.finish().unwrap();

        // 达到上限前的帧仍然完整可读
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len() as u64, limit);
        assert_eq!(read_u32(&bytes, 4) as usize, bytes.len() - 8);
        assert_eq!(read_u32(&bytes, 48), 2);
        let movi_size = read_u32(&bytes, 216) as usize;
        assert_eq!(&bytes[220 + movi_size..224 + movi_size], b"idx1");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_size_limit_capped_at_riff_maximum() {
        let path = temp_path("cap");
        let recorder = VideoRecorder::create(&path, 30, 8, 8)
            .unwrap()
            .with_size_limit(u64::MAX);
        assert_eq!(recorder.max_file_bytes, MAX_FILE_BYTES);
        drop(recorder);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_create_in_missing_location_fails() {
        let path = Path::new("/proc/gcs_stream_no_such_dir/out.avi");
        let err = VideoRecorder::create(path, 30, 32, 32).err().unwrap();
        assert!(matches!(err, StreamError::Persistence(_)));
    }
}
