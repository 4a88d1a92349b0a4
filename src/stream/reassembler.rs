// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 分段重组器
/// Reassembles length-prefixed segments from a fragmented byte stream
use crate::error::{Result, StreamError, TransportError};
use std::io::{ErrorKind, Read};

/// 长度前缀: 8字节无符号大端整数
pub const LENGTH_PREFIX_SIZE: usize = 8;
/// 单次 read 的最大字节数
pub const DEFAULT_CHUNK_SIZE: usize = 4096;
/// 单个分段最大长度 (64 MiB)
pub const DEFAULT_MAX_SEGMENT_LEN: u64 = 64 * 1024 * 1024;

/// 分段重组器
///
/// 内部缓冲区保存已经收到但尚未消费的字节, 多余的字节留给下一个分段
pub struct FrameReassembler {
    buffer: Vec<u8>,
    scratch: Vec<u8>,
    max_segment_len: u64,
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_MAX_SEGMENT_LEN)
    }
}

impl FrameReassembler {
    pub fn new(chunk_size: usize, max_segment_len: u64) -> Self {
        Self {
            buffer: Vec::new(),
            scratch: vec![0; chunk_size.max(1)],
            max_segment_len,
        }
    }

    /// 已缓冲但未消费的字节数
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// 缓冲区为空, 即没有半个分段残留
    pub fn is_at_boundary(&self) -> bool {
        self.buffer.is_empty()
    }

    /// 读取一个完整分段: 先读8字节长度, 再读对应长度的数据
    pub fn pull_segment<R: Read>(&mut self, reader: &mut R) -> Result<Vec<u8>> {
        let prefix = self.pull_exact(reader, LENGTH_PREFIX_SIZE)?;
        let mut raw = [0u8; LENGTH_PREFIX_SIZE];
        raw.copy_from_slice(&prefix);
        let length = u64::from_be_bytes(raw);

        if length > self.max_segment_len {
            return Err(StreamError::Protocol(format!(
                "segment length {} exceeds limit {}",
                length, self.max_segment_len
            )));
        }

        self.pull_exact(reader, length as usize)
    }

    /// 精确取出 n 个字节, 不足时继续从 reader 读取
    pub fn pull_exact<R: Read>(&mut self, reader: &mut R, n: usize) -> Result<Vec<u8>> {
        self.fill_to(reader, n)?;
        let rest = self.buffer.split_off(n);
        Ok(std::mem::replace(&mut self.buffer, rest))
    }

    fn fill_to<R: Read>(&mut self, reader: &mut R, needed: usize) -> Result<()> {
        while self.buffer.len() < needed {
            let n = match reader.read(&mut self.scratch) {
                Ok(0) => return Err(TransportError::Closed.into()),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.buffer.extend_from_slice(&self.scratch[..n]);
        }
        Ok(())
    }
}
