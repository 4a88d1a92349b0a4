// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// TCP传输层
/// TCP transport to a single producer endpoint
use super::envelope::encode_segment;
use crate::error::{Result, StreamError, TransportError};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// 与机载端的TCP连接
pub struct TcpTransport {
    stream: TcpStream,
    endpoint: String,
}

impl TcpTransport {
    /// 建立连接并设置读超时
    ///
    /// 地址解析出多个结果时逐个尝试, 返回最后一个错误
    pub fn connect(
        endpoint: &str,
        connect_timeout: Duration,
        read_timeout: Option<Duration>,
    ) -> Result<Self> {
        let connect_err = |source: io::Error| {
            StreamError::Transport(TransportError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })
        };

        let addrs = endpoint.to_socket_addrs().map_err(connect_err)?;
        let mut last_err =
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved");

        for addr in addrs {
            match TcpStream::connect_timeout(&addr, connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(read_timeout)?;
                    stream.set_nodelay(true)?;
                    return Ok(Self {
                        stream,
                        endpoint: endpoint.to_string(),
                    });
                }
                Err(e) => last_err = e,
            }
        }

        Err(connect_err(last_err))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// 获取一个可以跨线程关闭连接的句柄
    pub fn closer(&self) -> Result<TransportCloser> {
        Ok(TransportCloser {
            stream: self.stream.try_clone()?,
        })
    }

    /// 发送一条长度前缀的文本消息
    pub fn send_message(&mut self, text: &str) -> Result<()> {
        let segment = encode_segment(text.as_bytes());
        self.stream.write_all(&segment)?;
        self.stream.flush()?;
        Ok(())
    }

    /// 关闭连接, 未连接错误忽略
    pub fn close(&self) {
        shutdown_quietly(&self.stream, Shutdown::Both);
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

/// 跨线程关闭句柄: 强制让阻塞中的 read 立即返回
///
/// 只关闭读方向, 工作线程仍可发送断开消息
pub struct TransportCloser {
    stream: TcpStream,
}

impl TransportCloser {
    pub fn close(&self) {
        shutdown_quietly(&self.stream, Shutdown::Read);
    }
}

fn shutdown_quietly(stream: &TcpStream, how: Shutdown) {
    if let Err(e) = stream.shutdown(how) {
        if e.kind() != io::ErrorKind::NotConnected {
            log::debug!("socket shutdown: {}", e);
        }
    }
}
