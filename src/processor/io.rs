//! 上游行读取与客户端写入
//!
//! `LineSource` 从上游逐行读取，`SseSink` 向客户端写入 SSE 帧。

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use std::io;
use std::pin::Pin;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;

/// 单行最大字节数
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// 上游行读取
///
/// 实现必须是取消安全的：`next_line` 的 future 被丢弃时不得丢失已读取的数据
#[async_trait]
pub trait LineSource: Send {
    /// 读取下一行；`Ok(None)` 表示上游正常结束
    async fn next_line(&mut self) -> io::Result<Option<String>>;
}

/// 客户端 SSE 写入
#[async_trait]
pub trait SseSink: Send {
    /// 写入一个完整的 SSE 帧
    async fn send_frame(&mut self, frame: &str) -> io::Result<()>;

    /// 刷新已写入的帧
    async fn flush(&mut self) -> io::Result<()>;
}

type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// 基于字节流的行读取（`\n` 或 `\r\n` 分隔）
///
/// 一行无效（超长或非 UTF-8）只跳过该行，之后的行照常读取
pub struct ByteStreamLineSource {
    lines: FramedRead<StreamReader<ByteStream, Bytes>, LinesCodec>,
    /// 上一次读取返回了错误
    errored: bool,
}

impl ByteStreamLineSource {
    pub fn new<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let stream: ByteStream = Box::pin(stream.map_err(|e| io::Error::new(io::ErrorKind::Other, e)));
        Self {
            lines: FramedRead::new(
                StreamReader::new(stream),
                LinesCodec::new_with_max_length(MAX_LINE_BYTES),
            ),
            errored: false,
        }
    }

    /// 从 reqwest 响应体创建
    pub fn from_response(response: reqwest::Response) -> Self {
        Self::new(response.bytes_stream())
    }
}

#[async_trait]
impl LineSource for ByteStreamLineSource {
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        let mut next = self.lines.next().await;
        // FramedRead 在错误之后先返回一次 None，再继续读取
        if next.is_none() && std::mem::take(&mut self.errored) {
            next = self.lines.next().await;
        }
        let result = match next {
            None => Ok(None),
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("单行超过 {} 字节", MAX_LINE_BYTES),
            )),
            Some(Err(LinesCodecError::Io(e))) => Err(e),
        };
        self.errored = result.is_err();
        result
    }
}

/// 基于 channel 的行读取
pub struct ChannelLineSource {
    rx: mpsc::Receiver<io::Result<String>>,
}

impl ChannelLineSource {
    pub fn new(rx: mpsc::Receiver<io::Result<String>>) -> Self {
        Self { rx }
    }

    /// 创建一对发送端与读取端
    pub fn channel(buffer: usize) -> (mpsc::Sender<io::Result<String>>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl LineSource for ChannelLineSource {
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        self.rx.recv().await.transpose()
    }
}

/// 写入 mpsc channel 的 sink，接收端作为 HTTP 响应体
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl SseSink for ChannelSink {
    async fn send_frame(&mut self, frame: &str) -> io::Result<()> {
        self.tx
            .send(Bytes::copy_from_slice(frame.as_bytes()))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "客户端连接已关闭"))
    }

    async fn flush(&mut self) -> io::Result<()> {
        if self.tx.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "客户端连接已关闭"));
        }
        Ok(())
    }
}

/// 写入任意 `AsyncWrite` 的 sink
pub struct WriterSink<W> {
    writer: W,
}

impl<W> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> SseSink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send_frame(&mut self, frame: &str) -> io::Result<()> {
        self.writer.write_all(frame.as_bytes()).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.writer.flush().await
    }
}
