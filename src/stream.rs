//! 流式响应处理模块
use crate::{
    error::{NanoError, Result},
    types::StreamEvent,
};
use async_stream::try_stream;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use log::debug;
use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

// ================================================================================================
// SSE 解码器
// ================================================================================================

const FRAME_DELIMITER: &[u8] = b"\n\n";

/// 一帧 SSE 数据
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` 字段
    pub event: Option<String>,
    /// 所有 `data:` 行，以换行拼接
    pub data: String,
}

impl SseFrame {
    /// 解析一帧文本
    ///
    /// 没有 `data` 行的帧（例如只有注释）返回 `None`
    pub fn parse(raw: &str) -> Option<Self> {
        let mut frame = SseFrame::default();
        let mut has_data = false;
        for line in raw.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => frame.event = Some(value.to_string()),
                "data" => {
                    if has_data {
                        frame.data.push('\n');
                    }
                    frame.data.push_str(value);
                    has_data = true;
                }
                _ => {}
            }
        }
        has_data.then_some(frame)
    }
}

/// 将单帧解码为事件，空帧返回 `None`
pub fn decode_event(frame: &SseFrame) -> Result<Option<StreamEvent>> {
    let data = frame.data.trim();
    if data.is_empty() {
        return Ok(None);
    }
    let event = serde_json::from_str::<StreamEvent>(data).map_err(|e| {
        NanoError::Json(format!("Failed to parse event: '{}', error: {}", data, e))
    })?;
    if event == StreamEvent::Unknown {
        debug!("Skipping unknown event {:?}", frame.event);
        return Ok(None);
    }
    Ok(Some(event))
}

/// 追加字节并把 `\r\n` 与单独的 `\r` 统一为 `\n`
///
/// `pending_cr` 记录上一块是否以 `\r` 结尾，跨块的 `\r\n` 只算一个换行。
fn push_normalized(buffer: &mut BytesMut, bytes: &[u8], pending_cr: &mut bool) {
    for &b in bytes {
        if std::mem::take(pending_cr) && b == b'\n' {
            continue;
        }
        if b == b'\r' {
            buffer.extend_from_slice(b"\n");
            *pending_cr = true;
        } else {
            buffer.extend_from_slice(&[b]);
        }
    }
}

/// 从 `from` 开始查找帧分隔符，返回分隔符起点
fn find_delimiter(buffer: &[u8], from: usize) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(FRAME_DELIMITER.len())
        .position(|w| w == FRAME_DELIMITER)
        .map(|pos| pos + from)
}

/// 一个无状态的流处理器，用于解析 SSE (Server-Sent Events) 数据流
#[derive(Debug, Clone, Default)]
pub struct SseDecoder;

impl SseDecoder {
    /// 创建一个新的 `SseDecoder` 实例
    pub fn new() -> Self {
        SseDecoder
    }

    /// 将字节流切分为 SSE 帧
    ///
    /// 传输层错误会变成 `StreamInterrupted`；流结束时残留的不完整帧会被丢弃。
    pub fn frames<S, E>(&self, bytes_stream: S) -> impl Stream<Item = Result<SseFrame>> + Send + use<S, E>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        try_stream! {
            let mut bytes_stream = Box::pin(bytes_stream);
            let mut buffer = BytesMut::new();
            let mut pending_cr = false;
            // 已确认不含分隔符的前缀长度
            let mut scanned = 0;
            while let Some(bytes_res) = bytes_stream.next().await {
                let bytes = bytes_res.map_err(|e| NanoError::StreamInterrupted(e.to_string()))?;
                push_normalized(&mut buffer, &bytes, &mut pending_cr);

                while let Some(pos) = find_delimiter(&buffer, scanned) {
                    let frame_bytes = buffer.split_to(pos + FRAME_DELIMITER.len());
                    scanned = 0;
                    let frame = SseFrame::parse(&String::from_utf8_lossy(&frame_bytes));
                    if let Some(frame) = frame {
                        yield frame;
                    }
                }
                scanned = buffer.len().saturating_sub(FRAME_DELIMITER.len() - 1);
            }

            if !buffer.is_empty() {
                debug!("Leftover buffer: {:?}", String::from_utf8_lossy(&buffer));
            }
        }
    }

    /// 将字节流转换为 `StreamEvent` 流
    pub fn events<S, E>(&self, bytes_stream: S) -> impl Stream<Item = Result<StreamEvent>> + Send + use<S, E>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let frames = self.frames(bytes_stream);
        try_stream! {
            let mut frames = Box::pin(frames);
            while let Some(frame) = frames.next().await {
                if let Some(event) = decode_event(&frame?)? {
                    yield event;
                }
            }
        }
    }
}

// ================================================================================================
// 事件流包装器
// ================================================================================================

/// `Stream<Item = Result<StreamEvent>>` 的简单包装
pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>,
}

impl EventStream {
    /// 创建一个新的 `EventStream`
    pub fn new(stream: impl Stream<Item = Result<StreamEvent>> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
        }
    }

    /// 直接从 SSE 字节流构建
    pub fn from_bytes<S, E>(bytes_stream: S) -> Self
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        Self::new(SseDecoder::new().events(bytes_stream))
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}

impl Stream for EventStream {
    type Item = Result<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
