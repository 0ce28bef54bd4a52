//! 流式会话模块
//!
//! `StreamSession` 独占一次请求的连接：按到达顺序产出文本片段，
//! 流结束后给出组装完成的 `FinalMessage`，在任何退出路径上释放连接。
use crate::{
    accumulator::MessageAccumulator,
    error::{NanoError, Result},
    stream::EventStream,
    types::{ContentDelta, FinalMessage, StreamEvent, StreamStats},
};
use async_stream::try_stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use log::{debug, warn};
use std::{
    fmt,
    io::Write,
    time::{Duration, Instant},
};

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 连接已建立，尚未收到事件
    Open,
    /// 正在接收事件
    Streaming,
    /// 已收到 `message_stop`，最终消息可用
    Finalized,
    /// 流异常终止
    Failed,
    /// 连接已释放
    Closed,
}

/// 一次流式请求的会话句柄
///
/// 单一所有者、单一消费者。`Drop` 时自动调用 [`StreamSession::close`]。
#[derive(Debug)]
pub struct StreamSession {
    events: Option<EventStream>,
    accumulator: MessageAccumulator,
    state: SessionState,
    final_message: Option<FinalMessage>,
    failure: Option<String>,
    idle_timeout: Option<Duration>,
    started: Instant,
    fragments: usize,
    first_fragment: Option<Duration>,
    model: String,
}

impl StreamSession {
    /// 基于已解码的事件流创建会话
    pub fn new(events: EventStream) -> Self {
        Self {
            events: Some(events),
            accumulator: MessageAccumulator::new(),
            state: SessionState::Open,
            final_message: None,
            failure: None,
            idle_timeout: None,
            started: Instant::now(),
            fragments: 0,
            first_fragment: None,
            model: String::new(),
        }
    }

    /// 基于原始 SSE 字节流创建会话
    pub fn from_bytes<S, E>(bytes_stream: S) -> Self
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        Self::new(EventStream::from_bytes(bytes_stream))
    }

    /// 设置两次数据到达之间允许的最长等待时间
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 当前统计信息
    pub fn stats(&self) -> StreamStats {
        StreamStats {
            fragments: self.fragments,
            first_fragment_ms: self.first_fragment.map(|d| d.as_millis() as u64),
            duration_ms: self.started.elapsed().as_millis() as u64,
            model: self.model.clone(),
            usage: self.final_message.as_ref().map(|m| m.usage),
        }
    }

    fn fail(&mut self, err: NanoError) -> NanoError {
        warn!("Stream terminated abnormally: {}", err);
        self.failure = Some(err.to_string());
        self.state = SessionState::Failed;
        self.events = None;
        err
    }

    /// 读取下一个原始事件
    ///
    /// 流正常结束或会话已终止时返回 `Ok(None)`。连接在 `message_stop`
    /// 之前断开时返回 `StreamInterrupted`，服务端 `error` 事件返回 `IncompleteStream`。
    pub async fn next_event(&mut self) -> Result<Option<StreamEvent>> {
        let Some(events) = self.events.as_mut() else {
            return Ok(None);
        };

        let polled = match self.idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, events.next()).await {
                Ok(polled) => polled,
                Err(_) => return Err(self.fail(NanoError::Timeout)),
            },
            None => events.next().await,
        };

        let event = match polled {
            Some(Ok(event)) => event,
            Some(Err(e)) => return Err(self.fail(e)),
            None => {
                return Err(self.fail(NanoError::StreamInterrupted(
                    "connection closed before message_stop".into(),
                )));
            }
        };

        if let Err(e) = self.accumulator.apply(&event) {
            return Err(self.fail(e));
        }
        if self.state == SessionState::Open {
            self.state = SessionState::Streaming;
        }
        if let StreamEvent::MessageStart { message } = &event {
            self.model = message.model.clone();
        }
        if self.accumulator.is_complete() {
            match self.accumulator.finish() {
                Ok(message) => {
                    debug!(
                        "Stream finalized after {} fragment(s), stop_reason={:?}",
                        self.fragments, message.stop_reason
                    );
                    self.final_message = Some(message);
                    self.state = SessionState::Finalized;
                    self.events = None;
                }
                Err(e) => return Err(self.fail(e)),
            }
        }
        Ok(Some(event))
    }

    /// 读取下一个文本片段，`Ok(None)` 表示流结束
    pub async fn next_fragment(&mut self) -> Result<Option<String>> {
        loop {
            match self.next_event().await? {
                None => return Ok(None),
                Some(StreamEvent::ContentBlockDelta {
                    delta: ContentDelta::TextDelta { text },
                    ..
                }) => {
                    self.fragments += 1;
                    if self.first_fragment.is_none() {
                        self.first_fragment = Some(self.started.elapsed());
                    }
                    return Ok(Some(text));
                }
                Some(_) => continue,
            }
        }
    }

    /// 以 `Stream` 形式产出文本片段
    ///
    /// 提前丢弃返回的流不会丢失会话状态，之后仍可调用 [`StreamSession::final_message`]。
    pub fn text_stream(&mut self) -> impl Stream<Item = Result<String>> + Send + '_ {
        try_stream! {
            while let Some(fragment) = self.next_fragment().await? {
                yield fragment;
            }
        }
    }

    /// 获取最终消息
    ///
    /// 若仍有未读取的片段，会先把它们读完再返回。读取过程中的错误原样返回，
    /// 只有连接中断会转换为 `IncompleteStream`。此前已失败或在完成前被关闭的会话
    /// 返回 `IncompleteStream`，携带最初的失败原因。
    pub async fn final_message(&mut self) -> Result<FinalMessage> {
        loop {
            match self.state {
                SessionState::Finalized | SessionState::Closed | SessionState::Failed => {
                    if let Some(message) = &self.final_message {
                        return Ok(message.clone());
                    }
                    let reason = self
                        .failure
                        .clone()
                        .unwrap_or_else(|| "session closed before completion".into());
                    return Err(NanoError::IncompleteStream(reason));
                }
                SessionState::Open | SessionState::Streaming => {
                    match self.next_event().await {
                        Ok(Some(_)) => {}
                        Ok(None) => {
                            return Err(self.fail(NanoError::IncompleteStream(
                                "event stream exhausted without a final message".into(),
                            )));
                        }
                        Err(NanoError::StreamInterrupted(reason)) => {
                            return Err(NanoError::IncompleteStream(reason));
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// 将每个片段立即写入 `sink` 并刷新，最后返回最终消息
    ///
    /// 出错时已写入的内容保持可见，错误随后返回。
    pub async fn pipe_to<W: Write>(&mut self, sink: &mut W) -> Result<FinalMessage> {
        while let Some(fragment) = self.next_fragment().await? {
            sink.write_all(fragment.as_bytes())?;
            sink.flush()?;
        }
        self.final_message().await
    }

    /// 释放连接，可重复调用
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if self.events.take().is_some() {
            debug!("Closing stream session before completion");
        }
        self.state = SessionState::Closed;
    }

    /// 连接是否仍被持有
    pub fn is_connected(&self) -> bool {
        self.events.is_some()
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::io;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};

    /// 被丢弃时置位的字节流，用来观察连接是否被释放
    struct DropFlag<S> {
        inner: S,
        dropped: Arc<AtomicBool>,
    }

    impl<S: Stream + Unpin> Stream for DropFlag<S> {
        type Item = S::Item;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Pin::new(&mut self.inner).poll_next(cx)
        }
    }

    impl<S> Drop for DropFlag<S> {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    fn tracked(pieces: &[&str]) -> (StreamSession, Arc<AtomicBool>) {
        let mut frames = opening();
        frames.extend(pieces.iter().map(|p| text(p)));
        frames.extend(closing());
        let chunks: Vec<std::result::Result<Bytes, io::Error>> =
            frames.into_iter().map(|f| Ok(Bytes::from(f))).collect();
        let dropped = Arc::new(AtomicBool::new(false));
        let transport = DropFlag {
            inner: stream::iter(chunks),
            dropped: dropped.clone(),
        };
        (StreamSession::from_bytes(transport), dropped)
    }

    fn frame(event: &str, data: &str) -> String {
        format!("event: {}\ndata: {}\n\n", event, data)
    }

    fn opening() -> Vec<String> {
        vec![
            frame(
                "message_start",
                r#"{"type":"message_start","message":{"id":"msg_1","type":"message","role":"assistant","model":"m1","content":[],"stop_reason":null,"stop_sequence":null,"usage":{"input_tokens":3,"output_tokens":1}}}"#,
            ),
            frame(
                "content_block_start",
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            ),
        ]
    }

    fn text(piece: &str) -> String {
        frame(
            "content_block_delta",
            &format!(
                r#"{{"type":"content_block_delta","index":0,"delta":{{"type":"text_delta","text":{}}}}}"#,
                serde_json::to_string(piece).unwrap()
            ),
        )
    }

    fn closing() -> Vec<String> {
        vec![
            frame("content_block_stop", r#"{"type":"content_block_stop","index":0}"#),
            frame(
                "message_delta",
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn","stop_sequence":null},"usage":{"output_tokens":2}}"#,
            ),
            frame("message_stop", r#"{"type":"message_stop"}"#),
        ]
    }

    fn session_from(frames: Vec<String>) -> StreamSession {
        let chunks: Vec<std::result::Result<Bytes, io::Error>> =
            frames.into_iter().map(|f| Ok(Bytes::from(f))).collect();
        StreamSession::from_bytes(stream::iter(chunks))
    }

    fn complete(pieces: &[&str]) -> StreamSession {
        let mut frames = opening();
        frames.extend(pieces.iter().map(|p| text(p)));
        frames.extend(closing());
        session_from(frames)
    }

    #[tokio::test]
    async fn test_fragments_then_final_message() {
        let mut session = complete(&["He", "llo"]);
        assert_eq!(session.state(), SessionState::Open);

        assert_eq!(session.next_fragment().await.unwrap().as_deref(), Some("He"));
        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(session.next_fragment().await.unwrap().as_deref(), Some("llo"));
        assert_eq!(session.next_fragment().await.unwrap(), None);
        assert_eq!(session.state(), SessionState::Finalized);
        assert!(!session.is_connected());

        let message = session.final_message().await.unwrap();
        assert_eq!(message.text(), "Hello");
        assert_eq!(message.stop_reason.as_deref(), Some("end_turn"));

        let stats = session.stats();
        assert_eq!(stats.fragments, 2);
        assert_eq!(stats.model, "m1");
        assert_eq!(stats.usage.map(|u| u.output_tokens), Some(2));
    }

    #[tokio::test]
    async fn test_concatenated_fragments_match_final_text() {
        let pieces = ["Quantum ", "computing ", "uses qubits", "", " 量子", "."];
        let mut session = complete(&pieces);
        let mut collected = String::new();
        while let Some(fragment) = session.next_fragment().await.unwrap() {
            collected.push_str(&fragment);
        }
        assert_eq!(collected, session.final_message().await.unwrap().text());
        assert_eq!(collected, pieces.concat());
    }

    #[tokio::test]
    async fn test_final_message_auto_drains() {
        let mut session = complete(&["a", "b", "c"]);
        assert_eq!(session.next_fragment().await.unwrap().as_deref(), Some("a"));
        let message = session.final_message().await.unwrap();
        assert_eq!(message.text(), "abc");
        assert_eq!(session.next_fragment().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_text_stream_and_early_break() {
        let mut session = complete(&["one", "two", "three"]);
        {
            let stream = session.text_stream();
            futures::pin_mut!(stream);
            assert_eq!(stream.next().await.unwrap().unwrap(), "one");
        }
        assert!(session.is_connected());
        session.close();
        assert!(!session.is_connected());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.final_message().await,
            Err(NanoError::IncompleteStream(_))
        ));
    }

    #[tokio::test]
    async fn test_eof_without_message_stop() {
        let mut frames = opening();
        frames.push(text("He"));
        let mut session = session_from(frames);

        assert_eq!(session.next_fragment().await.unwrap().as_deref(), Some("He"));
        let err = session.next_fragment().await.unwrap_err();
        assert!(matches!(err, NanoError::StreamInterrupted(_)));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(matches!(
            session.final_message().await,
            Err(NanoError::IncompleteStream(_))
        ));
        assert_eq!(session.next_fragment().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_final_message_after_truncation_without_draining() {
        let mut frames = opening();
        frames.push(text("He"));
        let mut session = session_from(frames);
        assert!(matches!(
            session.final_message().await,
            Err(NanoError::IncompleteStream(_))
        ));
    }

    #[tokio::test]
    async fn test_transport_error_mid_stream() {
        let mut chunks: Vec<std::result::Result<Bytes, io::Error>> =
            opening().into_iter().map(|f| Ok(Bytes::from(f))).collect();
        chunks.push(Ok(Bytes::from(text("He"))));
        chunks.push(Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset")));
        let mut session = StreamSession::from_bytes(stream::iter(chunks));

        assert_eq!(session.next_fragment().await.unwrap().as_deref(), Some("He"));
        assert!(matches!(
            session.next_fragment().await,
            Err(NanoError::StreamInterrupted(_))
        ));
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_server_error_event() {
        let mut frames = opening();
        frames.push(text("He"));
        frames.push(frame(
            "error",
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        ));
        let mut session = session_from(frames);

        assert_eq!(session.next_fragment().await.unwrap().as_deref(), Some("He"));
        assert!(matches!(
            session.next_fragment().await,
            Err(NanoError::IncompleteStream(msg)) if msg.contains("Overloaded")
        ));
        assert!(matches!(
            session.final_message().await,
            Err(NanoError::IncompleteStream(msg)) if msg.contains("Overloaded")
        ));
    }

    #[tokio::test]
    async fn test_pipe_to_writes_every_fragment() {
        let mut session = complete(&["He", "llo", ", world"]);
        let mut sink = Vec::new();
        let message = session.pipe_to(&mut sink).await.unwrap();
        assert_eq!(String::from_utf8(sink).unwrap(), "Hello, world");
        assert_eq!(message.text(), "Hello, world");
    }

    #[tokio::test]
    async fn test_pipe_to_keeps_partial_output_on_failure() {
        let mut frames = opening();
        frames.push(text("partial"));
        let mut session = session_from(frames);
        let mut sink = Vec::new();
        let result = session.pipe_to(&mut sink).await;
        assert!(matches!(result, Err(NanoError::StreamInterrupted(_))));
        assert_eq!(sink, b"partial");
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let opened: Vec<std::result::Result<Bytes, io::Error>> =
            opening().into_iter().map(|f| Ok(Bytes::from(f))).collect();
        let hanging = stream::iter(opened).chain(stream::pending());
        let mut session =
            StreamSession::from_bytes(hanging).with_idle_timeout(Some(Duration::from_millis(50)));

        assert!(matches!(session.next_fragment().await, Err(NanoError::Timeout)));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_final_message_reports_idle_timeout() {
        let opened: Vec<std::result::Result<Bytes, io::Error>> =
            opening().into_iter().map(|f| Ok(Bytes::from(f))).collect();
        let hanging = stream::iter(opened).chain(stream::pending());
        let mut session =
            StreamSession::from_bytes(hanging).with_idle_timeout(Some(Duration::from_millis(50)));

        assert!(matches!(session.final_message().await, Err(NanoError::Timeout)));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_failure_reason_survives_close() {
        let mut frames = opening();
        frames.push(frame(
            "error",
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        ));
        let mut session = session_from(frames);
        assert!(session.next_fragment().await.is_err());
        session.close();

        assert!(matches!(
            session.final_message().await,
            Err(NanoError::IncompleteStream(msg)) if msg.contains("Overloaded")
        ));
    }

    #[tokio::test]
    async fn test_drop_mid_stream_releases_transport() {
        let (mut session, dropped) = tracked(&["He", "llo"]);
        assert_eq!(session.next_fragment().await.unwrap().as_deref(), Some("He"));
        assert!(!dropped.load(Ordering::SeqCst));

        drop(session);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_break_from_text_stream_then_drop_releases_transport() {
        let (mut session, dropped) = tracked(&["one", "two", "three"]);
        {
            let stream = session.text_stream();
            futures::pin_mut!(stream);
            while let Some(fragment) = stream.next().await {
                if fragment.unwrap() == "one" {
                    break;
                }
            }
        }
        assert!(session.is_connected());
        assert!(!dropped.load(Ordering::SeqCst));

        drop(session);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_after_finalize() {
        let mut session = complete(&["ok"]);
        let message = session.final_message().await.unwrap();
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.final_message().await.unwrap(), message);
    }
}
