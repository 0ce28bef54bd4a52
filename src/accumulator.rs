//! 最终消息累加模块
//!
//! 将流事件逐个折叠进消息快照，收到 `message_stop` 后得到完整的 `FinalMessage`。
use crate::{
    error::{NanoError, Result},
    types::{ContentBlock, ContentDelta, FinalMessage, StreamEvent},
};
use log::debug;
use serde_json::Value;
use std::collections::HashMap;

/// 消息快照累加器
#[derive(Debug, Default)]
pub struct MessageAccumulator {
    snapshot: Option<FinalMessage>,
    // tool_use 块的 input 以 JSON 片段到达，块结束时再整体解析
    partial_json: HashMap<usize, String>,
    completed: bool,
}

fn require<'a>(snapshot: &'a mut Option<FinalMessage>, event: &str) -> Result<&'a mut FinalMessage> {
    snapshot
        .as_mut()
        .ok_or_else(|| NanoError::StreamError(format!("{} received before message_start", event)))
}

impl MessageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前快照，`message_start` 之前为 `None`
    pub fn snapshot(&self) -> Option<&FinalMessage> {
        self.snapshot.as_ref()
    }

    /// 是否已收到 `message_stop`
    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// 应用一个事件
    pub fn apply(&mut self, event: &StreamEvent) -> Result<()> {
        if self.completed && !matches!(event, StreamEvent::Ping | StreamEvent::Unknown) {
            return Err(NanoError::StreamError("event received after message_stop".into()));
        }
        match event {
            StreamEvent::MessageStart { message } => {
                if self.snapshot.is_some() {
                    return Err(NanoError::StreamError("duplicate message_start".into()));
                }
                self.snapshot = Some(message.clone());
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let snapshot = require(&mut self.snapshot, "content_block_start")?;
                if *index != snapshot.content.len() {
                    return Err(NanoError::StreamError(format!(
                        "content_block_start index {} out of order, expected {}",
                        index,
                        snapshot.content.len()
                    )));
                }
                snapshot.content.push(content_block.clone());
            }
            StreamEvent::ContentBlockDelta { index, delta } => self.apply_delta(*index, delta)?,
            StreamEvent::ContentBlockStop { index } => self.finish_block(*index)?,
            StreamEvent::MessageDelta { delta, usage } => {
                let snapshot = require(&mut self.snapshot, "message_delta")?;
                snapshot.stop_reason = delta.stop_reason.clone();
                snapshot.stop_sequence = delta.stop_sequence.clone();
                if let Some(usage) = usage {
                    snapshot.usage.output_tokens = usage.output_tokens;
                    if let Some(input) = usage.input_tokens {
                        snapshot.usage.input_tokens = input;
                    }
                    if usage.cache_creation_input_tokens.is_some() {
                        snapshot.usage.cache_creation_input_tokens = usage.cache_creation_input_tokens;
                    }
                    if usage.cache_read_input_tokens.is_some() {
                        snapshot.usage.cache_read_input_tokens = usage.cache_read_input_tokens;
                    }
                }
            }
            StreamEvent::MessageStop => {
                require(&mut self.snapshot, "message_stop")?;
                if !self.partial_json.is_empty() {
                    debug!("message_stop with {} unterminated tool input(s)", self.partial_json.len());
                }
                self.completed = true;
            }
            StreamEvent::Error { error } => {
                return Err(NanoError::IncompleteStream(format!(
                    "{}: {}",
                    error.kind, error.message
                )));
            }
            StreamEvent::Ping | StreamEvent::Unknown => {}
        }
        Ok(())
    }

    fn apply_delta(&mut self, index: usize, delta: &ContentDelta) -> Result<()> {
        let snapshot = require(&mut self.snapshot, "content_block_delta")?;
        let block = snapshot.content.get_mut(index).ok_or_else(|| {
            NanoError::StreamError(format!("delta for unknown content block {}", index))
        })?;

        match (block, delta) {
            (ContentBlock::Text { text }, ContentDelta::TextDelta { text: piece }) => {
                text.push_str(piece);
            }
            (ContentBlock::ToolUse { .. }, ContentDelta::InputJsonDelta { partial_json }) => {
                self.partial_json
                    .entry(index)
                    .or_default()
                    .push_str(partial_json);
            }
            (ContentBlock::Thinking { thinking, .. }, ContentDelta::ThinkingDelta { thinking: piece }) => {
                thinking.push_str(piece);
            }
            (ContentBlock::Thinking { signature, .. }, ContentDelta::SignatureDelta { signature: value }) => {
                *signature = value.clone();
            }
            (_, ContentDelta::Unknown) => {
                debug!("Ignoring unknown delta for content block {}", index);
            }
            (ContentBlock::Unknown, _) => {
                debug!("Ignoring delta for unrecognised content block {}", index);
            }
            _ => {
                return Err(NanoError::StreamError(format!(
                    "delta does not match the kind of content block {}",
                    index
                )));
            }
        }
        Ok(())
    }

    fn finish_block(&mut self, index: usize) -> Result<()> {
        let snapshot = require(&mut self.snapshot, "content_block_stop")?;
        let block = snapshot.content.get_mut(index).ok_or_else(|| {
            NanoError::StreamError(format!("stop for unknown content block {}", index))
        })?;

        if let Some(json) = self.partial_json.remove(&index) {
            if let ContentBlock::ToolUse { input, .. } = block {
                *input = if json.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&json).map_err(|e| {
                        NanoError::Json(format!("Invalid tool input for block {}: {}", index, e))
                    })?
                };
            }
        }
        Ok(())
    }

    /// 取出完整消息
    ///
    /// 未收到 `message_stop` 时返回 `IncompleteStream`
    pub fn finish(&mut self) -> Result<FinalMessage> {
        if !self.completed {
            return Err(NanoError::IncompleteStream("message_stop not received".into()));
        }
        self.snapshot
            .take()
            .ok_or_else(|| NanoError::IncompleteStream("final message already taken".into()))
    }
}
