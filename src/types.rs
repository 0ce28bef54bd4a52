//! API 数据结构模块

use crate::error::{NanoError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ================================================================================================
// API 请求结构
// ================================================================================================

/// 对话消息
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// 角色
    pub role: Role,
    /// 内容
    pub content: String,
}

/// 角色枚举
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// 用户
    #[default]
    User,
    /// 机器人
    Assistant,
}

/// Messages 接口的请求体
///
/// 提交后不可变：`LLMClient::open` 只借用它。`stream` 字段由客户端在发送时注入。
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct MessagesRequest {
    /// 模型名称
    pub model: String,
    /// 最大生成 token 数
    pub max_tokens: u32,
    /// 系统指令
    #[serde(skip_serializing_if = "String::is_empty")]
    pub system: String,
    /// 按对话顺序排列的消息
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

impl MessagesRequest {
    pub fn new(model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            model: model.into(),
            max_tokens,
            system: String::new(),
            messages: Vec::new(),
            temperature: None,
            top_p: None,
            stop_sequences: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_messages(mut self, messages: impl IntoIterator<Item = Message>) -> Self {
        self.messages.extend(messages);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_stop_sequences(mut self, stop_sequences: Vec<String>) -> Self {
        self.stop_sequences = Some(stop_sequences);
        self
    }

    /// 在发出任何网络请求前检查请求是否可提交
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(NanoError::InvalidRequest("model must not be empty".into()));
        }
        if self.max_tokens == 0 {
            return Err(NanoError::InvalidRequest("max_tokens must be positive".into()));
        }
        if self.messages.is_empty() {
            return Err(NanoError::InvalidRequest("messages must not be empty".into()));
        }
        Ok(())
    }
}

/// 实际发送的请求体：请求本身加上 `stream: true`
#[derive(Debug, Serialize)]
pub(crate) struct StreamingBody<'a> {
    #[serde(flatten)]
    pub request: &'a MessagesRequest,
    pub stream: bool,
}

// ================================================================================================
// API 响应结构
// ================================================================================================

/// 完整组装后的响应消息
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct FinalMessage {
    /// 响应 ID
    #[serde(default)]
    pub id: String,
    /// 对象类型，通常为 `message`
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default = "assistant_role")]
    pub role: Role,
    /// 使用模型
    #[serde(default)]
    pub model: String,
    /// 内容块
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    /// 结束原因
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
    /// token 使用情况
    #[serde(default)]
    pub usage: Usage,
}

fn assistant_role() -> Role {
    Role::Assistant
}

impl FinalMessage {
    /// 按顺序拼接所有文本块
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// 内容块
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
        #[serde(default)]
        signature: String,
    },
    RedactedThinking {
        #[serde(default)]
        data: String,
    },
    /// 本库不认识的块类型
    #[serde(other)]
    Unknown,
}

/// token 使用情况
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    /// 输入 token 数量
    #[serde(default)]
    pub input_tokens: u32,
    /// 输出 token 数量
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u32>,
}

/// 服务端错误体，出现在非 2xx 响应和 `error` 事件中
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
pub struct ApiErrorBody {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorEnvelope {
    pub error: ApiErrorBody,
}

// ================================================================================================
// 流式 API 响应结构
// ================================================================================================

/// SSE 流中的单个事件
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: FinalMessage,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: ContentDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<DeltaUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: ApiErrorBody,
    },
    #[serde(other)]
    Unknown,
}

/// 内容块增量
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    #[serde(other)]
    Unknown,
}

/// `message_delta` 携带的顶层字段
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct MessageDeltaBody {
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
}

/// `message_delta` 中的累计用量，输出 token 为累计值
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaUsage {
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default)]
    pub input_tokens: Option<u32>,
    #[serde(default)]
    pub cache_creation_input_tokens: Option<u32>,
    #[serde(default)]
    pub cache_read_input_tokens: Option<u32>,
}

// ================================================================================================
// 应用内部数据模型
// ================================================================================================

/// 会话统计信息
///
/// 记录一次流式会话的片段数量、首片段延迟和最终用量
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    /// 已产出的文本片段数
    pub fragments: usize,
    /// 首个片段到达耗时（毫秒）
    pub first_fragment_ms: Option<u64>,
    /// 会话打开至今的耗时（毫秒）
    pub duration_ms: u64,
    /// 使用的模型名称
    pub model: String,
    /// 最终 token 用量，仅在消息完成后可用
    pub usage: Option<Usage>,
}
