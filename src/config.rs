//! 配置模块
use crate::error::{NanoError, Result};
use crate::types::{Message, MessagesRequest};
use std::env;
use std::time::Duration;

// ===============================================================================================
// 配置模块
// ===============================================================================================

/// 默认 API 基础 URL
pub const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
/// 默认协议版本，随 `anthropic-version` 标头发送
pub const DEFAULT_API_VERSION: &str = "2023-06-01";

/// LLM 客户端配置
///
/// 包含所有必要的配置参数，支持 Builder 模式和环境变量配置。
/// 凭据只在这里出现，核心逻辑从不读取环境变量。
#[derive(Debug, Clone)]
pub struct Config {
    /// 模型名称
    pub(crate) model: String,
    /// 系统指令
    pub(crate) system_message: String,
    /// 最大生成 token 数
    pub(crate) max_tokens: u32,
    /// API 基础 URL
    pub(crate) api_base: String,
    /// API 密钥
    pub(crate) api_key: String,
    /// `anthropic-version` 标头
    pub(crate) api_version: String,
    /// 建立连接的超时时间，默认不限制
    pub(crate) connect_timeout: Option<Duration>,
    /// 两次数据到达之间的最长等待，默认不限制
    pub(crate) idle_timeout: Option<Duration>,
    /// 连接池空闲超时时间
    pub(crate) pool_idle_timeout: Duration,
    /// TCP Keepalive
    pub(crate) tcp_keepalive: Duration,
    /// TCP Nodelay
    pub(crate) tcp_nodelay: bool,
}

impl Default for Config {
    /// 创建默认配置
    fn default() -> Self {
        Self {
            model: "claude-3-7-sonnet-20250219".into(),
            system_message: "You are a helpful AI assistant that provides concise responses.".into(),
            max_tokens: 1024,
            api_base: DEFAULT_API_BASE.into(),
            api_key: String::new(),
            api_version: DEFAULT_API_VERSION.into(),
            connect_timeout: None,
            idle_timeout: None,
            pool_idle_timeout: Duration::from_secs(90),
            tcp_keepalive: Duration::from_secs(60),
            tcp_nodelay: true,
        }
    }
}

/// 生成 Config Builder 方法的宏
///
/// 自动生成 `with_field_name` 形式的 builder 方法
macro_rules! config_builder {
    ($field:ident, $type:ty) => {
        paste::paste! {
            #[doc = "设置 `"]
            #[doc = stringify!($field)]
            #[doc = "`"]
            pub fn [<with_ $field>](mut self, $field: $type) -> Self {
                self.$field = $field;
                self
            }
        }
    };
    ($field:ident, $type:ty, option) => {
        paste::paste! {
            #[doc = "设置 `"]
            #[doc = stringify!($field)]
            #[doc = "`"]
            pub fn [<with_ $field>](mut self, $field: $type) -> Self {
                self.$field = Some($field);
                self
            }
        }
    };
}

impl Config {
    pub fn model(&self) -> &str { &self.model }
    pub fn system_message(&self) -> &str { &self.system_message }
    pub fn max_tokens(&self) -> u32 { self.max_tokens }
    pub fn api_base(&self) -> &str { &self.api_base }
    pub fn api_key(&self) -> &str { &self.api_key }
    pub fn api_version(&self) -> &str { &self.api_version }
    pub fn connect_timeout(&self) -> Option<Duration> { self.connect_timeout }
    pub fn idle_timeout(&self) -> Option<Duration> { self.idle_timeout }

    /// 从环境变量和 `.env` 文件加载配置
    ///
    /// 环境变量会覆盖 `.env` 文件中的设置
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// 从任意键值来源加载配置
    ///
    /// 读取 `ANTHROPIC_API_KEY`（必需）、`ANTHROPIC_API_BASE` 与 `ANTHROPIC_MODEL`（可选）
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("ANTHROPIC_API_KEY")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| NanoError::Config("ANTHROPIC_API_KEY not found".into()))?;

        let defaults = Config::default();
        let api_base = lookup("ANTHROPIC_API_BASE")
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.api_base.clone());
        let model = lookup("ANTHROPIC_MODEL")
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.model.clone());

        Ok(Config {
            api_key,
            api_base,
            model,
            ..defaults
        })
    }

    // 使用宏生成 builder 方法
    config_builder!(api_base, String);
    config_builder!(model, String);
    config_builder!(api_key, String);
    config_builder!(api_version, String);
    config_builder!(system_message, String);
    config_builder!(max_tokens, u32);
    config_builder!(connect_timeout, Duration, option);
    config_builder!(idle_timeout, Duration, option);
    config_builder!(pool_idle_timeout, Duration);
    config_builder!(tcp_keepalive, Duration);
    config_builder!(tcp_nodelay, bool);

    /// Messages 接口的完整地址
    pub fn messages_endpoint(&self) -> String {
        format!("{}/v1/messages", self.api_base.trim_end_matches('/'))
    }

    /// 使用配置中的模型、token 上限和系统指令构建请求
    pub fn request(&self, messages: Vec<Message>) -> MessagesRequest {
        MessagesRequest::new(self.model.clone(), self.max_tokens)
            .with_system(self.system_message.clone())
            .with_messages(messages)
    }
}
