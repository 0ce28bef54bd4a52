//! LLM 客户端核心模块
use crate::{
    config::Config,
    error::{NanoError, Result},
    session::StreamSession,
    types::{ApiErrorEnvelope, FinalMessage, MessagesRequest, StreamingBody},
    utils::user,
};
use log::{debug, error};
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE},
    Client, RequestBuilder, Response,
};
use std::io::Write;
use std::sync::Arc;

// ================================================================================================
// 核心客户端模块
// ================================================================================================

/// LLM 客户端
///
/// 向 Messages 接口发起流式请求，每次 [`LLMClient::open`] 返回一个独立的 [`StreamSession`]
#[derive(Debug, Clone)]
pub struct LLMClient {
    client: Arc<Client>,
    config: Arc<Config>,
}

impl LLMClient {
    /// 创建一个新的 `LLMClient` 实例
    pub fn new(config: Config) -> Self {
        let mut builder = Client::builder()
            .pool_idle_timeout(config.pool_idle_timeout)
            .tcp_keepalive(config.tcp_keepalive)
            .tcp_nodelay(config.tcp_nodelay);
        if let Some(connect_timeout) = config.connect_timeout {
            builder = builder.connect_timeout(connect_timeout);
        }
        let client = builder.build().unwrap_or_else(|e| {
            error!("Failed to build reqwest client: {}", e);
            Client::new()
        });

        Self {
            client: Arc::new(client),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 构建 API 请求所需的 HTTP 标头
    fn build_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.config.api_key)
                .map_err(|e| NanoError::Config(format!("Invalid API key: {}", e)))?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_str(&self.config.api_version)
                .map_err(|e| NanoError::Config(format!("Invalid API version: {}", e)))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        Ok(headers)
    }

    /// 发送请求并检查状态码，单次尝试，不重试
    async fn send(&self, request_builder: RequestBuilder) -> Result<Response> {
        let response = request_builder.send().await.map_err(NanoError::from_send)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let detail = match serde_json::from_str::<ApiErrorEnvelope>(&body) {
            Ok(envelope) => format!("{}: {}", envelope.error.kind, envelope.error.message),
            Err(_) if body.trim().is_empty() => "empty response body".to_string(),
            Err(_) => body,
        };
        Err(NanoError::Connection(format!(
            "Request failed with status {}: {}",
            status, detail
        )))
    }

    /// 打开一个流式会话
    ///
    /// 在产出任何片段之前，凭据错误、网络不可达或非 2xx 状态码都会返回 `Connection`。
    pub async fn open(&self, request: &MessagesRequest) -> Result<StreamSession> {
        request.validate()?;
        let endpoint = self.config.messages_endpoint();
        let headers = self.build_headers()?;
        let body = StreamingBody {
            request,
            stream: true,
        };

        debug!(
            "Opening stream: model={}, messages={}, endpoint={}",
            request.model,
            request.messages.len(),
            endpoint
        );
        let request_builder = self.client.post(&endpoint).headers(headers).json(&body);
        let response = self.send(request_builder).await?;

        Ok(StreamSession::from_bytes(response.bytes_stream())
            .with_idle_timeout(self.config.idle_timeout))
    }

    /// 为单条提示打开流式会话，模型、token 上限和系统指令取自配置
    pub async fn stream_prompt(&self, prompt: &str) -> Result<StreamSession> {
        let request = self.config.request(vec![user(prompt)]);
        self.open(&request).await
    }

    /// 打开会话，把片段实时写入 `sink`，返回最终消息
    ///
    /// 无论成功与否，会话都会在返回前关闭。
    pub async fn stream_to<W: Write>(
        &self,
        request: &MessagesRequest,
        sink: &mut W,
    ) -> Result<FinalMessage> {
        let mut session = self.open(request).await?;
        let result = session.pipe_to(sink).await;
        session.close();
        result
    }
}
