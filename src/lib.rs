//! # NanoStream - 轻量级流式消息客户端
//!
//! NanoStream 向托管的大语言模型 Messages 接口发起流式请求，
//! 按到达顺序逐个产出文本片段，并在流结束后给出组装完成的最终消息。
//!
//! ## 主要特性
//!
//! - 🔄 **流式片段**：`next_fragment` / `text_stream` 按到达顺序逐个产出文本。
//! - 🧩 **最终消息**：事件被累加为完整的 `FinalMessage`，与片段拼接结果一致。
//! - 🔒 **资源释放**：`StreamSession` 在任何退出路径上关闭连接，`close` 可重复调用。
//! - 🛡️ **错误处理**：连接失败、流中断、流不完整分别对应独立的错误类型，不做隐式重试。
//! - 🔧 **灵活配置**：支持环境变量和 Builder 模式，可选连接超时与空闲读取超时。
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use nanostream::{Config, LLMClient, Result, user};
//! use std::io::{self, Write};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // 从环境变量加载配置 (需要设置 ANTHROPIC_API_KEY)
//!     let config = Config::from_env()?;
//!     let client = LLMClient::new(config.clone());
//!
//!     let request = config.request(vec![user("Explain quantum computing in simple terms.")]);
//!     let mut session = client.open(&request).await?;
//!     while let Some(fragment) = session.next_fragment().await? {
//!         print!("{}", fragment);
//!         io::stdout().flush()?;
//!     }
//!
//!     let message = session.final_message().await?;
//!     println!("\n\nFull response:\n{:?}", message.content);
//!     Ok(())
//! }
//! ```

// 模块定义
pub mod accumulator;
pub mod client;
pub mod config;
pub mod error;
pub mod session;
pub mod stream;
pub mod types;
pub mod utils;

pub use client::LLMClient;
pub use config::Config;
pub use error::{NanoError, Result};
pub use session::{SessionState, StreamSession};
pub use types::{ContentBlock, FinalMessage, Message, MessagesRequest, Role, StreamEvent, StreamStats};
pub use utils::{assistant, message, user};
