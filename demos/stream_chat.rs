//! # 流式对话示例
//!
//! 这个示例展示了如何使用 NanoStream 的流式会话：
//! - 从环境变量加载配置 (ANTHROPIC_API_KEY / ANTHROPIC_API_BASE)
//! - 打开流式会话
//! - 实时输出文本片段
//! - 输出完整的最终消息

use nanostream::{Config, LLMClient, Result, user};
use std::io::{self, Write};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    env_logger::init();

    let config = Config::from_env()?
        .with_max_tokens(1024)
        .with_system_message("You are a helpful AI assistant that provides concise responses.".to_string());
    let client = LLMClient::new(config.clone());

    let request = config.request(vec![user("Explain quantum computing in simple terms.")]);
    let mut session = client.open(&request).await?;

    // 实时处理流
    let mut stdout = io::stdout();
    while let Some(fragment) = session.next_fragment().await? {
        print!("{}", fragment);
        stdout.flush()?;
    }

    let message = session.final_message().await?;
    println!("\n\nFull response:");
    println!("{:?}", message.content);

    let stats = session.stats();
    log::info!(
        "fragments={}, first_fragment_ms={:?}, duration_ms={}",
        stats.fragments,
        stats.first_fragment_ms,
        stats.duration_ms
    );

    Ok(())
}
