//! 工具函数模块
use crate::types::{Message, Role};

/// 创建消息的便捷函数
///
/// # 参数
///
/// * `role` - 消息角色
/// * `content` - 消息内容
///
/// # 返回
///
/// 新创建的消息实例
pub fn message(role: Role, content: &str) -> Message {
    Message {
        role,
        content: content.to_string(),
    }
}

/// 创建用户消息
pub fn user(content: &str) -> Message {
    message(Role::User, content)
}

/// 创建助手消息，用于携带对话历史
pub fn assistant(content: &str) -> Message {
    message(Role::Assistant, content)
}
