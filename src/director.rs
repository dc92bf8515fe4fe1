use serde::Serialize;

use crate::inference::InferenceClient;
use crate::models::{ChatMessage, ResultSource, Role};

const GREETING: &str = "Hello! I'm your AI Director. Tell me about the video you want to create. What's the main subject?";

/// 导演对话：通过一问一答帮助用户写出完整的视频提示词。
/// 历史只追加不截断，每轮都完整发送给模型。
#[derive(Debug, Clone, Serialize)]
pub struct Director {
    messages: Vec<ChatMessage>,
}

impl Default for Director {
    fn default() -> Self {
        Self::new()
    }
}

impl Director {
    pub fn new() -> Self {
        Self {
            messages: vec![ChatMessage::assistant(GREETING)],
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// 发送一条用户消息并追加模型回复；空白输入直接忽略
    pub async fn send(&mut self, client: &InferenceClient, text: &str) -> Option<(String, ResultSource)> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        self.messages.push(ChatMessage::user(text));
        let reply = client.chat_turn(&self.messages).await;
        self.messages.push(ChatMessage::assistant(reply.content.clone()));
        Some((reply.content, reply.source))
    }

    /// 最近一条导演回复，作为"使用此提示词"的候选
    pub fn latest_reply(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InferenceConfig;
    use std::time::Duration;

    async fn offline_client() -> InferenceClient {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        InferenceClient::new(InferenceConfig {
            base_url: format!("http://{}", addr),
            chat_mock_delay: Duration::ZERO,
            ..InferenceConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_starts_with_greeting() {
        let director = Director::new();
        assert_eq!(director.messages().len(), 1);
        assert_eq!(director.latest_reply(), Some(GREETING));
    }

    #[tokio::test]
    async fn test_conversation_appends_turns() {
        let client = offline_client().await;
        let mut director = Director::new();

        assert!(director.send(&client, "   ").await.is_none());
        assert_eq!(director.messages().len(), 1);

        let (reply, source) = director.send(&client, "A neon city at night").await.unwrap();
        assert_eq!(source, ResultSource::Mock);
        assert!(reply.contains("lighting"));

        let (final_prompt, _) = director.send(&client, "done").await.unwrap();
        assert!(final_prompt.starts_with("Cinematic wide shot"));
        assert_eq!(director.messages().len(), 5);
        assert_eq!(director.messages()[3].role, Role::User);
        assert_eq!(director.latest_reply(), Some(final_prompt.as_str()));
    }
}
