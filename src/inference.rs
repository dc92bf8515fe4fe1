use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::InferenceConfig;
use crate::models::{AnalysisResult, BoundingBox, ChatMessage, Defect, DefectCategory, Metrics, ResultSource, Role};

const ANALYST_SYSTEM_PROMPT: &str = r#"
You are an expert AI Video Analyst and Hallucination Detector.

**Goal**: Analyze the provided video frame against the User's Prompt to detect hallucinations (errors, artifacts, inconsistencies).

**Inputs**:
1. **User Prompt**: The Source of Truth for what SHOULD be in the video.
2. **Video Frame**: The actual output to analyze.

**Process**:
1. **Analyze User Prompt**: Understand the intended subject and action.
2. **Detect Hallucinations**: Look for:
   - Morphing/glitching objects (Consistency).
   - Extra limbs or anatomical errors (Integrity).
   - Physics violations (floating objects, bad shadows) (Physics).
   - "Dream-like" blurring or artifacts.

Return ONLY a JSON object with this EXACT structure:
{
  "analysis": "Brief summary of what is seen vs what was asked...",
  "refinedPrompt": "A corrected, optimized version of the user prompt to fix these issues",
  "score": 50,
  "metrics": {
    "temporalConsistency": 8,
    "physicsCompliance": 7,
    "subjectIntegrity": 6
  },
  "defects": [
    {
      "description": "Extra finger on left hand",
      "category": "integrity",
      "bbox": [0, 0, 0, 0]
    }
  ]
}
score: 0 = Perfect, 100 = Total Failure. metrics: 0-10, 10 is best.
category: physics, consistency, integrity, or other. bbox: [ymin, xmin, ymax, xmax] normalized 0-1000.
"#;

const DIRECTOR_SYSTEM_PROMPT: &str = "You are a world-class Film Director and Prompt Engineer. Your goal is to extract a vivid, detailed video description from the user. Ask 1 short, specific question at a time about lighting, camera angle, or mood. When the user says 'done' or 'generate', output ONLY the final detailed prompt. Do not output anything else.";

const MOCK_ANALYSIS_TEXT: &str = "Mock Analysis: Detected potential inconsistencies in lighting and object permanence. The subject appears to float in frame 3, violating physics constraints.";
const MOCK_PROMPT_SUFFIX: &str = ", cinematic lighting, 8k resolution, highly detailed, photorealistic, physically accurate shadows, continuous motion";
const MOCK_FINAL_PROMPT: &str = "Cinematic wide shot of a cyberpunk city at night, neon rain reflecting on wet pavement, volumetric fog, high contrast, 8k resolution, photorealistic.";
const MOCK_FOLLOW_UP: &str = "That sounds interesting. What kind of lighting are you envisioning for this scene?";
const CHAT_FAILURE_REPLY: &str = "I'm having trouble connecting to the Director. Please try again.";

/// 一次单帧分析的结论（附带结果来源）
#[derive(Debug, Clone, PartialEq)]
pub struct FrameVerdict {
    pub result: AnalysisResult,
    pub source: ResultSource,
}

/// 一次对话回复
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatReply {
    pub content: String,
    pub source: ResultSource,
}

/// 单帧分析能力，编排器只依赖这个接口
#[async_trait]
pub trait FrameAnalyzer: Send + Sync {
    async fn analyze_frame(&self, prompt: &str, image_base64: Option<&str>) -> Result<FrameVerdict>;
}

/// 推理服务探测结果
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub base_url: String,
    pub reachable: bool,
    pub models: Vec<String>,
    pub vision_model: String,
    pub vision_ready: bool,
    pub text_model: String,
    pub text_ready: bool,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

/// 推理服务客户端：服务可用时走真实模型，不可用或返回异常时回退到确定性的模拟结果
#[derive(Debug, Clone)]
pub struct InferenceClient {
    http: reqwest::Client,
    config: InferenceConfig,
}

impl InferenceClient {
    pub fn new(config: InferenceConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().context("创建 HTTP 客户端失败")?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .http
            .get(self.url("/api/tags"))
            .send()
            .await
            .context("请求模型列表失败")?;

        if !response.status().is_success() {
            anyhow::bail!("模型列表返回错误状态: {}", response.status());
        }

        let tags: TagsResponse = response.json().await.context("解析模型列表失败")?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// 模型是否存在（名称包含即可，例如 `llava` 匹配 `llava:latest`）
    pub async fn check_model_availability(&self, model: &str) -> bool {
        match self.list_models().await {
            Ok(models) => models.iter().any(|name| name.contains(model)),
            Err(e) => {
                debug!("[推理服务] 探测失败: {:#}", e);
                false
            }
        }
    }

    pub async fn probe(&self) -> ServiceStatus {
        let (reachable, models) = match self.list_models().await {
            Ok(models) => (true, models),
            Err(e) => {
                debug!("[推理服务] 探测失败: {:#}", e);
                (false, Vec::new())
            }
        };
        let has = |model: &str| models.iter().any(|name| name.contains(model));

        ServiceStatus {
            base_url: self.config.base_url.clone(),
            reachable,
            vision_ready: has(&self.config.vision_model),
            text_ready: has(&self.config.text_model),
            vision_model: self.config.vision_model.clone(),
            text_model: self.config.text_model.clone(),
            models,
        }
    }

    /// 分析一帧；任何失败都会回退到模拟结果，不会向调用方返回错误
    pub async fn analyze(&self, prompt: &str, image_base64: Option<&str>) -> FrameVerdict {
        let model = if image_base64.is_some() {
            self.config.vision_model.as_str()
        } else {
            self.config.text_model.as_str()
        };

        if !self.check_model_availability(model).await {
            warn!("⚠️  [推理服务] 模型 '{}' 不存在或服务离线，使用模拟模式", model);
            tokio::time::sleep(self.config.mock_delay).await;
            return mock_verdict(prompt);
        }

        let images: Vec<&str> = image_base64.map(strip_data_url).into_iter().collect();
        let request = ChatRequest {
            model,
            messages: vec![
                WireMessage {
                    role: Role::System,
                    content: ANALYST_SYSTEM_PROMPT.to_string(),
                    images: Vec::new(),
                },
                WireMessage {
                    role: Role::User,
                    content: format!("User Prompt: \"{}\"", prompt),
                    images,
                },
            ],
            stream: false,
            format: Some("json"),
        };

        let max_attempts = self.config.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match self.send_chat(&request).await {
                Ok(content) => {
                    return match parse_analysis(&content) {
                        Ok(result) => FrameVerdict {
                            result,
                            source: ResultSource::Live,
                        },
                        Err(e) => {
                            error!("❌ [推理服务] JSON 解析失败，回退到模拟结果: {:#}", e);
                            mock_verdict(prompt)
                        }
                    };
                }
                Err(e) => {
                    error!("❌ [推理服务] 分析请求失败（第 {} 次）: {:#}", attempt, e);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.retry_backoff).await;
                    }
                }
            }
        }

        warn!("⚠️  [推理服务] 重试 {} 次仍失败，回退到模拟结果", max_attempts);
        mock_verdict(prompt)
    }

    /// 导演对话的一轮：把完整历史发送给文本模型，返回自由文本
    pub async fn chat_turn(&self, history: &[ChatMessage]) -> ChatReply {
        let model = self.config.text_model.as_str();

        if !self.check_model_availability(model).await {
            warn!("⚠️  [推理服务] 模型 '{}' 不存在或服务离线，导演对话使用模拟模式", model);
            tokio::time::sleep(self.config.chat_mock_delay).await;
            return ChatReply {
                content: mock_chat_reply(history).to_string(),
                source: ResultSource::Mock,
            };
        }

        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(WireMessage {
            role: Role::System,
            content: DIRECTOR_SYSTEM_PROMPT.to_string(),
            images: Vec::new(),
        });
        messages.extend(history.iter().map(|m| WireMessage {
            role: m.role,
            content: m.content.clone(),
            images: Vec::new(),
        }));

        let request = ChatRequest {
            model,
            messages,
            stream: false,
            format: None,
        };

        match self.send_chat(&request).await {
            Ok(content) => ChatReply {
                content,
                source: ResultSource::Live,
            },
            Err(e) => {
                error!("❌ [推理服务] 导演对话失败: {:#}", e);
                ChatReply {
                    content: CHAT_FAILURE_REPLY.to_string(),
                    source: ResultSource::Failed,
                }
            }
        }
    }

    async fn send_chat(&self, request: &ChatRequest<'_>) -> Result<String> {
        let response = self
            .http
            .post(self.url("/api/chat"))
            .json(request)
            .send()
            .await
            .context("推理请求发送失败")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("推理服务返回错误状态: {} - {}", status, body);
        }

        let body: ChatResponse = response.json().await.context("解析推理响应失败")?;
        info!("[推理服务] 收到 {} 的回复 ({} 字符)", request.model, body.message.content.len());
        Ok(body.message.content)
    }
}

#[async_trait]
impl FrameAnalyzer for InferenceClient {
    async fn analyze_frame(&self, prompt: &str, image_base64: Option<&str>) -> Result<FrameVerdict> {
        Ok(self.analyze(prompt, image_base64).await)
    }
}

/// 去掉 `data:image/jpeg;base64,` 前缀
fn strip_data_url(image: &str) -> &str {
    if image.starts_with("data:") {
        image.split_once(',').map(|(_, data)| data).unwrap_or(image)
    } else {
        image
    }
}

/// 去掉模型可能附带的 Markdown 代码块标记
fn strip_code_fences(content: &str) -> String {
    content.replace("```json", "").replace("```", "").trim().to_string()
}

fn parse_analysis(content: &str) -> Result<AnalysisResult> {
    let json = strip_code_fences(content);
    let result: AnalysisResult = serde_json::from_str(&json).context("模型输出不是合法的分析结果 JSON")?;
    Ok(result.clamped())
}

fn mock_verdict(prompt: &str) -> FrameVerdict {
    FrameVerdict {
        result: mock_analysis(prompt),
        source: ResultSource::Mock,
    }
}

/// 确定性的模拟结果，只取决于提示词长度
pub fn mock_analysis(prompt: &str) -> AnalysisResult {
    let seed = prompt.chars().count() as u32;

    AnalysisResult {
        analysis_text: MOCK_ANALYSIS_TEXT.to_string(),
        refined_prompt_text: format!("{}{}", prompt, MOCK_PROMPT_SUFFIX),
        score: 20 + (seed % 60),
        metrics: Metrics {
            temporal_consistency: 6 + (seed % 4),
            physics_compliance: 5 + (seed % 4),
            subject_integrity: 7 + (seed % 3),
        },
        defects: vec![
            Defect {
                description: "Shadow direction inconsistent with light source".to_string(),
                category: DefectCategory::Physics,
                bbox: BoundingBox([100, 100, 300, 300]),
            },
            Defect {
                description: "Object flickering between frames".to_string(),
                category: DefectCategory::Consistency,
                bbox: BoundingBox([400, 400, 600, 600]),
            },
        ],
    }
}

/// 模拟导演：用户说 done / generate 时给出最终提示词，否则继续追问
pub fn mock_chat_reply(history: &[ChatMessage]) -> &'static str {
    let last = history
        .last()
        .map(|m| m.content.to_lowercase())
        .unwrap_or_default();

    if last.contains("done") || last.contains("generate") {
        MOCK_FINAL_PROMPT
    } else {
        MOCK_FOLLOW_UP
    }
}
