use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 采样得到的单帧（时间戳 + JPEG 图像）
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    /// 帧时间（秒）
    pub time: u32,
    /// JPEG 编码后的图像数据
    pub image: Vec<u8>,
}

impl Frame {
    pub fn new(time: u32, image: Vec<u8>) -> Self {
        Self { time, image }
    }

    /// 图像的 base64 编码（推理服务 `images` 字段使用）
    pub fn base64(&self) -> String {
        STANDARD.encode(&self.image)
    }

    /// `data:image/jpeg;base64,...` 形式，便于直接在浏览器中展示
    pub fn data_url(&self) -> String {
        format!("data:image/jpeg;base64,{}", self.base64())
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("time", &self.time)
            .field("image_bytes", &self.image.len())
            .finish()
    }
}

/// 单帧幻觉分析结果（与模型约定的 JSON 结构一致）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// 画面内容与提示词的对比说明
    #[serde(rename = "analysis")]
    pub analysis_text: String,
    /// 修正后的提示词
    #[serde(rename = "refinedPrompt")]
    pub refined_prompt_text: String,
    /// 幻觉评分 0-100（0 = 完美，100 = 完全失败）
    pub score: u32,
    pub metrics: Metrics,
    #[serde(default)]
    pub defects: Vec<Defect>,
}

impl AnalysisResult {
    pub const MAX_SCORE: u32 = 100;

    /// 模型输出不可信，把各数值收敛到约定范围内
    pub fn clamped(mut self) -> Self {
        self.score = self.score.min(Self::MAX_SCORE);
        self.metrics = self.metrics.clamped();
        for defect in &mut self.defects {
            defect.bbox = defect.bbox.clamped();
        }
        self
    }
}

/// 三项质量指标，均为 0-10（10 最好）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub temporal_consistency: u32,
    pub physics_compliance: u32,
    pub subject_integrity: u32,
}

impl Metrics {
    pub const MAX: u32 = 10;

    fn clamped(self) -> Self {
        Self {
            temporal_consistency: self.temporal_consistency.min(Self::MAX),
            physics_compliance: self.physics_compliance.min(Self::MAX),
            subject_integrity: self.subject_integrity.min(Self::MAX),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defect {
    pub description: String,
    pub category: DefectCategory,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefectCategory {
    Physics,
    Consistency,
    Integrity,
    #[serde(other)]
    Other,
}

/// 缺陷区域 `[ymin, xmin, ymax, xmax]`，坐标归一化到 0-1000
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox(pub [u32; 4]);

impl BoundingBox {
    pub const SCALE: u32 = 1000;

    pub fn ymin(&self) -> u32 {
        self.0[0]
    }

    pub fn xmin(&self) -> u32 {
        self.0[1]
    }

    pub fn ymax(&self) -> u32 {
        self.0[2]
    }

    pub fn xmax(&self) -> u32 {
        self.0[3]
    }

    fn clamped(self) -> Self {
        Self(self.0.map(|v| v.min(Self::SCALE)))
    }
}

/// 结果来源：真实推理服务、模拟数据，或推理服务可用但本次请求失败后的兜底回复
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    Live,
    Mock,
    Failed,
}

/// 编排器保存的单帧分析记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameAnalysis {
    pub time: u32,
    pub result: AnalysisResult,
    pub source: ResultSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 导演对话中的一条消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }
}

/// 模拟登录的用户会话
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(rename = "avatar")]
    pub avatar_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_payload() {
        let json = r#"{
            "analysis": "A cat floats above the ground",
            "refinedPrompt": "cat running on grass",
            "score": 64,
            "metrics": {"temporalConsistency": 8, "physicsCompliance": 3, "subjectIntegrity": 9},
            "defects": [
                {"description": "Cat floats", "category": "physics", "bbox": [10, 20, 300, 400]},
                {"description": "Odd tail", "category": "anatomy", "bbox": [0, 0, 5, 5]}
            ]
        }"#;

        let result: AnalysisResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.score, 64);
        assert_eq!(result.metrics.physics_compliance, 3);
        assert_eq!(result.defects[0].category, DefectCategory::Physics);
        assert_eq!(result.defects[0].bbox.xmax(), 400);
        // 未知类别归入 other
        assert_eq!(result.defects[1].category, DefectCategory::Other);
    }

    #[test]
    fn test_missing_defects_defaults_to_empty() {
        let json = r#"{
            "analysis": "ok",
            "refinedPrompt": "ok",
            "score": 0,
            "metrics": {"temporalConsistency": 10, "physicsCompliance": 10, "subjectIntegrity": 10}
        }"#;

        let result: AnalysisResult = serde_json::from_str(json).unwrap();
        assert!(result.defects.is_empty());
    }

    #[test]
    fn test_clamped_bounds_model_output() {
        let result = AnalysisResult {
            analysis_text: String::new(),
            refined_prompt_text: String::new(),
            score: 250,
            metrics: Metrics { temporal_consistency: 11, physics_compliance: 4, subject_integrity: 99 },
            defects: vec![Defect {
                description: "x".into(),
                category: DefectCategory::Other,
                bbox: BoundingBox([0, 1200, 500, 5000]),
            }],
        }
        .clamped();

        assert_eq!(result.score, 100);
        assert_eq!(result.metrics, Metrics { temporal_consistency: 10, physics_compliance: 4, subject_integrity: 10 });
        assert_eq!(result.defects[0].bbox, BoundingBox([0, 1000, 500, 1000]));
    }

    #[test]
    fn test_session_uses_avatar_field() {
        let session = Session {
            id: "123".into(),
            name: "Demo User".into(),
            email: "demo@example.com".into(),
            avatar_url: "https://example.com/a.svg".into(),
        };
        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["avatar"], "https://example.com/a.svg");
    }

    #[test]
    fn test_frame_data_url() {
        let frame = Frame::new(4, vec![0xff, 0xd8, 0xff]);
        assert_eq!(frame.data_url(), "data:image/jpeg;base64,/9j/");
    }
}
