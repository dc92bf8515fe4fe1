use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::analysis::{validate_prompt, AnalysisSummary, CancelFlag};
use crate::frame_sampler::is_supported_video;
use crate::models::{Frame, FrameAnalysis};
use crate::views::{self, DefectFeedEntry, TimelinePoint};

/// 工作台操作被拒绝的原因
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StudioError {
    #[error("请上传有效的视频文件: {0}")]
    UnsupportedFile(String),
    #[error("请先输入原始提示词")]
    EmptyPrompt,
    #[error("尚未加载视频")]
    NoVideo,
    #[error("还没有可分析的帧")]
    NoFrames,
    #[error("分析正在进行中")]
    AlreadyAnalyzing,
}

/// 一次分析任务所需的全部输入
#[derive(Debug, Clone)]
pub struct AnalysisJob {
    pub generation: u64,
    pub prompt: String,
    pub frames: Vec<Frame>,
    pub cancel: CancelFlag,
}

/// 工作台状态：当前视频、帧列表与结果表的唯一持有者。
///
/// 每次切换视频都会递增 `generation`，旧视频的采样或分析任务再提交结果会被忽略，
/// 因此结果表的键始终是当前视频帧时间的子集。
#[derive(Debug, Default)]
pub struct Studio {
    video: Option<PathBuf>,
    duration: Option<f64>,
    generation: u64,
    frames: Vec<Frame>,
    results: BTreeMap<u32, FrameAnalysis>,
    sampling: bool,
    analyzing: bool,
    cancel: Option<CancelFlag>,
    last_summary: Option<AnalysisSummary>,
}

impl Studio {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加载新视频：校验类型，清空帧与结果，返回新的 generation
    pub fn load_video(&mut self, path: impl AsRef<Path>) -> Result<u64, StudioError> {
        let path = path.as_ref();
        if !is_supported_video(path) {
            return Err(StudioError::UnsupportedFile(path.display().to_string()));
        }

        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }

        self.generation += 1;
        self.video = Some(path.to_path_buf());
        self.duration = None;
        self.frames.clear();
        self.results.clear();
        self.sampling = true;
        self.analyzing = false;
        self.last_summary = None;

        info!("[工作台] 加载视频: {} (generation {})", path.display(), self.generation);
        Ok(self.generation)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn set_duration(&mut self, generation: u64, duration: f64) {
        if generation == self.generation {
            self.duration = Some(duration);
        }
    }

    /// 追加一帧；旧 generation 或时间不递增的帧会被丢弃
    pub fn push_frame(&mut self, generation: u64, frame: Frame) -> bool {
        if generation != self.generation {
            return false;
        }
        if self.frames.last().is_some_and(|last| last.time >= frame.time) {
            debug!("[工作台] 丢弃乱序帧 {}s", frame.time);
            return false;
        }
        self.frames.push(frame);
        true
    }

    pub fn finish_sampling(&mut self, generation: u64) {
        if generation == self.generation {
            self.sampling = false;
        }
    }

    /// 准备一轮分析，成功后工作台进入分析中状态
    pub fn begin_analysis(&mut self, prompt: &str) -> Result<AnalysisJob, StudioError> {
        let prompt = validate_prompt(prompt).map_err(|_| StudioError::EmptyPrompt)?;
        if self.video.is_none() {
            return Err(StudioError::NoVideo);
        }
        if self.analyzing {
            return Err(StudioError::AlreadyAnalyzing);
        }
        if self.frames.is_empty() {
            return Err(StudioError::NoFrames);
        }

        let cancel = CancelFlag::new();
        self.cancel = Some(cancel.clone());
        self.analyzing = true;
        self.last_summary = None;

        Ok(AnalysisJob {
            generation: self.generation,
            prompt: prompt.to_string(),
            frames: self.frames.clone(),
            cancel,
        })
    }

    /// 写入一帧结果：覆盖同一帧的旧结果，不合并
    pub fn record(&mut self, generation: u64, analysis: FrameAnalysis) -> bool {
        if generation != self.generation {
            return false;
        }
        if !self.frames.iter().any(|f| f.time == analysis.time) {
            return false;
        }
        self.results.insert(analysis.time, analysis);
        true
    }

    pub fn finish_analysis(&mut self, generation: u64, summary: AnalysisSummary) {
        if generation == self.generation {
            self.analyzing = false;
            self.cancel = None;
            self.last_summary = Some(summary);
        }
    }

    /// 请求取消正在进行的分析，返回是否确实有任务被取消
    pub fn cancel_analysis(&mut self) -> bool {
        match &self.cancel {
            Some(cancel) if self.analyzing => {
                cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn results(&self) -> &BTreeMap<u32, FrameAnalysis> {
        &self.results
    }

    pub fn is_analyzing(&self) -> bool {
        self.analyzing
    }

    pub fn current(&self, time: f64) -> Option<&FrameAnalysis> {
        views::current_analysis(&self.results, time)
    }

    pub fn snapshot(&self) -> StudioSnapshot {
        StudioSnapshot {
            video: self.video.as_ref().map(|p| p.display().to_string()),
            duration: self.duration,
            sampling: self.sampling,
            analyzing: self.analyzing,
            frames: self
                .frames
                .iter()
                .map(|f| FrameInfo {
                    time: f.time,
                    bytes: f.image.len(),
                })
                .collect(),
            results: self.results.values().cloned().collect(),
            timeline: views::timeline_series(&self.frames, &self.results),
            defects: views::defect_feed(&self.results),
            average_score: views::average_score(&self.results),
            last_summary: self.last_summary.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameInfo {
    pub time: u32,
    pub bytes: usize,
}

/// 工作台状态的可序列化快照
#[derive(Debug, Clone, Serialize)]
pub struct StudioSnapshot {
    pub video: Option<String>,
    pub duration: Option<f64>,
    pub sampling: bool,
    pub analyzing: bool,
    pub frames: Vec<FrameInfo>,
    pub results: Vec<FrameAnalysis>,
    pub timeline: Vec<TimelinePoint>,
    pub defects: Vec<DefectFeedEntry>,
    pub average_score: u32,
    pub last_summary: Option<AnalysisSummary>,
}
