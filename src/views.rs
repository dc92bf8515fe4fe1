//! 展示层的纯派生计算：当前帧结果、评分时间线、缺陷列表。
//! 每次都从帧列表和结果表重新计算，不做缓存。

use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::{Defect, Frame, FrameAnalysis};

/// 时间线上的一个点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimelinePoint {
    pub time: u32,
    pub score: u32,
}

/// 缺陷列表中的一项（对应一帧）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DefectFeedEntry {
    pub time: u32,
    pub score: u32,
    pub description: String,
    pub defects: Vec<Defect>,
}

/// 取播放位置 `current_time` 对应的结果：先按四舍五入后的整秒精确匹配，
/// 否则取时间差最小的结果，差值相同时保留先出现的键。
pub fn current_analysis(results: &BTreeMap<u32, FrameAnalysis>, current_time: f64) -> Option<&FrameAnalysis> {
    if current_time.is_finite() && current_time >= 0.0 {
        if let Some(exact) = results.get(&(current_time.round() as u32)) {
            return Some(exact);
        }
    }

    let mut best: Option<(&FrameAnalysis, f64)> = None;
    for (time, analysis) in results {
        let diff = (f64::from(*time) - current_time).abs();
        match best {
            Some((_, best_diff)) if diff >= best_diff => {}
            _ => best = Some((analysis, diff)),
        }
    }
    best.map(|(analysis, _)| analysis)
}

/// 每个采样帧一个点，尚未分析的帧评分为 0
pub fn timeline_series(frames: &[Frame], results: &BTreeMap<u32, FrameAnalysis>) -> Vec<TimelinePoint> {
    frames
        .iter()
        .map(|frame| TimelinePoint {
            time: frame.time,
            score: results.get(&frame.time).map(|a| a.result.score).unwrap_or(0),
        })
        .collect()
}

/// 按时间排序的缺陷列表
pub fn defect_feed(results: &BTreeMap<u32, FrameAnalysis>) -> Vec<DefectFeedEntry> {
    results
        .values()
        .map(|analysis| DefectFeedEntry {
            time: analysis.time,
            score: analysis.result.score,
            description: analysis.result.analysis_text.clone(),
            defects: analysis.result.defects.clone(),
        })
        .collect()
}

/// 平均幻觉评分（四舍五入），没有结果时为 0
pub fn average_score(results: &BTreeMap<u32, FrameAnalysis>) -> u32 {
    if results.is_empty() {
        return 0;
    }
    let total: u64 = results.values().map(|a| u64::from(a.result.score)).sum();
    (total as f64 / results.len() as f64).round() as u32
}
