use anyhow::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::inference::FrameAnalyzer;
use crate::models::{Frame, FrameAnalysis, ResultSource};

/// 分析任务的取消标记，可在其他任务中克隆后调用 `cancel`
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 一轮分析的统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnalysisSummary {
    pub total_frames: usize,
    pub analyzed: usize,
    pub failed: usize,
    /// 使用模拟结果的帧数
    pub mock: usize,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

/// 校验提示词，空白提示词不允许开始分析。
/// 只用去除首尾空白后的内容判断是否为空，返回的仍是原始输入。
pub fn validate_prompt(prompt: &str) -> Result<&str> {
    if prompt.trim().is_empty() {
        anyhow::bail!("请先输入原始提示词");
    }
    Ok(prompt)
}

/// 逐帧顺序分析：同一时间只有一个请求在途，每得到一个结果立即通过 `on_result` 发布。
///
/// 单帧失败只记录日志并跳过该帧，整轮分析继续；只有空提示词会返回错误。
/// 取消标记在每帧开始前检查。
pub async fn run_analysis<A, F>(
    analyzer: &A,
    frames: &[Frame],
    prompt: &str,
    cancel: &CancelFlag,
    mut on_result: F,
) -> Result<AnalysisSummary>
where
    A: FrameAnalyzer + ?Sized,
    F: FnMut(FrameAnalysis),
{
    let prompt = validate_prompt(prompt)?;
    let start = Instant::now();
    let mut summary = AnalysisSummary {
        total_frames: frames.len(),
        ..AnalysisSummary::default()
    };

    info!("🔍 [幻觉分析] 开始分析 {} 帧", frames.len());

    for (index, frame) in frames.iter().enumerate() {
        if cancel.is_cancelled() {
            warn!("⚠️  [幻觉分析] 分析已取消，剩余 {} 帧未处理", frames.len() - index);
            summary.cancelled = true;
            break;
        }

        let image = frame.base64();
        match analyzer.analyze_frame(prompt, Some(&image)).await {
            Ok(verdict) => {
                if verdict.source == ResultSource::Mock {
                    summary.mock += 1;
                }
                summary.analyzed += 1;
                info!(
                    "📝 [幻觉分析] {}s: 评分 {} ({}/{})",
                    frame.time,
                    verdict.result.score,
                    index + 1,
                    frames.len()
                );
                on_result(FrameAnalysis {
                    time: frame.time,
                    result: verdict.result,
                    source: verdict.source,
                });
            }
            Err(e) => {
                summary.failed += 1;
                error!("❌ [幻觉分析] {}s 分析失败: {:#}", frame.time, e);
            }
        }
    }

    summary.elapsed_ms = start.elapsed().as_millis() as u64;
    info!(
        "✅ [幻觉分析] 分析结束: 成功 {} 帧，失败 {} 帧，模拟 {} 帧，耗时 {:.2}秒",
        summary.analyzed,
        summary.failed,
        summary.mock,
        start.elapsed().as_secs_f64()
    );

    Ok(summary)
}
