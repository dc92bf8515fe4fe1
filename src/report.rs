use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::analysis::AnalysisSummary;
use crate::studio::{Studio, StudioSnapshot};

/// 一次 CLI 分析的完整报告（写入 report.json）
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub run_id: String,
    pub generated_at: String,
    pub input_video: String,
    pub prompt: String,
    pub summary: AnalysisSummary,
    /// 帧图片文件名，与 `studio.frames` 顺序一致
    pub frame_files: Vec<String>,
    pub studio: StudioSnapshot,
}

/// 写出帧图片与 report.json，返回报告文件路径
pub fn write_report(
    output_dir: impl AsRef<Path>,
    input_video: &Path,
    prompt: &str,
    summary: AnalysisSummary,
    studio: &Studio,
) -> Result<PathBuf> {
    let output_dir = output_dir.as_ref();
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("创建输出目录失败: {}", output_dir.display()))?;

    let mut frame_files = Vec::with_capacity(studio.frames().len());
    for (index, frame) in studio.frames().iter().enumerate() {
        let filename = format!("frame_{:04}.jpg", index);
        let path = output_dir.join(&filename);
        std::fs::write(&path, &frame.image).with_context(|| format!("保存帧图片失败: {}", filename))?;
        frame_files.push(filename);
    }

    let report = AnalysisReport {
        run_id: uuid::Uuid::new_v4().to_string(),
        generated_at: Utc::now().to_rfc3339(),
        input_video: input_video.display().to_string(),
        prompt: prompt.to_string(),
        summary,
        frame_files,
        studio: studio.snapshot(),
    };

    let report_path = output_dir.join("report.json");
    let json = serde_json::to_string_pretty(&report).map_err(|e| {
        error!("❌ [分析报告] 序列化报告失败: {}", e);
        anyhow::anyhow!("序列化报告失败: {}", e)
    })?;
    std::fs::write(&report_path, json)
        .with_context(|| format!("写入报告文件失败: {}", report_path.display()))?;

    info!("✅ [分析报告] 报告已写入: {}", report_path.display());
    Ok(report_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::mock_analysis;
    use crate::models::{Frame, FrameAnalysis, ResultSource};

    #[test]
    fn test_write_report() {
        let dir = tempfile::tempdir().unwrap();
        let mut studio = Studio::new();
        let generation = studio.load_video("clip.mp4").unwrap();
        studio.push_frame(generation, Frame::new(0, vec![0xff, 0xd8, 0x00]));
        studio.push_frame(generation, Frame::new(2, vec![0xff, 0xd8, 0x01]));
        studio.record(
            generation,
            FrameAnalysis {
                time: 2,
                result: mock_analysis("cat running!"),
                source: ResultSource::Mock,
            },
        );

        let summary = AnalysisSummary {
            total_frames: 2,
            analyzed: 1,
            failed: 1,
            mock: 1,
            ..AnalysisSummary::default()
        };
        let path = write_report(dir.path(), Path::new("clip.mp4"), "cat running!", summary, &studio).unwrap();

        assert_eq!(std::fs::read(dir.path().join("frame_0001.jpg")).unwrap(), vec![0xff, 0xd8, 0x01]);

        let report: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(report["prompt"], "cat running!");
        assert_eq!(report["summary"]["failed"], 1);
        assert_eq!(report["frame_files"][0], "frame_0000.jpg");
        assert!(report["studio"]["results"][0]["result"]["refinedPrompt"]
            .as_str()
            .unwrap()
            .starts_with("cat running!, cinematic"));
        assert_eq!(report["studio"]["timeline"][1]["score"], 32);
    }
}
