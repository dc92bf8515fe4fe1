pub mod analysis;
pub mod config;
pub mod director;
pub mod frame_sampler;
pub mod handler;
pub mod inference;
pub mod models;
pub mod report;
pub mod session;
pub mod studio;
pub mod views;

pub use analysis::{run_analysis, AnalysisSummary, CancelFlag};
pub use config::{AppConfig, ConfigLoader, ConfigOverrides};
pub use director::Director;
pub use frame_sampler::{is_supported_video, sample_times, stream_frames, FrameSampler, SampleEvent};
pub use inference::{FrameAnalyzer, FrameVerdict, InferenceClient};
pub use models::{AnalysisResult, ChatMessage, Frame, FrameAnalysis, ResultSource, Session};
pub use session::SessionStore;
pub use studio::{Studio, StudioError};
