use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::Json as ResponseJson,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::analysis::{run_analysis, AnalysisSummary};
use crate::config::SamplerConfig;
use crate::director::Director;
use crate::frame_sampler::{stream_frames, SampleEvent};
use crate::inference::{InferenceClient, ServiceStatus};
use crate::models::{ChatMessage, FrameAnalysis, ResultSource, Session};
use crate::session::SessionStore;
use crate::studio::{Studio, StudioError, StudioSnapshot};

type ApiError = (StatusCode, String);

/// 服务模式下的共享状态
#[derive(Clone)]
pub struct AppState {
    pub client: InferenceClient,
    pub sessions: SessionStore,
    pub sampler: SamplerConfig,
    pub studio: Arc<Mutex<Studio>>,
    pub director: Arc<tokio::sync::Mutex<Director>>,
}

impl AppState {
    pub fn new(client: InferenceClient, sessions: SessionStore, sampler: SamplerConfig) -> Self {
        Self {
            client,
            sessions,
            sampler,
            studio: Arc::new(Mutex::new(Studio::new())),
            director: Arc::new(tokio::sync::Mutex::new(Director::new())),
        }
    }

    fn studio(&self) -> MutexGuard<'_, Studio> {
        lock_studio(&self.studio)
    }

    fn require_session(&self) -> Result<Session, ApiError> {
        self.sessions
            .current()
            .ok_or_else(|| (StatusCode::UNAUTHORIZED, "尚未登录".to_string()))
    }
}

fn lock_studio(studio: &Mutex<Studio>) -> MutexGuard<'_, Studio> {
    studio.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 构建全部路由
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/status", get(service_status))
        .route("/session", get(current_session))
        .route("/session/login", post(login))
        .route("/session/logout", post(logout))
        .route("/studio", get(studio_snapshot))
        .route("/studio/video", post(load_video))
        .route("/studio/analysis", post(start_analysis))
        .route("/studio/analysis/cancel", post(cancel_analysis))
        .route("/studio/current", get(current_frame))
        .route("/director", get(director_history))
        .route("/director/message", post(director_message))
        .with_state(state)
}

/// 健康检查 Handler
pub async fn health_check() -> &'static str {
    "OK"
}

/// 推理服务状态（模型是否就绪、是否会走模拟模式）
pub async fn service_status(State(state): State<AppState>) -> ResponseJson<ServiceStatus> {
    ResponseJson(state.client.probe().await)
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session: Option<Session>,
}

pub async fn current_session(State(state): State<AppState>) -> ResponseJson<SessionResponse> {
    ResponseJson(SessionResponse {
        session: state.sessions.current(),
    })
}

pub async fn login(State(state): State<AppState>) -> Result<ResponseJson<Session>, ApiError> {
    state.sessions.establish().await.map(ResponseJson).map_err(|e| {
        error!("登录失败: {:#}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("登录失败: {}", e))
    })
}

pub async fn logout(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.sessions.clear().map_err(|e| {
        error!("退出登录失败: {:#}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("退出登录失败: {}", e))
    })?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn studio_snapshot(State(state): State<AppState>) -> Result<ResponseJson<StudioSnapshot>, ApiError> {
    state.require_session()?;
    Ok(ResponseJson(state.studio().snapshot()))
}

/// 加载视频请求
#[derive(Debug, Deserialize)]
pub struct LoadVideoRequest {
    /// 本地视频文件路径
    pub input: String,
}

#[derive(Debug, Serialize)]
pub struct LoadVideoResponse {
    pub generation: u64,
    pub video: String,
}

/// 加载视频并在后台采样，帧会逐个出现在工作台快照中
pub async fn load_video(
    State(state): State<AppState>,
    Json(request): Json<LoadVideoRequest>,
) -> Result<ResponseJson<LoadVideoResponse>, ApiError> {
    state.require_session()?;
    info!("收到加载视频请求: {:?}", request);

    let input_path = PathBuf::from(&request.input);
    if !input_path.exists() {
        return Err((
            StatusCode::NOT_FOUND,
            format!("视频文件不存在: {}", input_path.display()),
        ));
    }

    let generation = state.studio().load_video(&input_path).map_err(studio_error)?;

    let (tx, mut rx) = mpsc::channel(8);
    let sampler_config = state.sampler.clone();
    let sampling_path = input_path.clone();
    let sampling = tokio::spawn(async move { stream_frames(&sampling_path, sampler_config, tx).await });

    let studio = state.studio.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let mut guard = lock_studio(&studio);
            if guard.generation() != generation {
                // 已切换到其他视频，丢弃接收端让采样线程停止
                break;
            }
            match event {
                SampleEvent::Metadata { duration, .. } => guard.set_duration(generation, duration),
                SampleEvent::Frame(frame) => {
                    guard.push_frame(generation, frame);
                }
            }
        }
        drop(rx);

        match sampling.await {
            Ok(Ok(report)) => info!("采样结束: {}/{} 帧", report.extracted_frames, report.expected_frames),
            Ok(Err(e)) => error!("采样失败: {:#}", e),
            Err(e) => error!("采样任务异常: {}", e),
        }
        lock_studio(&studio).finish_sampling(generation);
    });

    Ok(ResponseJson(LoadVideoResponse {
        generation,
        video: input_path.display().to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct StartAnalysisRequest {
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct StartAnalysisResponse {
    pub generation: u64,
    pub frames: usize,
}

/// 开始一轮分析（后台顺序执行，结果逐帧写入工作台）
pub async fn start_analysis(
    State(state): State<AppState>,
    Json(request): Json<StartAnalysisRequest>,
) -> Result<ResponseJson<StartAnalysisResponse>, ApiError> {
    state.require_session()?;

    let job = state.studio().begin_analysis(&request.prompt).map_err(studio_error)?;
    let response = StartAnalysisResponse {
        generation: job.generation,
        frames: job.frames.len(),
    };

    let client = state.client.clone();
    let studio = state.studio.clone();
    tokio::spawn(async move {
        let generation = job.generation;
        let summary = run_analysis(&client, &job.frames, &job.prompt, &job.cancel, |analysis| {
            lock_studio(&studio).record(generation, analysis);
        })
        .await
        .unwrap_or_else(|e| {
            warn!("分析未能开始: {:#}", e);
            AnalysisSummary::default()
        });
        lock_studio(&studio).finish_analysis(generation, summary);
    });

    Ok(ResponseJson(response))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

pub async fn cancel_analysis(State(state): State<AppState>) -> Result<ResponseJson<CancelResponse>, ApiError> {
    state.require_session()?;
    Ok(ResponseJson(CancelResponse {
        cancelled: state.studio().cancel_analysis(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct CurrentQuery {
    /// 播放位置（秒）
    pub t: f64,
}

pub async fn current_frame(
    State(state): State<AppState>,
    Query(query): Query<CurrentQuery>,
) -> Result<ResponseJson<Option<FrameAnalysis>>, ApiError> {
    state.require_session()?;
    Ok(ResponseJson(state.studio().current(query.t).cloned()))
}

#[derive(Debug, Serialize)]
pub struct DirectorHistory {
    pub messages: Vec<ChatMessage>,
    pub latest_reply: Option<String>,
}

pub async fn director_history(State(state): State<AppState>) -> Result<ResponseJson<DirectorHistory>, ApiError> {
    state.require_session()?;
    let director = state.director.lock().await;
    Ok(ResponseJson(DirectorHistory {
        messages: director.messages().to_vec(),
        latest_reply: director.latest_reply().map(str::to_string),
    }))
}

#[derive(Debug, Deserialize)]
pub struct DirectorMessageRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct DirectorReply {
    pub reply: String,
    pub source: ResultSource,
}

pub async fn director_message(
    State(state): State<AppState>,
    Json(request): Json<DirectorMessageRequest>,
) -> Result<ResponseJson<DirectorReply>, ApiError> {
    state.require_session()?;
    let mut director = state.director.lock().await;
    let (reply, source) = director
        .send(&state.client, &request.text)
        .await
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "消息不能为空".to_string()))?;
    Ok(ResponseJson(DirectorReply { reply, source }))
}

fn studio_error(e: StudioError) -> ApiError {
    let status = match e {
        StudioError::AlreadyAnalyzing => StatusCode::CONFLICT,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InferenceConfig;
    use crate::models::Frame;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    struct Harness {
        state: AppState,
        dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = InferenceClient::new(InferenceConfig {
            base_url: format!("http://{}", addr),
            mock_delay: Duration::ZERO,
            chat_mock_delay: Duration::ZERO,
            retry_backoff: Duration::ZERO,
            ..InferenceConfig::default()
        })
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let sessions = SessionStore::new(dir.path().join("vhs_user.json"), Duration::ZERO);

        Harness {
            state: AppState::new(client, sessions, SamplerConfig::default()),
            dir,
        }
    }

    async fn call(state: &AppState, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::String(String::from_utf8_lossy(&bytes).into()));
        (status, value)
    }

    #[tokio::test]
    async fn test_studio_requires_session() {
        let h = harness().await;
        let (status, _) = call(&h.state, "GET", "/studio", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = call(&h.state, "POST", "/session/login", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Demo User");

        let (status, _) = call(&h.state, "GET", "/studio", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&h.state, "POST", "/session/logout", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, body) = call(&h.state, "GET", "/session", None).await;
        assert!(body["session"].is_null());
    }

    #[tokio::test]
    async fn test_load_video_validation() {
        let h = harness().await;
        call(&h.state, "POST", "/session/login", None).await;

        let (status, _) = call(&h.state, "POST", "/studio/video", Some(json!({ "input": "/nope/clip.mp4" }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let text_file = h.dir.path().join("notes.txt");
        std::fs::write(&text_file, "hello").unwrap();
        let (status, body) = call(
            &h.state,
            "POST",
            "/studio/video",
            Some(json!({ "input": text_file.display().to_string() })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.as_str().unwrap().contains("请上传有效的视频文件"));
    }

    #[tokio::test]
    async fn test_load_video_samples_in_background() {
        let h = harness().await;
        call(&h.state, "POST", "/session/login", None).await;

        let clip = h.dir.path().join("clip.mp4");
        crate::frame_sampler::test_clip::write_clip(&clip, 9);

        let (status, body) = call(
            &h.state,
            "POST",
            "/studio/video",
            Some(json!({ "input": clip.display().to_string() })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["generation"], 1);

        for _ in 0..500 {
            if !h.state.studio().snapshot().sampling {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (_, snapshot) = call(&h.state, "GET", "/studio", None).await;
        assert_eq!(snapshot["sampling"], false);
        let times: Vec<u64> = snapshot["frames"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["time"].as_u64().unwrap())
            .collect();
        assert_eq!(times, vec![0, 2, 4, 6, 8]);
        assert!(snapshot["duration"].as_f64().unwrap() > 8.5);
    }

    #[tokio::test]
    async fn test_analysis_pass_in_mock_mode() {
        let h = harness().await;
        call(&h.state, "POST", "/session/login", None).await;

        let (status, _) = call(&h.state, "POST", "/studio/analysis", Some(json!({ "prompt": "cat" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        {
            let mut studio = h.state.studio();
            let generation = studio.load_video("clip.mp4").unwrap();
            for t in [0, 2, 4] {
                studio.push_frame(generation, Frame::new(t, vec![0xff, 0xd8]));
            }
            studio.finish_sampling(generation);
        }

        let (status, _) = call(&h.state, "POST", "/studio/analysis", Some(json!({ "prompt": "  " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&h.state, "POST", "/studio/analysis", Some(json!({ "prompt": "cat running!" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["frames"], 3);

        for _ in 0..200 {
            if !h.state.studio().is_analyzing() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (_, snapshot) = call(&h.state, "GET", "/studio", None).await;
        assert_eq!(snapshot["analyzing"], false);
        assert_eq!(snapshot["results"].as_array().unwrap().len(), 3);
        assert_eq!(snapshot["results"][0]["source"], "mock");
        assert_eq!(snapshot["average_score"], 32);
        assert_eq!(snapshot["last_summary"]["mock"], 3);

        let (_, current) = call(&h.state, "GET", "/studio/current?t=3.2", None).await;
        assert_eq!(current["time"], 4);
    }

    #[tokio::test]
    async fn test_director_conversation() {
        let h = harness().await;
        let (status, _) = call(&h.state, "POST", "/director/message", Some(json!({ "text": "hi" }))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        call(&h.state, "POST", "/session/login", None).await;
        let (status, body) = call(&h.state, "POST", "/director/message", Some(json!({ "text": "generate" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], "mock");
        assert!(body["reply"].as_str().unwrap().starts_with("Cinematic"));

        let (status, _) = call(&h.state, "POST", "/director/message", Some(json!({ "text": "" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, history) = call(&h.state, "GET", "/director", None).await;
        assert_eq!(history["messages"].as_array().unwrap().len(), 3);
    }
}
