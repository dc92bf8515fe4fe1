use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use vhs_scan::{
    analysis::validate_prompt,
    config::{AppConfig, ConfigLoader, ConfigOverrides},
    is_supported_video, report, run_analysis, stream_frames, Director, InferenceClient, ResultSource, SampleEvent,
    SessionStore, Studio,
};

/// 视频幻觉检测工具 - 按固定间隔抽帧，交给本地多模态模型评估与提示词的偏差
#[derive(Parser, Debug)]
#[command(name = "vhs-scan")]
#[command(about = "视频幻觉检测：抽帧、逐帧评分、生成缺陷报告", long_about = None)]
struct Args {
    /// 配置文件路径（可选，支持 .ini 格式）
    /// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 推理服务地址，也可通过环境变量 VHS_SCAN_OLLAMA_URL 设置
    #[arg(long, global = true)]
    ollama_url: Option<String>,

    /// 多模态模型名称
    #[arg(long, global = true)]
    vision_model: Option<String>,

    /// 文本模型名称
    #[arg(long, global = true)]
    text_model: Option<String>,

    /// 会话记录文件
    #[arg(long, global = true)]
    session_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 分析本地视频文件
    Analyze {
        /// 输入视频文件路径
        #[arg(short, long)]
        input: PathBuf,

        /// 生成该视频时使用的原始提示词
        #[arg(short, long, conflicts_with = "prompt_file")]
        prompt: Option<String>,

        /// 从文件读取提示词（例如 director --save 的输出）
        #[arg(long)]
        prompt_file: Option<PathBuf>,

        /// 输出目录
        #[arg(short, long, default_value = "./output")]
        output: PathBuf,

        /// 采样间隔（秒），也可通过环境变量 VHS_SCAN_SAMPLE_INTERVAL 设置
        #[arg(long)]
        interval: Option<u32>,
    },
    /// 与 AI 导演对话，逐步构建视频提示词
    Director {
        /// 使用 /use 时把提示词保存到该文件
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// 模拟登录
    Login,
    /// 退出登录
    Logout,
    /// 查看当前登录用户
    Whoami,
    /// 探测推理服务与模型是否可用
    Probe,
    /// 生成默认配置文件
    InitConfig {
        #[arg(default_value = "vhs-scan.ini")]
        path: PathBuf,
    },
    /// Web 服务模式
    Serve {
        /// 监听地址（默认从环境变量 VHS_SCAN_PORT 读取，如果不存在则使用 127.0.0.1:8787）
        #[arg(short, long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let interval = match &args.command {
        Commands::Analyze { interval, .. } => *interval,
        _ => None,
    };
    let config = ConfigLoader::load_config(
        args.config.as_deref(),
        ConfigOverrides {
            base_url: args.ollama_url.clone(),
            vision_model: args.vision_model.clone(),
            text_model: args.text_model.clone(),
            interval_secs: interval,
            session_path: args.session_path.clone(),
        },
    )
    .context("加载配置失败")?;

    // 初始化日志
    let level = config.log_level.parse::<tracing::Level>().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    let sessions = SessionStore::from_config(&config.session);

    match args.command {
        Commands::Analyze {
            input,
            prompt,
            prompt_file,
            output,
            ..
        } => {
            sessions.require()?;
            let prompt = match (prompt, prompt_file) {
                (Some(prompt), _) => prompt,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("读取提示词文件失败: {}", path.display()))?,
                (None, None) => String::new(),
            };
            analyze(&config, &input, &prompt, &output).await?;
        }
        Commands::Director { save } => {
            sessions.require()?;
            director(&config, save.as_deref()).await?;
        }
        Commands::Login => {
            let session = sessions.establish().await?;
            println!("已登录: {} <{}>", session.name, session.email);
        }
        Commands::Logout => {
            sessions.clear()?;
            println!("已退出登录");
        }
        Commands::Whoami => match sessions.current() {
            Some(session) => println!("{} <{}> (id: {})", session.name, session.email, session.id),
            None => println!("未登录"),
        },
        Commands::Probe => {
            let client = InferenceClient::new(config.inference.clone())?;
            let status = client.probe().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            if !status.vision_ready {
                warn!("⚠️  模型 '{}' 不可用，分析将使用模拟模式", status.vision_model);
            }
        }
        Commands::InitConfig { path } => {
            ConfigLoader::create_default_config(&path)?;
            println!("已生成配置文件: {}", path.display());
        }
        Commands::Serve { bind } => {
            // 优先使用命令行参数，其次使用环境变量 VHS_SCAN_PORT，最后使用默认值
            let bind_addr = bind.unwrap_or_else(|| {
                std::env::var("VHS_SCAN_PORT")
                    .map(|port| format!("0.0.0.0:{}", port))
                    .unwrap_or_else(|_| "127.0.0.1:8787".to_string())
            });
            start_web_server(&config, sessions, &bind_addr).await?;
        }
    }

    Ok(())
}

async fn analyze(config: &AppConfig, input: &Path, prompt: &str, output: &Path) -> Result<()> {
    // 先校验文件类型与提示词，再开始耗时的采样
    if !is_supported_video(input) {
        anyhow::bail!("请上传有效的视频文件: {}", input.display());
    }
    if !input.exists() {
        anyhow::bail!("视频文件不存在: {}", input.display());
    }
    let prompt = validate_prompt(prompt)?.to_string();

    let total_start = Instant::now();
    let client = InferenceClient::new(config.inference.clone())?;
    let mut studio = Studio::new();
    let generation = studio.load_video(input)?;

    // 1. 采样：边采样边输出进度
    let (tx, mut rx) = mpsc::channel(8);
    let sampling = tokio::spawn(stream_frames(input.to_path_buf(), config.sampler.clone(), tx));
    let mut expected = 0;
    while let Some(event) = rx.recv().await {
        match event {
            SampleEvent::Metadata {
                duration,
                expected_frames,
            } => {
                studio.set_duration(generation, duration);
                expected = expected_frames;
                println!("   📊 视频时长 {:.2}秒，预计采样 {} 帧", duration, expected_frames);
            }
            SampleEvent::Frame(frame) => {
                let time = frame.time;
                studio.push_frame(generation, frame);
                println!("   🎞️  已采样 {}s ({}/{})", time, studio.frames().len(), expected);
            }
        }
    }
    let report = sampling.await.context("采样任务异常退出")??;
    studio.finish_sampling(generation);

    if studio.frames().is_empty() {
        warn!("⚠️  没有采样到任何帧（时长 {:.2}秒）", report.duration);
    }

    // 2. 逐帧分析，Ctrl-C 取消剩余帧
    let job = studio.begin_analysis(&prompt)?;
    let cancel = job.cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("⚠️  收到中断信号，当前帧完成后停止分析");
            cancel.cancel();
        }
    });

    let summary = run_analysis(&client, &job.frames, &job.prompt, &job.cancel, |analysis| {
        let marker = match analysis.source {
            ResultSource::Live => "",
            ResultSource::Mock => " [模拟]",
            ResultSource::Failed => " [失败]",
        };
        println!(
            "   📝 {:>4}s  幻觉评分 {:>3}%  缺陷 {} 个{}",
            analysis.time,
            analysis.result.score,
            analysis.result.defects.len(),
            marker
        );
        studio.record(generation, analysis);
    })
    .await?;
    ctrl_c.abort();
    studio.finish_analysis(generation, summary.clone());

    // 3. 输出报告
    let snapshot = studio.snapshot();
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("平均幻觉评分: {}%", snapshot.average_score);
    for entry in &snapshot.defects {
        for defect in &entry.defects {
            println!(
                "  • {:>4}s [{:?}] {} (bbox {:?})",
                entry.time, defect.category, defect.description, defect.bbox.0
            );
        }
    }
    if summary.mock > 0 {
        warn!("⚠️  {} 帧使用了模拟结果，推理服务可能未启动", summary.mock);
    }

    let report_path = report::write_report(output, input, &prompt, summary, &studio)?;
    info!(
        "🎉 处理完成！总耗时: {:.2}秒，报告: {}",
        total_start.elapsed().as_secs_f64(),
        report_path.display()
    );
    Ok(())
}

async fn director(config: &AppConfig, save: Option<&Path>) -> Result<()> {
    let client = InferenceClient::new(config.inference.clone())?;
    let mut director = Director::new();

    if let Some(greeting) = director.latest_reply() {
        println!("🎬 {}", greeting);
    }
    println!("（输入 /use 使用最近一条回复作为提示词，/quit 退出）");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("读取输入失败")? {
        match line.trim() {
            "/quit" => break,
            "/use" => {
                let prompt = director.latest_reply().unwrap_or_default().to_string();
                println!("{}", prompt);
                if let Some(path) = save {
                    std::fs::write(path, &prompt)
                        .with_context(|| format!("保存提示词失败: {}", path.display()))?;
                    println!("提示词已保存到: {}", path.display());
                }
                break;
            }
            text => {
                if let Some((reply, source)) = director.send(&client, text).await {
                    let marker = match source {
                        ResultSource::Live => "",
                        ResultSource::Mock => " [模拟]",
                        ResultSource::Failed => " [推理失败]",
                    };
                    println!("🎬 {}{}", reply, marker);
                }
            }
        }
    }

    Ok(())
}

async fn start_web_server(config: &AppConfig, sessions: SessionStore, bind: &str) -> Result<()> {
    use tower_http::cors::CorsLayer;
    use vhs_scan::handler::{self, AppState};

    let client = InferenceClient::new(config.inference.clone())?;
    let state = AppState::new(client, sessions, config.sampler.clone());
    let app = handler::router(state).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .context(format!("绑定地址失败: {}", bind))?;

    tracing::info!("Web 服务器启动在: http://{}", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("可用端点:");
    tracing::info!("  • 健康检查: GET  http://{}/health", bind);
    tracing::info!("  • 推理服务状态: GET  http://{}/status", bind);
    tracing::info!("  • 会话: GET http://{0}/session | POST http://{0}/session/login | POST http://{0}/session/logout", bind);
    tracing::info!("  • 加载视频: POST http://{}/studio/video", bind);
    tracing::info!("  • 开始分析: POST http://{}/studio/analysis", bind);
    tracing::info!("  • 取消分析: POST http://{}/studio/analysis/cancel", bind);
    tracing::info!("  • 工作台状态: GET  http://{}/studio", bind);
    tracing::info!("  • 当前帧结果: GET  http://{}/studio/current?t=<秒>", bind);
    tracing::info!("  • 导演对话: POST http://{}/director/message", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    axum::serve(listener, app).await.context("启动服务器失败")?;

    Ok(())
}
