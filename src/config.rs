use anyhow::Result;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 推理服务配置
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// 推理服务地址（Ollama 兼容接口）
    pub base_url: String,
    /// 带图像时使用的多模态模型
    pub vision_model: String,
    /// 纯文本对话使用的模型
    pub text_model: String,
    /// 单次分析的最大请求次数
    pub max_attempts: u32,
    /// 两次请求之间的固定等待
    pub retry_backoff: Duration,
    /// 模拟模式下分析结果的人为延迟
    pub mock_delay: Duration,
    /// 模拟模式下对话回复的人为延迟
    pub chat_mock_delay: Duration,
    /// 单个 HTTP 请求超时（None 表示不限制）
    pub request_timeout: Option<Duration>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            vision_model: "llava".to_string(),
            text_model: "llama3".to_string(),
            max_attempts: 2,
            retry_backoff: Duration::from_millis(2000),
            mock_delay: Duration::from_millis(1500),
            chat_mock_delay: Duration::from_millis(1000),
            request_timeout: None,
        }
    }
}

/// 帧采样配置
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// 采样间隔（秒）
    pub interval_secs: u32,
    /// 输出帧宽度
    pub frame_width: u32,
    /// 输出帧高度
    pub frame_height: u32,
    /// JPEG 质量 1-100
    pub jpeg_quality: u8,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 2,
            frame_width: 480,
            frame_height: 270,
            jpeg_quality: 70,
        }
    }
}

/// 会话存储配置
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 会话记录文件
    pub path: PathBuf,
    /// 模拟登录延迟
    pub login_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let dir = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir)
            .join(".vhs-scan");
        Self {
            path: dir.join("vhs_user.json"),
            login_delay: Duration::from_millis(1000),
        }
    }
}

/// 完整应用配置
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub inference: InferenceConfig,
    pub sampler: SamplerConfig,
    pub session: SessionConfig,
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            inference: InferenceConfig::default(),
            sampler: SamplerConfig::default(),
            session: SessionConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

/// 命令行覆盖项（优先级最高）
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub base_url: Option<String>,
    pub vision_model: Option<String>,
    pub text_model: Option<String>,
    pub interval_secs: Option<u32>,
    pub session_path: Option<PathBuf>,
}

/// 从 INI 文件中读到的原始值，缺失项保持 None
#[derive(Debug, Clone, Default)]
struct FileValues {
    base_url: Option<String>,
    vision_model: Option<String>,
    text_model: Option<String>,
    max_attempts: Option<u32>,
    retry_backoff_ms: Option<u64>,
    mock_delay_ms: Option<u64>,
    chat_mock_delay_ms: Option<u64>,
    request_timeout_secs: Option<u64>,
    interval_secs: Option<u32>,
    frame_width: Option<u32>,
    frame_height: Option<u32>,
    jpeg_quality: Option<u8>,
    session_path: Option<PathBuf>,
    login_delay_ms: Option<u64>,
    log_level: Option<String>,
}

/// 从环境变量读到的值
#[derive(Debug, Clone, Default)]
struct EnvValues {
    base_url: Option<String>,
    vision_model: Option<String>,
    text_model: Option<String>,
    interval_secs: Option<u32>,
    session_path: Option<PathBuf>,
    log_level: Option<String>,
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    pub fn load_config(config_file: Option<&Path>, overrides: ConfigOverrides) -> Result<AppConfig> {
        // 显式指定的配置文件必须可读；默认位置找不到则忽略
        let file = match config_file {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load_from_default_locations().unwrap_or_default(),
        };
        let env_values = Self::load_from_env();
        Ok(Self::merge(file, env_values, overrides))
    }

    fn merge(file: FileValues, env_values: EnvValues, overrides: ConfigOverrides) -> AppConfig {
        let defaults = AppConfig::default();

        let inference = InferenceConfig {
            base_url: overrides
                .base_url
                .or(env_values.base_url)
                .or(file.base_url)
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.inference.base_url),
            vision_model: overrides
                .vision_model
                .or(env_values.vision_model)
                .or(file.vision_model)
                .unwrap_or(defaults.inference.vision_model),
            text_model: overrides
                .text_model
                .or(env_values.text_model)
                .or(file.text_model)
                .unwrap_or(defaults.inference.text_model),
            max_attempts: file
                .max_attempts
                .filter(|n| *n > 0)
                .unwrap_or(defaults.inference.max_attempts),
            retry_backoff: file
                .retry_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.inference.retry_backoff),
            mock_delay: file
                .mock_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.inference.mock_delay),
            chat_mock_delay: file
                .chat_mock_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.inference.chat_mock_delay),
            request_timeout: file
                .request_timeout_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        };

        let sampler = SamplerConfig {
            interval_secs: overrides
                .interval_secs
                .or(env_values.interval_secs)
                .or(file.interval_secs)
                .filter(|secs| *secs > 0)
                .unwrap_or(defaults.sampler.interval_secs),
            frame_width: file.frame_width.filter(|w| *w > 0).unwrap_or(defaults.sampler.frame_width),
            frame_height: file.frame_height.filter(|h| *h > 0).unwrap_or(defaults.sampler.frame_height),
            jpeg_quality: file
                .jpeg_quality
                .map(|q| q.clamp(1, 100))
                .unwrap_or(defaults.sampler.jpeg_quality),
        };

        let session = SessionConfig {
            path: overrides
                .session_path
                .or(env_values.session_path)
                .or(file.session_path)
                .unwrap_or(defaults.session.path),
            login_delay: file
                .login_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.session.login_delay),
        };

        AppConfig {
            inference,
            sampler,
            session,
            log_level: env_values
                .log_level
                .or(file.log_level)
                .unwrap_or(defaults.log_level),
        }
    }

    fn load_from_env() -> EnvValues {
        EnvValues {
            base_url: env::var("VHS_SCAN_OLLAMA_URL").ok().filter(|v| !v.is_empty()),
            vision_model: env::var("VHS_SCAN_VISION_MODEL").ok().filter(|v| !v.is_empty()),
            text_model: env::var("VHS_SCAN_TEXT_MODEL").ok().filter(|v| !v.is_empty()),
            interval_secs: env::var("VHS_SCAN_SAMPLE_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok()),
            session_path: env::var_os("VHS_SCAN_SESSION_PATH").map(PathBuf::from),
            log_level: env::var("LOG_LEVEL").ok().filter(|v| !v.is_empty()),
        }
    }

    /// 从INI配置文件加载配置
    fn load_from_file(config_path: &Path) -> Result<FileValues> {
        if !config_path.exists() {
            return Err(anyhow::anyhow!("配置文件不存在: {}", config_path.display()));
        }

        let mut parser = configparser::ini::Ini::new();
        parser
            .load(config_path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;

        // 先找指定节，找不到再回退到 [DEFAULT]
        let get = |section: &str, key: &str| -> Option<String> {
            parser
                .get(section, key)
                .or_else(|| parser.get("DEFAULT", key))
                .filter(|v| !v.is_empty())
        };
        let num = |section: &str, key: &str| -> Option<u64> { get(section, key).and_then(|v| v.parse().ok()) };

        Ok(FileValues {
            base_url: get("inference", "base_url"),
            vision_model: get("inference", "vision_model"),
            text_model: get("inference", "text_model"),
            max_attempts: get("inference", "max_attempts").and_then(|v| v.parse().ok()),
            retry_backoff_ms: num("inference", "retry_backoff_ms"),
            mock_delay_ms: num("inference", "mock_delay_ms"),
            chat_mock_delay_ms: num("inference", "chat_mock_delay_ms"),
            request_timeout_secs: num("inference", "request_timeout_secs"),
            interval_secs: get("sampler", "interval_secs").and_then(|v| v.parse().ok()),
            frame_width: get("sampler", "frame_width").and_then(|v| v.parse().ok()),
            frame_height: get("sampler", "frame_height").and_then(|v| v.parse().ok()),
            jpeg_quality: get("sampler", "jpeg_quality").and_then(|v| v.parse().ok()),
            session_path: get("session", "path").map(PathBuf::from),
            login_delay_ms: num("session", "login_delay_ms"),
            log_level: get("logging", "level"),
        })
    }

    /// 从默认位置加载配置文件
    fn load_from_default_locations() -> Result<FileValues> {
        let mut candidates = vec![PathBuf::from("vhs-scan.ini"), PathBuf::from(".vhs-scan.ini")];
        if let Some(home) = env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(".vhs-scan.ini"));
        }
        candidates.push(PathBuf::from("/etc/vhs-scan.ini"));

        for candidate in candidates {
            if candidate.exists() {
                return Self::load_from_file(&candidate);
            }
        }

        Err(anyhow::anyhow!("未找到配置文件"))
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let defaults = AppConfig::default();
        let mut parser = configparser::ini::Ini::new();
        let ms = |d: Duration| Some(d.as_millis().to_string());

        parser.set("inference", "base_url", Some(defaults.inference.base_url.clone()));
        parser.set("inference", "vision_model", Some(defaults.inference.vision_model.clone()));
        parser.set("inference", "text_model", Some(defaults.inference.text_model.clone()));
        parser.set("inference", "max_attempts", Some(defaults.inference.max_attempts.to_string()));
        parser.set("inference", "retry_backoff_ms", ms(defaults.inference.retry_backoff));
        parser.set("inference", "mock_delay_ms", ms(defaults.inference.mock_delay));
        parser.set("inference", "chat_mock_delay_ms", ms(defaults.inference.chat_mock_delay));
        parser.set("inference", "request_timeout_secs", Some("0".to_string()));
        parser.set("sampler", "interval_secs", Some(defaults.sampler.interval_secs.to_string()));
        parser.set("sampler", "frame_width", Some(defaults.sampler.frame_width.to_string()));
        parser.set("sampler", "frame_height", Some(defaults.sampler.frame_height.to_string()));
        parser.set("sampler", "jpeg_quality", Some(defaults.sampler.jpeg_quality.to_string()));
        parser.set("session", "path", Some(String::new()));
        parser.set("session", "login_delay_ms", ms(defaults.session.login_delay));
        parser.set("logging", "level", Some(defaults.log_level.clone()));

        parser
            .write(config_path)
            .map_err(|e| anyhow::anyhow!("写入配置文件失败: {}: {}", config_path.display(), e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_defaults() {
        let config = ConfigLoader::merge(FileValues::default(), EnvValues::default(), ConfigOverrides::default());
        assert_eq!(config.inference.base_url, "http://localhost:11434");
        assert_eq!(config.inference.max_attempts, 2);
        assert_eq!(config.inference.retry_backoff, Duration::from_secs(2));
        assert_eq!(config.sampler.interval_secs, 2);
        assert_eq!((config.sampler.frame_width, config.sampler.frame_height), (480, 270));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_merge_precedence() {
        let file = FileValues {
            base_url: Some("http://file:1".into()),
            vision_model: Some("file-vision".into()),
            text_model: Some("file-text".into()),
            interval_secs: Some(5),
            ..FileValues::default()
        };
        let env_values = EnvValues {
            base_url: Some("http://env:2/".into()),
            vision_model: Some("env-vision".into()),
            ..EnvValues::default()
        };
        let overrides = ConfigOverrides {
            base_url: Some("http://cli:3".into()),
            ..ConfigOverrides::default()
        };

        let config = ConfigLoader::merge(file, env_values, overrides);
        assert_eq!(config.inference.base_url, "http://cli:3");
        assert_eq!(config.inference.vision_model, "env-vision");
        assert_eq!(config.inference.text_model, "file-text");
        assert_eq!(config.sampler.interval_secs, 5);
    }

    #[test]
    fn test_zero_interval_falls_back_to_default() {
        let overrides = ConfigOverrides { interval_secs: Some(0), ..ConfigOverrides::default() };
        let config = ConfigLoader::merge(FileValues::default(), EnvValues::default(), overrides);
        assert_eq!(config.sampler.interval_secs, 2);
    }

    #[test]
    fn test_default_config_file_round_trips_through_loader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vhs-scan.ini");
        ConfigLoader::create_default_config(&path).unwrap();

        let values = ConfigLoader::load_from_file(&path).unwrap();
        assert_eq!(values.vision_model.as_deref(), Some("llava"));
        assert_eq!(values.retry_backoff_ms, Some(2000));
        assert_eq!(values.jpeg_quality, Some(70));
        // 空路径视为未配置
        assert!(values.session_path.is_none());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ConfigLoader::load_config(Some(&dir.path().join("nope.ini")), ConfigOverrides::default());
        assert!(result.is_err());
    }
}
