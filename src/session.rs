use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::models::Session;

/// 模拟登录会话的持久化存储，记录文件存在即视为已登录
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
    login_delay: Duration,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>, login_delay: Duration) -> Self {
        Self {
            path: path.into(),
            login_delay,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.path.clone(), config.login_delay)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 模拟登录：等待一段时间后写入固定的演示用户
    pub async fn establish(&self) -> Result<Session> {
        tokio::time::sleep(self.login_delay).await;

        let session = demo_user();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("创建会话目录失败: {}", parent.display()))?;
        }
        let json = serde_json::to_string(&session).context("序列化会话失败")?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("写入会话文件失败: {}", self.path.display()))?;

        info!("[会话] {} 已登录", session.name);
        Ok(session)
    }

    /// 退出登录，删除会话记录
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!("[会话] 已退出登录");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("删除会话文件失败: {}", self.path.display())),
        }
    }

    /// 当前会话；记录损坏时按未登录处理
    pub fn current(&self) -> Option<Session> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&content) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("⚠️  [会话] 会话记录损坏，按未登录处理: {}", e);
                None
            }
        }
    }

    /// 需要登录的操作调用此方法
    pub fn require(&self) -> Result<Session> {
        self.current()
            .ok_or_else(|| anyhow::anyhow!("尚未登录，请先执行 `vhs-scan login`"))
    }
}

fn demo_user() -> Session {
    Session {
        id: "123".to_string(),
        name: "Demo User".to_string(),
        email: "demo@example.com".to_string(),
        avatar_url: "https://api.dicebear.com/7.x/avataaars/svg?seed=Felix".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> SessionStore {
        SessionStore::new(dir.path().join("state").join("vhs_user.json"), Duration::ZERO)
    }

    #[tokio::test]
    async fn test_login_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store(&dir).current().is_none());

        let session = store(&dir).establish().await.unwrap();
        assert_eq!(session.email, "demo@example.com");

        // 新实例相当于重新加载页面
        let reloaded = store(&dir).current().unwrap();
        assert_eq!(reloaded, session);
        assert!(store(&dir).require().is_ok());
    }

    #[tokio::test]
    async fn test_logout_then_reload_shows_gate() {
        let dir = tempfile::tempdir().unwrap();
        store(&dir).establish().await.unwrap();
        store(&dir).clear().unwrap();

        assert!(store(&dir).current().is_none());
        assert!(store(&dir).require().is_err());
        // 重复退出不报错
        store(&dir).clear().unwrap();
    }

    #[test]
    fn test_corrupt_record_is_logged_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "{not json").unwrap();
        assert!(store.current().is_none());
    }

    #[test]
    fn test_record_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(
            store.path(),
            r#"{"id":"9","name":"N","email":"e@x","avatar":"https://a"}"#,
        )
        .unwrap();
        assert_eq!(store.current().unwrap().avatar_url, "https://a");
    }
}
