//! 配置模块
//!
//! 从 YAML 文件加载配置，所有字段都有默认值，部分配置即可工作。
//!
//! ```yaml
//! server:
//!   host: 127.0.0.1
//!   port: 8999
//! upstreams:
//!   - name: openai
//!     base_url: https://api.openai.com
//!     api_key: sk-...
//! default_upstream: openai
//! stream:
//!   buffer:
//!     max_age_ms: 500
//!   breaker:
//!     max_failures: 3
//! logging:
//!   level: debug
//! ```

use crate::resilience::{CircuitBreakerConfig, RecoveryPolicy, RetryConfig, TimeoutConfig};
use crate::stutter::{BufferConfig, DetectorConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// 配置目录名
pub const CONFIG_DIR: &str = ".relaycast";
/// 配置文件名
pub const CONFIG_FILE: &str = "config.yaml";

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("无法获取主目录")]
    NoHomeDir,

    #[error("读取配置文件失败 {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("解析配置文件失败: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("配置无效: {0}")]
    Invalid(String),
}

/// 服务监听配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8999,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// 上游配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl UpstreamConfig {
    /// 拼接上游 API 路径
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// 流处理配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    pub detector: DetectorConfig,
    pub buffer: BufferConfig,
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub timeout: TimeoutConfig,
    pub recovery: RecoveryPolicy,
    /// 内容历史窗口大小
    pub history_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            detector: DetectorConfig::default(),
            buffer: BufferConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            timeout: TimeoutConfig::default(),
            recovery: RecoveryPolicy::default(),
            history_size: 5,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace / debug / info / warn / error
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// 完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub upstreams: Vec<UpstreamConfig>,
    pub default_upstream: Option<String>,
    pub stream: StreamConfig,
    pub logging: LoggingConfig,
}

impl RelayConfig {
    /// 默认配置文件路径 `~/.relaycast/config.yaml`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// 从文件加载并校验
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&content)?;
        tracing::info!("[Config] 已加载配置: {}", path.display());
        Ok(config)
    }

    /// 文件存在时加载，否则使用默认配置
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!("[Config] 配置文件不存在，使用默认配置: {}", path.display());
            Ok(Self::default())
        }
    }

    /// 从 YAML 字符串解析并校验
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// 校验取值范围
    pub fn validate(&self) -> Result<(), ConfigError> {
        let detector = &self.stream.detector;
        for (name, value) in [
            ("confidence_threshold", detector.confidence_threshold),
            ("confidence_floor", detector.confidence_floor),
            ("similarity_threshold", detector.similarity_threshold),
            ("timing_ratio", detector.timing_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "stream.detector.{} 必须在 [0, 1] 范围内，当前为 {}",
                    name, value
                )));
            }
        }
        if detector.confidence_floor > detector.confidence_threshold {
            return Err(ConfigError::Invalid(
                "stream.detector.confidence_floor 不能大于 confidence_threshold".to_string(),
            ));
        }
        let w = &detector.weights;
        if [w.prefix, w.length, w.timing, w.similarity]
            .iter()
            .any(|v| *v < 0.0)
        {
            return Err(ConfigError::Invalid(
                "stream.detector.weights 不能为负数".to_string(),
            ));
        }

        if self.stream.buffer.max_bytes == 0 || self.stream.buffer.max_age_ms == 0 {
            return Err(ConfigError::Invalid(
                "stream.buffer 的 max_bytes 与 max_age_ms 必须大于 0".to_string(),
            ));
        }
        if self.stream.breaker.max_failures == 0 {
            return Err(ConfigError::Invalid(
                "stream.breaker.max_failures 必须大于 0".to_string(),
            ));
        }
        let retry = &self.stream.retry;
        if retry.max_delay_ms < retry.base_delay_ms {
            return Err(ConfigError::Invalid(
                "stream.retry.max_delay_ms 不能小于 base_delay_ms".to_string(),
            ));
        }
        if retry.backoff_factor < 1.0 || retry.jitter_ratio < 0.0 {
            return Err(ConfigError::Invalid(
                "stream.retry.backoff_factor 必须 >= 1 且 jitter_ratio 不能为负数".to_string(),
            ));
        }
        if self.stream.history_size == 0 {
            return Err(ConfigError::Invalid(
                "stream.history_size 必须大于 0".to_string(),
            ));
        }

        if let Some(name) = &self.default_upstream {
            if self.upstream(name).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "default_upstream '{}' 不在 upstreams 中",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn upstream(&self, name: &str) -> Option<&UpstreamConfig> {
        self.upstreams.iter().find(|u| u.name == name)
    }

    /// 默认上游；未指定时取第一个
    pub fn default_upstream(&self) -> Option<&UpstreamConfig> {
        match &self.default_upstream {
            Some(name) => self.upstream(name),
            None => self.upstreams.first(),
        }
    }
}
