use std::env;
use std::time::Duration;

use once_cell::sync::Lazy;
use tracing::warn;

use crate::backend::gemini::GeminiConfig;
use crate::backend::RetryPolicy;
use crate::orchestrator::OrchestratorSettings;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub gemini_api_key: String,
    pub gemini_image_model: String,
    pub gemini_safety_settings: String,
    pub call_timeout_secs: u64,
    pub worker_pool_size: usize,
    pub max_retry_attempts: usize,
    pub retry_base_delay_ms: u64,
    pub batch_timeout_secs: u64,
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn normalize_safety_settings(value: String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "permissive".to_string();
    }

    let lowered = trimmed.to_lowercase();
    match lowered.as_str() {
        "permissive" | "off" | "none" => "permissive".to_string(),
        "standard" => "standard".to_string(),
        _ => {
            warn!(
                "Unknown GEMINI_SAFETY_SETTINGS value '{}'; defaulting to permissive.",
                value
            );
            "permissive".to_string()
        }
    }
}

impl Config {
    pub fn load() -> Self {
        Self {
            log_level: env_string("LOG_LEVEL", "info"),
            gemini_api_key: env_string("GEMINI_API_KEY", ""),
            gemini_image_model: env_string(
                "GEMINI_IMAGE_MODEL",
                "gemini-2.5-flash-image-preview",
            ),
            gemini_safety_settings: normalize_safety_settings(env_string(
                "GEMINI_SAFETY_SETTINGS",
                "permissive",
            )),
            call_timeout_secs: env_u64("GEMINI_CALL_TIMEOUT_SECS", 120),
            worker_pool_size: env_usize("WORKER_POOL_SIZE", 3).max(1),
            max_retry_attempts: env_usize("MAX_RETRY_ATTEMPTS", 2).max(1),
            retry_base_delay_ms: env_u64("RETRY_BASE_DELAY_MS", 900),
            batch_timeout_secs: env_u64("BATCH_TIMEOUT_SECS", 600),
        }
    }

    /// Explicit client configuration handed to the Gemini client at
    /// construction; the client never reads credentials on its own.
    pub fn gemini_config(&self) -> GeminiConfig {
        GeminiConfig {
            api_key: self.gemini_api_key.clone(),
            image_model: self.gemini_image_model.clone(),
            safety_profile: self.gemini_safety_settings.clone(),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            worker_pool_size: self.worker_pool_size,
            retry: RetryPolicy {
                max_attempts: self.max_retry_attempts,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
            },
            batch_timeout: Duration::from_secs(self.batch_timeout_secs),
        }
    }
}

pub static CONFIG: Lazy<Config> = Lazy::new(Config::load);
