//! Configuration file support

use chatpilot_agent::{
    ControllerConfig, DetectorConfig, GeneratorConfig, Profile, RetryConfig,
    generator::DEFAULT_SYSTEM_PROMPT,
};
use chatpilot_ai::GenerationConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for chatpilot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelSettings,
    pub retry: RetrySettings,
    pub run: RunSettings,
    pub user: UserSettings,
    pub site: SiteSettings,
    pub selectors: Selectors,
    pub browser: BrowserSettings,
}

/// Model backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub id: String,
    /// API key (alternative to GEMINI_API_KEY / GOOGLE_API_KEY)
    pub api_key: Option<String>,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
    /// Per-call timeout in seconds, 0 to disable
    pub request_timeout_secs: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        let generation = GenerationConfig::default();
        Self {
            id: chatpilot_ai::models::DEFAULT_MODEL_ID.to_string(),
            api_key: None,
            temperature: generation.temperature,
            top_p: generation.top_p,
            top_k: generation.top_k,
            max_output_tokens: generation.max_output_tokens,
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_secs: f64,
    pub max_delay_secs: f64,
    pub backoff_multiplier: f64,
}

impl RetrySettings {
    /// Check the values can drive a backoff schedule
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        for (name, secs) in [
            ("initial_delay_secs", self.initial_delay_secs),
            ("max_delay_secs", self.max_delay_secs),
        ] {
            if !secs.is_finite() || secs < 0.0 {
                return Err(format!("{} must be a non-negative number, got {}", name, secs));
            }
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(format!(
                "backoff_multiplier must be at least 1, got {}",
                self.backoff_multiplier
            ));
        }
        Ok(())
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        let retry = RetryConfig::default();
        Self {
            max_attempts: retry.max_attempts,
            initial_delay_secs: retry.initial_delay.as_secs_f64(),
            max_delay_secs: retry.max_delay.as_secs_f64(),
            backoff_multiplier: retry.backoff_multiplier,
        }
    }
}

/// Turn loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub start_message: String,
    pub poll_interval_ms: u64,
    /// Give up waiting for a reply after this many seconds, 0 to wait forever
    pub staleness_timeout_secs: u64,
    pub settle_delay_secs: f64,
    /// Pause between typing and submitting
    pub delivery_pause_ms: u64,
    /// Where transcripts go (defaults to the data dir)
    pub transcripts_dir: Option<PathBuf>,
    /// File whose contents replace the built-in system prompt
    pub system_prompt_file: Option<PathBuf>,
    /// Delete a conversation's logs before its first run in this process
    pub reset_logs: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            start_message: ControllerConfig::default().start_message,
            poll_interval_ms: 1500,
            staleness_timeout_secs: 300,
            settle_delay_secs: 5.0,
            delivery_pause_ms: 1000,
            transcripts_dir: None,
            system_prompt_file: None,
            reset_logs: true,
        }
    }
}

/// The simulated user's own profile
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSettings {
    pub name: String,
    pub age: String,
    pub bio: String,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            name: "Alex".to_string(),
            age: "28".to_string(),
            bio: "Software engineer who likes travelling, good coffee and long walks.".to_string(),
        }
    }
}

/// Where things live on the chat site
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteSettings {
    pub base_url: String,
    pub login_url: String,
    pub chat_path: String,
    pub character_path: String,
    /// Prefix for relative image sources
    pub image_base: String,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            base_url: "https://golove.ai/".to_string(),
            login_url: "https://golove.ai/login".to_string(),
            chat_path: "chat/".to_string(),
            character_path: "character/".to_string(),
            image_base: "https://golove.ai/".to_string(),
        }
    }
}

impl SiteSettings {
    pub fn chat_url(&self, conversation_id: &str) -> String {
        format!("{}{}{}", self.base_url, self.chat_path, conversation_id)
    }

    pub fn character_url(&self, counterpart_id: &str) -> String {
        format!("{}{}{}", self.base_url, self.character_path, counterpart_id)
    }

    /// Absolute URL for an image `src` attribute
    pub fn image_url(&self, src: &str) -> String {
        if src.starts_with("http://") || src.starts_with("https://") {
            src.to_string()
        } else {
            format!("{}{}", self.image_base, src.trim_start_matches('/'))
        }
    }
}

/// CSS selectors for the chat and profile pages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Selectors {
    /// Block holding the most recent message
    pub latest_message: String,
    /// Counterpart message inside that block
    pub incoming_message: String,
    /// Paragraphs of a message: text first, displayed time second
    pub message_paragraphs: String,
    pub message_image: String,
    pub text_input: String,
    pub send_button: String,
    pub profile_name: String,
    pub profile_age: String,
    pub profile_bio: String,
    /// How long to wait for a selector to appear, in seconds
    pub wait_timeout_secs: u64,
}

impl Default for Selectors {
    fn default() -> Self {
        Self {
            latest_message: r"body > main > div.relative.overscroll-none.overflow-y-auto.w-full.z-\[15\].pb-\[24px\].pt-\[8px\].flex-1.h-full.mx-auto.px-\[16px\].allow-select > div > div:nth-child(1)".to_string(),
            incoming_message: "div.flex.justify-start".to_string(),
            message_paragraphs: "p".to_string(),
            message_image: "img".to_string(),
            text_input: r"body > main > div:nth-child(3) textarea".to_string(),
            send_button: r"body > main > div:nth-child(3) > div > div.flex.gap-\[16px\].items-end > div > button".to_string(),
            profile_name: r"body > main div.flex.flex-col.gap-\[2px\] > h4".to_string(),
            profile_age: r"body > main div.flex.flex-col.gap-\[2px\] > h4 > span".to_string(),
            profile_bio: r"body > main div.flex.flex-col.gap-\[30px\] > div.flex.flex-col.gap-\[12px\] > p".to_string(),
            wait_timeout_secs: 30,
        }
    }
}

/// Browser launch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// Chrome or Chromium binary, detected when unset
    pub executable: Option<PathBuf>,
    /// Persistent browser profile, keeps the site login between runs
    pub profile_dir: Option<PathBuf>,
    pub headless: bool,
    /// Upper bound on a single browser command, in seconds
    pub request_timeout_secs: u64,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            executable: None,
            profile_dir: None,
            headless: false,
            request_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chatpilot")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        // Check for CHATPILOT_CONFIG_PATH env var first
        if let Ok(path) = std::env::var("CHATPILOT_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Directory for transcripts and the browser profile
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chatpilot")
    }

    /// Load config from a file, falling back to defaults
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<Config>(&content) {
                Ok(config) => config.validated(),
                Err(e) => {
                    tracing::warn!("Failed to parse config file {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Replace sections whose values cannot be used with their defaults
    pub fn validated(mut self) -> Self {
        if let Err(e) = self.retry.validate() {
            tracing::warn!("Invalid [retry] settings, using defaults: {}", e);
            self.retry = RetrySettings::default();
        }
        let settle = self.run.settle_delay_secs;
        if !settle.is_finite() || settle < 0.0 {
            tracing::warn!("Invalid settle_delay_secs {}, using default", settle);
            self.run.settle_delay_secs = RunSettings::default().settle_delay_secs;
        }
        self
    }

    /// Save config to a file
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init(path: &Path) -> std::io::Result<PathBuf> {
        if !path.exists() {
            Config::default().save_to(path)?;
        }
        Ok(path.to_path_buf())
    }

    /// API key from config, then environment
    pub fn api_key(&self) -> Option<String> {
        chatpilot_ai::providers::get_api_key(
            self.model.api_key.as_deref(),
            chatpilot_ai::providers::google::API_KEY_ENV_VARS,
        )
        .ok()
    }

    pub fn transcripts_dir(&self) -> PathBuf {
        self.run
            .transcripts_dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("transcripts"))
    }

    pub fn browser_profile_dir(&self) -> PathBuf {
        self.browser
            .profile_dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("browser_profile"))
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            poll_interval: Duration::from_millis(self.run.poll_interval_ms),
            staleness_timeout: non_zero_secs(self.run.staleness_timeout_secs),
        }
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        let system_prompt = match &self.run.system_prompt_file {
            Some(path) => match fs::read_to_string(path) {
                Ok(prompt) => prompt,
                Err(e) => {
                    tracing::warn!(
                        "Failed to read system prompt file {}: {}",
                        path.display(),
                        e
                    );
                    DEFAULT_SYSTEM_PROMPT.to_string()
                }
            },
            None => DEFAULT_SYSTEM_PROMPT.to_string(),
        };

        let defaults = RetryConfig::default();
        GeneratorConfig {
            system_prompt,
            generation: GenerationConfig {
                temperature: self.model.temperature,
                top_p: self.model.top_p,
                top_k: self.model.top_k,
                max_output_tokens: self.model.max_output_tokens,
                ..GenerationConfig::default()
            },
            retry: RetryConfig {
                max_attempts: self.retry.max_attempts,
                initial_delay: secs_or(self.retry.initial_delay_secs, defaults.initial_delay),
                max_delay: secs_or(self.retry.max_delay_secs, defaults.max_delay),
                backoff_multiplier: self.retry.backoff_multiplier,
            },
            request_timeout: non_zero_secs(self.model.request_timeout_secs),
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            start_message: self.run.start_message.clone(),
            user_profile: Profile::new(&self.user.name, &self.user.age, &self.user.bio),
            settle_delay: secs_or(
                self.run.settle_delay_secs,
                ControllerConfig::default().settle_delay,
            ),
        }
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn secs_or(secs: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(fallback)
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# chatpilot configuration file
# Place at ~/.config/chatpilot/config.toml (Linux), or point CHATPILOT_CONFIG_PATH at it

[model]
id = "gemini-2.0-flash"
# api_key = "..."            # or set GEMINI_API_KEY / GOOGLE_API_KEY
temperature = 0.9
top_p = 1.0
top_k = 1
max_output_tokens = 2048
request_timeout_secs = 60

[retry]
max_attempts = 7
initial_delay_secs = 1.0
max_delay_secs = 60.0
backoff_multiplier = 2.0

[run]
start_message = "Hi! How are you?"
poll_interval_ms = 1500
staleness_timeout_secs = 300  # 0 waits forever
settle_delay_secs = 5.0
delivery_pause_ms = 1000
reset_logs = true
# transcripts_dir = "/home/me/chatpilot/transcripts"
# system_prompt_file = "/home/me/chatpilot/prompt.txt"

[user]
name = "Alex"
age = "28"
bio = "Software engineer who likes travelling, good coffee and long walks."

[site]
base_url = "https://golove.ai/"
login_url = "https://golove.ai/login"
chat_path = "chat/"
character_path = "character/"
image_base = "https://golove.ai/"

[browser]
headless = false
request_timeout_secs = 30
# executable = "/usr/bin/chromium"
# profile_dir = "/home/me/.local/share/chatpilot/browser_profile"

# [selectors] overrides the CSS selectors used on the chat and profile pages
"#
}
