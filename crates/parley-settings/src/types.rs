use serde::{Deserialize, Serialize};

/// Root settings document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ParleySettings {
    pub backend: BackendSettings,
    pub generation: GenerationSettings,
    pub turn: TurnSettings,
    pub logging: LoggingSettings,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// OpenAI-compatible `/chat/completions` over HTTP with SSE streaming.
    #[default]
    #[serde(rename = "openai", alias = "open_ai")]
    OpenAi,
    /// Offline backend that streams the user's words back.
    Echo,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" | "open_ai" => Ok(Self::OpenAi),
            "echo" => Ok(Self::Echo),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub connect_timeout_ms: u64,
    pub idle_timeout_ms: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            kind: BackendKind::OpenAi,
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            connect_timeout_ms: 30_000,
            idle_timeout_ms: 90_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GenerationSettings {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// System prompt sent with every request. Never stored in context.
    pub instructions: Option<String>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: Some(0.7),
            max_tokens: None,
            instructions: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TurnSettings {
    /// Deadline for one backend request; `None` disables it.
    pub request_timeout_ms: Option<u64>,
    pub tool_timeout_ms: u64,
    pub max_tool_rounds: u32,
    pub event_buffer: usize,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: Some(60_000),
            tool_timeout_ms: 120_000,
            max_tool_rounds: 16,
            event_buffer: 256,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Per-module overrides, e.g. `{"parley_engine": "debug"}`.
    pub modules: std::collections::BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            modules: std::collections::BTreeMap::new(),
        }
    }
}
