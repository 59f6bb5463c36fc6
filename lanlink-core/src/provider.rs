//! Chat providers and the request bodies they accept.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::format::WireFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Local server found by discovery. NDJSON, no auth.
    Ollama,
    OpenAi,
    OpenRouter,
}

impl Provider {
    pub fn wire_format(self) -> WireFormat {
        match self {
            Provider::Ollama => WireFormat::Ndjson,
            Provider::OpenAi | Provider::OpenRouter => WireFormat::Sse,
        }
    }

    /// Path appended to the provider's API base for a streaming chat.
    pub fn chat_path(self) -> &'static str {
        match self {
            Provider::Ollama => "chat",
            Provider::OpenAi | Provider::OpenRouter => "chat/completions",
        }
    }

    pub fn requires_auth(self) -> bool {
        !matches!(self, Provider::Ollama)
    }

    /// API base for a discovered server's `http://host:port`.
    pub fn api_base_for(self, server_base: &str) -> String {
        match self {
            Provider::Ollama => format!("{}/api", server_base.trim_end_matches('/')),
            Provider::OpenAi | Provider::OpenRouter => {
                format!("{}/v1", server_base.trim_end_matches('/'))
            }
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Provider::Ollama => "ollama",
            Provider::OpenAi => "openai",
            Provider::OpenRouter => "openrouter",
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown provider: {0}")]
pub struct UnknownProvider(String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ollama" => Ok(Provider::Ollama),
            "openai" => Ok(Provider::OpenAi),
            "openrouter" => Ok(Provider::OpenRouter),
            _ => Err(UnknownProvider(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }
}

/// `{model, messages, stream: true}`; identical shape for every provider.
#[derive(Debug, Clone, Serialize)]
pub struct ChatBody<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub stream: bool,
}

/// `{name}` for `POST /pull`.
#[derive(Debug, Clone, Serialize)]
pub struct PullBody<'a> {
    pub name: &'a str,
}

/// What a stream session asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKind {
    Chat {
        provider: Provider,
        model: String,
        messages: Vec<ChatMessage>,
    },
    /// Ollama model pull; NDJSON progress.
    Pull { name: String },
}

impl StreamKind {
    pub fn wire_format(&self) -> WireFormat {
        match self {
            StreamKind::Chat { provider, .. } => provider.wire_format(),
            StreamKind::Pull { .. } => WireFormat::Ndjson,
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            StreamKind::Chat { provider, .. } => provider.chat_path(),
            StreamKind::Pull { .. } => "pull",
        }
    }

    pub fn url(&self, api_base: &str) -> String {
        format!("{}/{}", api_base.trim_end_matches('/'), self.path())
    }

    pub fn body(&self) -> serde_json::Value {
        let body = match self {
            StreamKind::Chat {
                model, messages, ..
            } => serde_json::to_value(ChatBody {
                model,
                messages,
                stream: true,
            }),
            StreamKind::Pull { name } => serde_json::to_value(PullBody { name }),
        };
        body.unwrap_or(serde_json::Value::Null)
    }

    pub fn requires_auth(&self) -> bool {
        match self {
            StreamKind::Chat { provider, .. } => provider.requires_auth(),
            StreamKind::Pull { .. } => false,
        }
    }
}
