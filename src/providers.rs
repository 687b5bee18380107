//! Well-known OpenAI-compatible providers, and API key lookup.

use crate::prelude::*;

/// A remote provider preset.
#[derive(Clone, Debug, Serialize)]
pub struct ProviderPreset {
    pub key: &'static str,
    pub label: &'static str,
    pub base_url: &'static str,
    pub api_key_env: &'static str,
    pub notes: &'static str,
    pub example_models: &'static [&'static str],
}

/// The providers we know how to talk to out of the box.
pub static PROVIDER_PRESETS: &[ProviderPreset] = &[
    ProviderPreset {
        key: "openai",
        label: "OpenAI",
        base_url: "https://api.openai.com/v1",
        api_key_env: "OPENAI_API_KEY",
        notes: "Official OpenAI endpoint.",
        example_models: &["gpt-5.2", "gpt-5-mini"],
    },
    ProviderPreset {
        key: "openrouter",
        label: "OpenRouter",
        base_url: "https://openrouter.ai/api/v1",
        api_key_env: "OPENROUTER_API_KEY",
        notes: "OpenRouter OpenAI-compatible endpoint.",
        example_models: &["google/gemini-3-flash-preview"],
    },
    ProviderPreset {
        key: "gemini",
        label: "Gemini",
        base_url: "https://generativelanguage.googleapis.com/v1beta/openai/",
        api_key_env: "GEMINI_API_KEY",
        notes: "Google Gemini OpenAI-compatible endpoint.",
        example_models: &["gemini-3-pro-preview", "gemini-3-flash-preview"],
    },
];

/// Local OCR models that are known to work with vLLM.
pub static DEFAULT_LOCAL_MODELS: &[&str] = &[
    "lightonai/LightOnOCR-2-1B",
    "zai-org/GLM-OCR",
    "PaddlePaddle/PaddleOCR-VL-1.5",
    "allenai/olmOCR-2-7B-1025",
    "datalab-to/chandra",
];

/// Look up a preset by key.
pub fn preset(key: &str) -> Option<&'static ProviderPreset> {
    PROVIDER_PRESETS.iter().find(|preset| preset.key == key)
}

/// Whether a provider's key can currently be found.
#[derive(Clone, Debug, Serialize)]
pub struct ProviderKeyStatus {
    pub provider: String,
    pub api_key_env: Option<String>,
    pub present: bool,
}

/// Looks up secrets by name: first the process environment, then a fallback
/// `.env`-style file.
#[derive(Clone, Debug)]
pub struct CredentialStore {
    fallback_file: PathBuf,
}

impl CredentialStore {
    pub fn new(fallback_file: impl Into<PathBuf>) -> Self {
        Self {
            fallback_file: fallback_file.into(),
        }
    }

    /// Find the value of `name`, if any. Blank values count as missing.
    pub fn lookup(&self, name: &str) -> Option<String> {
        if name.trim().is_empty() {
            return None;
        }
        if let Ok(value) = std::env::var(name) {
            if !value.trim().is_empty() {
                return Some(value);
            }
        }
        self.lookup_in_fallback_file(name)
    }

    fn lookup_in_fallback_file(&self, name: &str) -> Option<String> {
        let iter = match dotenvy::from_path_iter(&self.fallback_file) {
            Ok(iter) => iter,
            Err(err) => {
                trace!(path = %self.fallback_file.display(), %err, "No fallback env file");
                return None;
            }
        };
        for item in iter {
            match item {
                Ok((key, value)) if key == name && !value.trim().is_empty() => {
                    return Some(value);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(path = %self.fallback_file.display(), %err, "Could not parse fallback env file");
                    return None;
                }
            }
        }
        None
    }

    /// Resolve an API key from an explicit value or a variable name.
    pub fn resolve_api_key(
        &self,
        explicit: Option<&str>,
        api_key_env: Option<&str>,
    ) -> Result<String> {
        if let Some(key) = explicit.filter(|key| !key.is_empty()) {
            return Ok(key.to_owned());
        }
        if let Some(value) = api_key_env.and_then(|name| self.lookup(name)) {
            return Ok(value);
        }
        bail!(
            "Missing API key. Set inline key or environment variable: {}",
            api_key_env.unwrap_or("<unset>")
        )
    }

    /// Report whether the key for `provider` is available.
    pub fn key_status(&self, provider: &str, api_key_env: Option<&str>) -> ProviderKeyStatus {
        let resolved_env = api_key_env
            .map(str::to_owned)
            .or_else(|| preset(provider).map(|preset| preset.api_key_env.to_owned()));
        let present = resolved_env
            .as_deref()
            .is_some_and(|name| self.lookup(name).is_some());
        ProviderKeyStatus {
            provider: provider.to_owned(),
            api_key_env: resolved_env,
            present,
        }
    }
}
