// Language configuration for the sandbox backends
use anyhow::{bail, Context, Result};
use codeclass_common::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config/languages.json";

/// Which rlimit the process backend uses to cap memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryRlimit {
    /// RLIMIT_AS. Counts every mapping, including reserved-but-unused ones.
    #[default]
    AddressSpace,
    /// RLIMIT_DATA. Only writable private memory; for runtimes such as V8
    /// that reserve large virtual regions at startup.
    Data,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageExecution {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub file_extension: String,
    #[serde(default)]
    pub memory_rlimit: MemoryRlimit,
    /// Interpreter flag carrying the memory limit, e.g.
    /// `--max-old-space-size={heap_mb}`. `{heap_mb}` is three quarters of
    /// the run's memory limit, leaving room for the runtime itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_arg: Option<String>,
}

impl LanguageExecution {
    /// Arguments after the command: memory flag, configured args, then the source file.
    pub fn argv(&self, file: &str, memory_mb: u64) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 2);
        if let Some(flag) = &self.memory_arg {
            let heap_mb = (memory_mb * 3 / 4).max(16);
            argv.push(flag.replace("{heap_mb}", &heap_mb.to_string()));
        }
        argv.extend(self.args.iter().cloned());
        argv.push(file.to_string());
        argv
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    pub version: String,
    /// Container image used by the docker backend.
    pub image: String,
    pub execution: LanguageExecution,
    /// Per-language memory ceiling; a run gets the lower of this and its limits.
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LanguagesJson {
    pub languages: Vec<LanguageConfig>,
}

/// Enabled languages and how to launch each of them.
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<Language, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from a languages.json file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let languages_json: LanguagesJson =
            serde_json::from_str(&content).context("Failed to parse languages.json")?;

        Self::from_configs(languages_json.languages)
    }

    pub fn load_default() -> Result<Self> {
        Self::load(Path::new(DEFAULT_CONFIG_PATH))
    }

    /// Load the file if present, otherwise fall back to the built-in table.
    pub fn load_or_builtin(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            return Self::load(config_path);
        }
        warn!(
            path = %config_path.display(),
            "Language config not found, using built-in languages"
        );
        Ok(Self::builtin())
    }

    /// Entries must name a language from the allow-list; anything else is a
    /// configuration error rather than a silently ignored row.
    pub fn from_configs(configs: Vec<LanguageConfig>) -> Result<Self> {
        let mut map = HashMap::new();
        for config in configs {
            let language = Language::from_str(&config.name)
                .with_context(|| format!("Unsupported language in config: {}", config.name))?;
            if config.execution.command.trim().is_empty() {
                bail!("Language {} has no execution command", config.name);
            }
            if map.insert(language, config).is_some() {
                bail!("Language {} is configured twice", language);
            }
        }

        if map.is_empty() {
            bail!("No languages configured");
        }

        Ok(Self { configs: map })
    }

    pub fn builtin() -> Self {
        let configs = builtin_configs()
            .into_iter()
            .filter_map(|c| Language::from_str(&c.name).map(|lang| (lang, c)))
            .collect();
        Self { configs }
    }

    pub fn get_config(&self, language: &Language) -> Result<&LanguageConfig> {
        self.configs
            .get(language)
            .ok_or_else(|| anyhow::anyhow!("No configuration found for language: {}", language))
    }

    pub fn is_enabled(&self, language: Language) -> bool {
        self.configs.contains_key(&language)
    }

    pub fn get_image(&self, language: &Language) -> Result<String> {
        Ok(self.get_config(language)?.image.clone())
    }

    pub fn get_memory_limit_mb(&self, language: &Language) -> Result<u32> {
        Ok(self.get_config(language)?.memory_limit_mb)
    }

    pub fn get_cpu_limit(&self, language: &Language) -> Result<f32> {
        Ok(self.get_config(language)?.cpu_limit)
    }

    /// Enabled languages in a stable order
    pub fn list_languages(&self) -> Vec<Language> {
        Language::ALL
            .into_iter()
            .filter(|lang| self.configs.contains_key(lang))
            .collect()
    }
}

/// The table written by `codeclass init` and used when no file exists.
pub fn builtin_configs() -> Vec<LanguageConfig> {
    vec![
        LanguageConfig {
            name: "python".to_string(),
            version: "3.12".to_string(),
            image: "python:3.12-slim".to_string(),
            execution: LanguageExecution {
                command: "python3".to_string(),
                args: vec!["-I".to_string(), "-u".to_string()],
                file_extension: ".py".to_string(),
                memory_rlimit: MemoryRlimit::AddressSpace,
                memory_arg: None,
            },
            memory_limit_mb: 256,
            cpu_limit: 1.0,
        },
        LanguageConfig {
            name: "javascript".to_string(),
            version: "20".to_string(),
            image: "node:20-slim".to_string(),
            execution: LanguageExecution {
                command: "node".to_string(),
                args: Vec::new(),
                file_extension: ".js".to_string(),
                memory_rlimit: MemoryRlimit::Data,
                memory_arg: Some("--max-old-space-size={heap_mb}".to_string()),
            },
            memory_limit_mb: 512,
            cpu_limit: 1.0,
        },
    ]
}
