// Environment-driven settings shared by the API and the worker

use crate::types::ExecutionLimits;

#[derive(Debug, Clone)]
pub struct Settings {
    pub redis_url: String,
    pub result_ttl_seconds: u64,
    /// Operator ceiling; requested limits are clamped to it.
    pub limits: ExecutionLimits,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup (env in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = ExecutionLimits::default();
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };

        Self {
            redis_url: lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            result_ttl_seconds: number("RESULT_TTL_SECONDS", 86_400),
            limits: ExecutionLimits {
                cpu_ms: number("LIMIT_CPU_MS", defaults.cpu_ms),
                wall_ms: number("LIMIT_WALL_MS", defaults.wall_ms),
                memory_mb: number("LIMIT_MEMORY_MB", defaults.memory_mb),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_and_overrides() {
        let env: HashMap<&str, &str> = [("LIMIT_WALL_MS", "8000"), ("LIMIT_CPU_MS", "nope")]
            .into_iter()
            .collect();
        let settings = Settings::from_lookup(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(settings.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(settings.result_ttl_seconds, 86_400);
        assert_eq!(settings.limits.wall_ms, 8000);
        assert_eq!(settings.limits.cpu_ms, ExecutionLimits::default().cpu_ms);
    }
}
