//! Process-environment configuration, ambient to the pipeline core (not a
//! pipeline stage). Grounded on the environment-driven config pattern used
//! across the example pack (`dotenvy::dotenv().ok()` followed by typed
//! `std::env::var` reads with documented defaults) rather than a dedicated
//! config crate — none of the five example repos pulls one in for a flat,
//! dozen-key settings surface like this.

use std::env;
use std::time::Duration;

/// Settings read once at process startup. Spec §6 "Configuration
/// environment": state-store endpoint, LLM provider endpoint, pipeline
/// timeout (recommend 1800s), validation-failure ceiling (recommend 3),
/// lock lease duration (recommend 60s).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub redis_url: String,
    pub llm_endpoint: String,
    pub pipeline_timeout: Duration,
    pub validation_failure_ceiling: u32,
    pub lock_lease: Duration,
}

impl PipelineConfig {
    /// Load configuration from the process environment, calling
    /// `dotenvy::dotenv()` first so a local `.env` file can supply values in
    /// development. Missing variables fall back to the spec's recommended
    /// defaults; malformed numeric variables are reported as
    /// [`PipelineError::InvalidConfig`](crate::error::PipelineError::InvalidConfig).
    pub fn from_env() -> crate::error::Result<Self> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            redis_url: env::var("PIPELINE_REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            llm_endpoint: env::var("PIPELINE_LLM_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:11434".to_string()),
            pipeline_timeout: Duration::from_secs(parse_env_u64(
                "PIPELINE_TIMEOUT_SECS",
                1800,
            )?),
            validation_failure_ceiling: parse_env_u32("PIPELINE_VALIDATION_CEILING", 3)?,
            lock_lease: Duration::from_millis(parse_env_u64("PIPELINE_LOCK_LEASE_MS", 60_000)?),
        })
    }
}

fn parse_env_u64(name: &str, default: u64) -> crate::error::Result<u64> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|_| crate::error::PipelineError::InvalidConfig(format!("{name} must be a positive integer, got '{raw}'"))),
    }
}

fn parse_env_u32(name: &str, default: u32) -> crate::error::Result<u32> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|_| crate::error::PipelineError::InvalidConfig(format!("{name} must be a positive integer, got '{raw}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_u64_default_when_absent() {
        // Use a name extremely unlikely to be set in the test environment.
        let v = parse_env_u64("PIPELINE_TEST_NONEXISTENT_KEY_U64", 42).unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn test_parse_env_u32_rejects_garbage() {
        std::env::set_var("PIPELINE_TEST_GARBAGE_U32", "not-a-number");
        let result = parse_env_u32("PIPELINE_TEST_GARBAGE_U32", 3);
        assert!(result.is_err());
        std::env::remove_var("PIPELINE_TEST_GARBAGE_U32");
    }
}
