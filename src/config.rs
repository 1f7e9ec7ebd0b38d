use std::env;
use std::time::Duration;

use anyhow::Result;

/// Rotation settings for the span export sink.
#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

/// Immutable configuration collected once at process start and passed
/// explicitly into constructors. Handlers never read the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Gate on bearer-token verification. When false every request passes
    /// AUTH with an anonymous identity.
    pub jwt_validation_enabled: bool,
    pub entra_issuer: Option<String>,
    pub entra_audience: Option<String>,
    /// Completion backend base URL. Absent => COMPLETE fails as a
    /// configuration error.
    pub openai_endpoint: Option<String>,
    pub openai_deployment: String,
    pub search_endpoint: Option<String>,
    pub search_index: Option<String>,
    /// Global RAG switch; a request additionally opts in per call.
    pub rag_enabled: bool,
    pub search_top_k: usize,
    /// Fixed sampling parameters, never derived from input.
    pub completion_temperature: f32,
    pub completion_max_tokens: u32,
    /// Bound applied to every outbound call (JWKS, search, completion).
    pub upstream_timeout: Duration,
    pub jwks_cache_ttl: Duration,
    /// Span export sink path. Absent => spans are built but export is a
    /// no-op.
    pub trace_export_file: Option<String>,
    pub rotation: RotationConfig,
    /// Deterministic safety term list. Empty => everything is safe.
    pub safety_blocklist: Vec<String>,
    /// Maximum accepted raw request body size in bytes (None => unlimited)
    pub max_request_bytes: Option<usize>,
    pub port: u16,
}

impl AppConfig {
    /// Read configuration from the environment. Invalid boolean or numeric
    /// values degrade to the documented default with a warning; startup
    /// never fails on a malformed flag.
    pub fn from_env() -> Result<Self> {
        let jwt_validation_enabled = parse_bool_or("JWT_VALIDATION_ENABLED", true);
        let rag_enabled = parse_bool_or("RAG_ENABLED", false);

        let rotation = RotationConfig {
            max_bytes: parse_u64_opt("TRACE_MAX_BYTES"),
            keep: parse_u64_or("TRACE_ROTATE_KEEP", 1) as usize,
            compress: parse_bool_or("TRACE_ROTATE_COMPRESS", false),
        };

        let safety_blocklist = env::var("SAFETY_BLOCKLIST")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        Ok(Self {
            jwt_validation_enabled,
            entra_issuer: non_empty_var("ENTRA_ISSUER"),
            entra_audience: non_empty_var("ENTRA_AUDIENCE"),
            openai_endpoint: non_empty_var("OPENAI_ENDPOINT"),
            openai_deployment: non_empty_var("OPENAI_DEPLOYMENT")
                .unwrap_or_else(|| "gpt-4".to_string()),
            search_endpoint: non_empty_var("SEARCH_ENDPOINT"),
            search_index: non_empty_var("SEARCH_INDEX"),
            rag_enabled,
            search_top_k: parse_u64_or("AZURE_SEARCH_TOP_K", 3).max(1) as usize,
            completion_temperature: parse_f32_or("COMPLETION_TEMPERATURE", 0.7),
            completion_max_tokens: parse_u32_or("COMPLETION_MAX_TOKENS", 800),
            upstream_timeout: Duration::from_millis(parse_u64_or("UPSTREAM_TIMEOUT_MS", 10_000)),
            jwks_cache_ttl: Duration::from_secs(parse_u64_or("JWKS_CACHE_TTL_SECS", 300)),
            trace_export_file: non_empty_var("TRACE_EXPORT_FILE"),
            rotation,
            safety_blocklist,
            max_request_bytes: parse_u64_opt("GATEWAY_MAX_REQUEST_BYTES").map(|v| v as usize),
            port: parse_u16_or("PORT", 8080),
        })
    }
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_u64_opt(var: &str) -> Option<u64> {
    let raw = non_empty_var(var)?;
    match raw.parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var, value = %raw, "ignoring non-numeric value");
            None
        }
    }
}

fn parse_u64_or(var: &str, default: u64) -> u64 {
    match non_empty_var(var) {
        Some(raw) => raw.parse::<u64>().unwrap_or_else(|_| {
            tracing::warn!(var, value = %raw, default, "invalid number, using default");
            default
        }),
        None => default,
    }
}

fn parse_u32_or(var: &str, default: u32) -> u32 {
    let value = parse_u64_or(var, u64::from(default));
    u32::try_from(value).unwrap_or_else(|_| {
        tracing::warn!(var, value, default, "value out of range, using default");
        default
    })
}

fn parse_u16_or(var: &str, default: u16) -> u16 {
    let value = parse_u64_or(var, u64::from(default));
    u16::try_from(value).unwrap_or_else(|_| {
        tracing::warn!(var, value, default, "value out of range, using default");
        default
    })
}

fn parse_f32_or(var: &str, default: f32) -> f32 {
    match non_empty_var(var) {
        Some(raw) => raw.parse::<f32>().unwrap_or_else(|_| {
            tracing::warn!(var, value = %raw, default, "invalid number, using default");
            default
        }),
        None => default,
    }
}

fn parse_bool_or(var: &str, default: bool) -> bool {
    match non_empty_var(var) {
        Some(raw) => match parse_bool(&raw) {
            Some(v) => v,
            None => {
                tracing::warn!(var, value = %raw, default, "invalid boolean, using default");
                default
            }
        },
        None => default,
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;

    static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    const ALL_VARS: &[&str] = &[
        "JWT_VALIDATION_ENABLED",
        "ENTRA_ISSUER",
        "ENTRA_AUDIENCE",
        "OPENAI_ENDPOINT",
        "OPENAI_DEPLOYMENT",
        "SEARCH_ENDPOINT",
        "SEARCH_INDEX",
        "RAG_ENABLED",
        "AZURE_SEARCH_TOP_K",
        "COMPLETION_TEMPERATURE",
        "COMPLETION_MAX_TOKENS",
        "UPSTREAM_TIMEOUT_MS",
        "JWKS_CACHE_TTL_SECS",
        "TRACE_EXPORT_FILE",
        "TRACE_MAX_BYTES",
        "TRACE_ROTATE_KEEP",
        "TRACE_ROTATE_COMPRESS",
        "SAFETY_BLOCKLIST",
        "GATEWAY_MAX_REQUEST_BYTES",
        "PORT",
    ];

    fn clear_env() {
        for var in ALL_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn parses_environment_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        let cfg = AppConfig::from_env().unwrap();
        assert!(cfg.jwt_validation_enabled);
        assert!(!cfg.rag_enabled);
        assert_eq!(cfg.search_top_k, 3);
        assert_eq!(cfg.openai_deployment, "gpt-4");
        assert_eq!(cfg.completion_max_tokens, 800);
        assert_eq!(cfg.upstream_timeout, Duration::from_millis(10_000));
        assert!(cfg.trace_export_file.is_none());
        assert_eq!(cfg.rotation.keep, 1);
        assert!(cfg.safety_blocklist.is_empty());
        assert_eq!(cfg.port, 8080);
    }

    #[test]
    fn parses_full_configuration() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        std::env::set_var("JWT_VALIDATION_ENABLED", "false");
        std::env::set_var("ENTRA_ISSUER", "https://login.example.com/tenant/v2.0");
        std::env::set_var("ENTRA_AUDIENCE", "api://promptgate");
        std::env::set_var("OPENAI_ENDPOINT", "https://aoai.example.com");
        std::env::set_var("OPENAI_DEPLOYMENT", "gpt-4o");
        std::env::set_var("SEARCH_ENDPOINT", "https://search.example.com");
        std::env::set_var("SEARCH_INDEX", "documents");
        std::env::set_var("RAG_ENABLED", "true");
        std::env::set_var("AZURE_SEARCH_TOP_K", "5");
        std::env::set_var("COMPLETION_TEMPERATURE", "0.2");
        std::env::set_var("COMPLETION_MAX_TOKENS", "256");
        std::env::set_var("UPSTREAM_TIMEOUT_MS", "2500");
        std::env::set_var("TRACE_EXPORT_FILE", "/tmp/spans.log");
        std::env::set_var("TRACE_MAX_BYTES", "1024");
        std::env::set_var("TRACE_ROTATE_KEEP", "5");
        std::env::set_var("TRACE_ROTATE_COMPRESS", "true");
        std::env::set_var("SAFETY_BLOCKLIST", "Foo, bar ,,");
        std::env::set_var("GATEWAY_MAX_REQUEST_BYTES", "2048");

        let cfg = AppConfig::from_env().unwrap();
        assert!(!cfg.jwt_validation_enabled);
        assert_eq!(
            cfg.entra_issuer.as_deref(),
            Some("https://login.example.com/tenant/v2.0")
        );
        assert_eq!(cfg.entra_audience.as_deref(), Some("api://promptgate"));
        assert_eq!(cfg.openai_deployment, "gpt-4o");
        assert!(cfg.rag_enabled);
        assert_eq!(cfg.search_top_k, 5);
        assert_eq!(cfg.completion_max_tokens, 256);
        assert_eq!(cfg.upstream_timeout, Duration::from_millis(2500));
        assert_eq!(cfg.trace_export_file.as_deref(), Some("/tmp/spans.log"));
        assert_eq!(cfg.rotation.max_bytes, Some(1024));
        assert_eq!(cfg.rotation.keep, 5);
        assert!(cfg.rotation.compress);
        assert_eq!(cfg.safety_blocklist, vec!["foo", "bar"]);
        assert_eq!(cfg.max_request_bytes, Some(2048));

        clear_env();
    }

    #[test]
    fn out_of_range_numbers_degrade_to_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        // Parse as u64 fine but overflow the target types.
        std::env::set_var("COMPLETION_MAX_TOKENS", "5000000000");
        std::env::set_var("PORT", "70000");

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.completion_max_tokens, 800);
        assert_eq!(cfg.port, 8080);

        clear_env();
    }

    #[test]
    fn invalid_enable_flags_degrade_to_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        std::env::set_var("JWT_VALIDATION_ENABLED", "definitely");
        std::env::set_var("RAG_ENABLED", "7");
        std::env::set_var("AZURE_SEARCH_TOP_K", "not-a-number");

        let cfg = AppConfig::from_env().unwrap();
        assert!(cfg.jwt_validation_enabled, "degrades to default true");
        assert!(!cfg.rag_enabled, "degrades to default false");
        assert_eq!(cfg.search_top_k, 3);

        clear_env();
    }
}
