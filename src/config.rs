use std::env;
use std::time::Duration;

/// Runtime configuration, loaded from `AL_`-prefixed environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the gRPC server binds to.
    pub grpc_listen: String,
    /// Valkey/Redis connection URL backing the session registry.
    pub valkey_url: String,
    /// Namespace new Sandbox/Claim/Pool objects are created in.
    pub sandbox_namespace: String,
    /// Namespace the gateway's own identity secret lives in.
    pub gateway_namespace: String,
    /// Path the resolved private signing key is written to (owner-only perms).
    pub signing_key_path: String,
    /// Issuer claim embedded in and checked on every token.
    pub issuer: String,
    /// Audience claim embedded in and checked on every token.
    pub audience: String,
    /// Token lifetime.
    pub token_ttl: Duration,
    /// Clock skew tolerance applied to `nbf`/`iat`/`exp` checks.
    pub clock_skew: Duration,
    /// Key id embedded in the JWT header.
    pub kid: String,
    /// Default `AgentRuntime` referenced when a Session omits `runtimeRef`.
    pub default_runtime_name: Option<String>,
    pub default_runtime_namespace: Option<String>,
    /// Whether warm-pool provisioning is enabled cluster-wide.
    pub warm_pool_enabled: bool,
    /// Default provisioning mode when a Session omits one.
    pub default_mode: String,
    pub pool_ref: Option<String>,
    pub profile: String,
    /// Default image-pull policy for cold-started pods.
    pub image_pull_policy: String,
    /// Port the in-pod interpreter listens on; combined with `podIP` to form
    /// the endpoint returned to RPC callers.
    pub interpreter_port: u16,
    pub max_session_duration: Duration,
    pub max_idle_duration: Duration,
    pub gc_interval: Duration,
}

impl Config {
    pub fn load() -> Self {
        Self {
            grpc_listen: env_or("AL_GRPC_LISTEN", "0.0.0.0:7443"),
            valkey_url: env_or("AL_VALKEY_URL", "redis://localhost:6379"),
            sandbox_namespace: env_or("AL_SANDBOX_NAMESPACE", "agentland-sandboxes"),
            gateway_namespace: env_or("AL_GATEWAY_NAMESPACE", "agentland-system"),
            signing_key_path: env_or("AL_SIGNING_KEY_PATH", "/var/run/agentland/private.pem"),
            issuer: env_or("AL_ISSUER", "agentland-gateway"),
            audience: env_or("AL_AUDIENCE", "agentland-sandbox"),
            token_ttl: Duration::from_secs(env_secs("AL_TOKEN_TTL_SECS", 300)),
            clock_skew: Duration::from_secs(env_secs("AL_CLOCK_SKEW_SECS", 30)),
            kid: env_or("AL_KID", "agentland-1"),
            default_runtime_name: env::var("AL_DEFAULT_RUNTIME_NAME").ok(),
            default_runtime_namespace: env::var("AL_DEFAULT_RUNTIME_NAMESPACE").ok(),
            warm_pool_enabled: env_bool("AL_WARM_POOL_ENABLED", true),
            default_mode: env_or("AL_DEFAULT_MODE", "Direct"),
            pool_ref: env::var("AL_POOL_REF").ok(),
            profile: env_or("AL_PROFILE", "default"),
            image_pull_policy: env_or("AL_IMAGE_PULL_POLICY", "Always"),
            interpreter_port: env_secs("AL_INTERPRETER_PORT", 1883) as u16,
            max_session_duration: Duration::from_secs(env_secs("AL_MAX_SESSION_DURATION_SECS", 3600)),
            max_idle_duration: Duration::from_secs(env_secs("AL_MAX_IDLE_DURATION_SECS", 900)),
            gc_interval: Duration::from_secs(env_secs("AL_GC_INTERVAL_SECS", 30)),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_secs(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_unset() {
        for key in ["AL_GRPC_LISTEN", "AL_TOKEN_TTL_SECS", "AL_WARM_POOL_ENABLED"] {
            unsafe { env::remove_var(key) };
        }
        let cfg = Config::load();
        assert_eq!(cfg.grpc_listen, "0.0.0.0:7443");
        assert_eq!(cfg.token_ttl, Duration::from_secs(300));
        assert!(cfg.warm_pool_enabled);
    }

    #[test]
    fn env_bool_parses_false() {
        unsafe { env::set_var("AL_TEST_BOOL_FLAG", "false") };
        assert!(!env_bool("AL_TEST_BOOL_FLAG", true));
        unsafe { env::remove_var("AL_TEST_BOOL_FLAG") };
    }

    #[test]
    fn env_secs_falls_back_on_garbage() {
        unsafe { env::set_var("AL_TEST_SECS", "not-a-number") };
        assert_eq!(env_secs("AL_TEST_SECS", 42), 42);
        unsafe { env::remove_var("AL_TEST_SECS") };
    }
}
