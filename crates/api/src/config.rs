use std::time::Duration;

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development; override via
/// environment in production. Invalid values are fatal at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `8095`).
    pub port: u16,
    /// Allowed CORS origins, from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `180` -- the legacy
    /// generate adapters block on job completion).
    pub request_timeout_secs: u64,
    /// Path to the modes document (default: `conf/modes.yaml`).
    pub modes_config: String,
    /// Path to the workflows document (default: `conf/workflows.yaml`).
    pub workflows_config: String,
    /// Queue backlog limit (default: `64`).
    pub queue_max: usize,
    /// Per-job watchdog in seconds (default: `600`).
    pub job_timeout_secs: u64,
    /// Deadline for blocking HTTP generate adapters in seconds
    /// (default: `120`).
    pub request_deadline_secs: u64,
    /// ComfyUI WebSocket URL (default: `ws://127.0.0.1:8188`).
    pub comfy_ws_url: String,
    /// ComfyUI HTTP URL (default: `http://127.0.0.1:8188`).
    pub comfy_api_url: String,
    /// Optional OTLP collector the `telemetry:otlp` envelope forwards to.
    pub otel_proxy_endpoint: Option<String>,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                 | Default                  |
    /// |-------------------------|--------------------------|
    /// | `HOST`                  | `0.0.0.0`                |
    /// | `PORT`                  | `8095`                   |
    /// | `CORS_ORIGINS`          | `http://localhost:5173`  |
    /// | `REQUEST_TIMEOUT_SECS`  | `180`                    |
    /// | `MODES_CONFIG`          | `conf/modes.yaml`        |
    /// | `WORKFLOWS_CONFIG`      | `conf/workflows.yaml`    |
    /// | `QUEUE_MAX`             | `64`                     |
    /// | `JOB_TIMEOUT_SECS`      | `600`                    |
    /// | `REQUEST_DEADLINE_SECS` | `120`                    |
    /// | `COMFY_WS_URL`          | `ws://127.0.0.1:8188`    |
    /// | `COMFY_API_URL`         | `http://127.0.0.1:8188`  |
    /// | `OTEL_PROXY_ENDPOINT`   | unset                    |
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "8095".into())
            .parse()
            .expect("PORT must be a valid u16");

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs: u64 = std::env::var("REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "180".into())
            .parse()
            .expect("REQUEST_TIMEOUT_SECS must be a valid u64");

        let modes_config =
            std::env::var("MODES_CONFIG").unwrap_or_else(|_| "conf/modes.yaml".into());
        let workflows_config =
            std::env::var("WORKFLOWS_CONFIG").unwrap_or_else(|_| "conf/workflows.yaml".into());

        let queue_max: usize = std::env::var("QUEUE_MAX")
            .unwrap_or_else(|_| "64".into())
            .parse()
            .expect("QUEUE_MAX must be a valid usize");

        let job_timeout_secs: u64 = std::env::var("JOB_TIMEOUT_SECS")
            .unwrap_or_else(|_| "600".into())
            .parse()
            .expect("JOB_TIMEOUT_SECS must be a valid u64");

        let request_deadline_secs: u64 = std::env::var("REQUEST_DEADLINE_SECS")
            .unwrap_or_else(|_| "120".into())
            .parse()
            .expect("REQUEST_DEADLINE_SECS must be a valid u64");

        let comfy_ws_url =
            std::env::var("COMFY_WS_URL").unwrap_or_else(|_| "ws://127.0.0.1:8188".into());
        let comfy_api_url =
            std::env::var("COMFY_API_URL").unwrap_or_else(|_| "http://127.0.0.1:8188".into());

        let otel_proxy_endpoint = std::env::var("OTEL_PROXY_ENDPOINT")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            modes_config,
            workflows_config,
            queue_max,
            job_timeout_secs,
            request_deadline_secs,
            comfy_ws_url,
            comfy_api_url,
            otel_proxy_endpoint,
        }
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_secs)
    }
}
