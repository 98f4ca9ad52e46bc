//! Default configuration values

/// Cache root used when neither the file nor the environment names one
pub const DEFAULT_CACHE_DIR: &str = "/tmp/model-serve";

/// Default cache budget in decimal gigabytes
pub const DEFAULT_CACHE_MAX_GB: f64 = 50.0;

/// Default model hub endpoint
pub const DEFAULT_HUB_ENDPOINT: &str = "https://huggingface.co";

/// Default idle timeout for HTTP responses and body reads
pub const DEFAULT_HTTP_READ_TIMEOUT_SECS: u64 = 300;

/// Default connect timeout for HTTP downloads
pub const DEFAULT_HTTP_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default number of shard URLs downloaded at once
pub const DEFAULT_MAX_PARALLEL_SHARDS: usize = 4;

/// Default user agent for outbound requests
pub const DEFAULT_USER_AGENT: &str = concat!("model-serve/", env!("CARGO_PKG_VERSION"));

/// Default log level
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Device preference applied when a model does not name one
pub const DEFAULT_DEVICE_PREFERENCE: &str = "auto";

// Environment variable names
pub const ENV_DEPLOY_CONFIG: &str = "MODEL_SERVE_DEPLOY_CONFIG";
pub const ENV_CACHE_DIR: &str = "MODEL_SERVE_CACHE_DIR";
pub const ENV_CACHE_MAX_GB: &str = "MODEL_SERVE_CACHE_MAX_GB";
pub const ENV_LOG_LEVEL: &str = "MODEL_SERVE_LOG_LEVEL";
pub const ENV_HUB_TOKEN: &str = "HF_TOKEN";
pub const ENV_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const ENV_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const ENV_REGION: &str = "AWS_REGION";
