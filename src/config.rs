//! Runtime configuration for the packaging server.

use std::path::PathBuf;
use std::time::Duration;

/// External tool commands, overridable per deployment.
#[derive(Debug, Clone)]
pub struct ToolCommands {
    /// TWA project generator (bubblewrap-compatible CLI).
    pub generator: String,
    /// Java keytool used for keystore creation.
    pub keytool: String,
    /// Gradle wrapper invoked inside the generated project.
    pub gradle: String,
    /// APK signing tool.
    pub apksigner: String,
}

impl Default for ToolCommands {
    fn default() -> Self {
        Self {
            generator: "bubblewrap".to_string(),
            keytool: "keytool".to_string(),
            gradle: "./gradlew".to_string(),
            apksigner: "apksigner".to_string(),
        }
    }
}

impl ToolCommands {
    /// Apply `*_CMD` environment overrides, following the same convention
    /// the rest of the toolchain integration uses.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            generator: std::env::var("BUBBLEWRAP_CMD").unwrap_or(defaults.generator),
            keytool: std::env::var("KEYTOOL_CMD").unwrap_or(defaults.keytool),
            gradle: std::env::var("GRADLE_CMD").unwrap_or(defaults.gradle),
            apksigner: std::env::var("APKSIGNER_CMD").unwrap_or(defaults.apksigner),
        }
    }
}

/// Configuration for the packaging server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Relaxes https-only validation and the SSRF gate, and enables
    /// permissive CORS. Never enable outside local development.
    pub dev_mode: bool,
    /// Admission cap: builds beyond this are rejected, not queued.
    pub max_concurrent: usize,
    /// Unclaimed jobs and their working directories are deleted after this.
    pub job_ttl: Duration,
    /// Deadline for each outbound manifest/icon fetch.
    pub fetch_timeout: Duration,
    /// Parent directory for per-job working directories.
    pub work_root: PathBuf,
    pub tools: ToolCommands,
    /// Externally supplied token secret; a random one is generated when
    /// absent (tokens reset on restart).
    pub token_secret: Option<Vec<u8>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            dev_mode: false,
            max_concurrent: 3,
            job_ttl: Duration::from_secs(10 * 60),
            fetch_timeout: Duration::from_secs(15),
            work_root: std::env::temp_dir().join("pwapack"),
            tools: ToolCommands::default(),
            token_secret: None,
        }
    }
}

impl ServerConfig {
    /// Default configuration plus environment overrides for tool commands
    /// and the token secret.
    pub fn from_env() -> Self {
        Self {
            tools: ToolCommands::from_env(),
            token_secret: std::env::var("PWAPACK_TOKEN_SECRET")
                .ok()
                .map(|s| s.into_bytes()),
            ..Self::default()
        }
    }
}
