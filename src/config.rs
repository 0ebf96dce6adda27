use std::env;
use std::time::Duration;

const DEFAULT_PORT: &str = "5002";
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 1800;
const DEFAULT_ERROR_BACKOFF_SECS: u64 = 300;

const DEFAULT_AUTH_ENDPOINT: &str =
    "https://sis.anatolia.edu.gr/auth/realms/Anatolia/protocol/openid-connect/auth";
const AUTH_CLIENT_ID: &str = "athena-act-student-portal";
const AUTH_REDIRECT_URI: &str = "https://portal.student.act.edu/auth/openid/callback/index.html";
const DEFAULT_API_BASE: &str = "https://api.anatolia.edu.gr";

/// Portal login credentials, loaded once at startup and immutable afterwards.
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Skips study-profile auto-detection when set.
    pub profile_override: Option<String>,
}

impl Credentials {
    pub fn from_env() -> anyhow::Result<Self> {
        let username = require_var("PORTAL_USERNAME")?;
        let password = require_var("PORTAL_PASSWORD")?;
        let profile_override = env::var("STUDY_PROFILE_ID").ok().filter(|v| !v.is_empty());

        Ok(Self {
            username,
            password,
            profile_override,
        })
    }
}

fn require_var(name: &'static str) -> anyhow::Result<String> {
    env::var(name).map_err(|_| anyhow::anyhow!("{} must be set", name))
}

/// Upstream URL set. Defaults target the production portal; both parts can be
/// overridden via environment so tests can point the client elsewhere.
#[derive(Debug, Clone)]
pub struct PortalEndpoints {
    /// Full OpenID Connect authorization URL (implicit flow).
    pub auth_url: String,
    /// Base URL of the portal API, no trailing slash.
    pub api_base: String,
}

impl Default for PortalEndpoints {
    fn default() -> Self {
        Self {
            auth_url: default_auth_url(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }
}

impl PortalEndpoints {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            auth_url: env::var("PORTAL_AUTH_URL").unwrap_or(defaults.auth_url),
            api_base: env::var("PORTAL_API_BASE")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_base),
        }
    }

    pub fn me_url(&self) -> String {
        format!("{}/api/users/me/?$top=1&$skip=0&$count=false", self.api_base)
    }

    pub fn academic_review_url(&self, student_id: &str) -> String {
        format!(
            "{}/athena-conductor/rest/persons/students/{student_id}/academic-review",
            self.api_base
        )
    }

    pub fn periods_url(&self, study_profile_id: &str) -> String {
        format!(
            "{}/athena-conductor/rest/study-profiles/{study_profile_id}/periods",
            self.api_base
        )
    }

    pub fn progress_url(&self, period_id: &str) -> String {
        format!(
            "{}/athena-conductor/rest/study-profiles/periods/{period_id}/progress",
            self.api_base
        )
    }
}

fn default_auth_url() -> String {
    format!(
        "{DEFAULT_AUTH_ENDPOINT}?response_type=token&client_id={AUTH_CLIENT_ID}&redirect_uri={}",
        urlencoding::encode(AUTH_REDIRECT_URI)
    )
}

/// Cache tuning for the absence report.
#[derive(Debug, Clone, Copy)]
pub struct RefreshSettings {
    pub refresh_interval: Duration,
    pub error_backoff: Duration,
}

impl RefreshSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            refresh_interval: duration_var("REFRESH_INTERVAL", DEFAULT_REFRESH_INTERVAL_SECS)?,
            error_backoff: duration_var("ERROR_BACKOFF", DEFAULT_ERROR_BACKOFF_SECS)?,
        })
    }
}

fn duration_var(name: &'static str, default_secs: u64) -> anyhow::Result<Duration> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| anyhow::anyhow!("Invalid {} value '{}': {}. Expected seconds", name, raw, e)),
        Err(_) => Ok(Duration::from_secs(default_secs)),
    }
}

/// Parses the port number from environment variables.
/// Checks PORT first, then ABSENTIA_PORT, defaulting to 5002.
/// Returns an error if the port value is invalid.
pub fn parse_port() -> anyhow::Result<u16> {
    let port_str = env::var("PORT")
        .or_else(|_| env::var("ABSENTIA_PORT"))
        .unwrap_or_else(|_| DEFAULT_PORT.to_string());
    port_str.parse::<u16>().map_err(|e| {
        anyhow::anyhow!(
            "Invalid port value '{}': {}. Port must be a number between 1 and 65535",
            port_str,
            e
        )
    })
}
