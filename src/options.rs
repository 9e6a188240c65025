//! Build options and request validation.

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::ValidationError;

static PACKAGE_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9_]*(\.[a-z][a-z0-9_]*){2,}$").expect("valid regex")
});

static HEX_COLOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#[0-9a-fA-F]{6}$").expect("valid regex"));

/// TWA display mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisplayMode {
    Standalone,
    Fullscreen,
    MinimalUi,
}

impl DisplayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayMode::Standalone => "standalone",
            DisplayMode::Fullscreen => "fullscreen",
            DisplayMode::MinimalUi => "minimal-ui",
        }
    }
}

impl FromStr for DisplayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standalone" => Ok(DisplayMode::Standalone),
            "fullscreen" => Ok(DisplayMode::Fullscreen),
            "minimal-ui" => Ok(DisplayMode::MinimalUi),
            other => Err(format!("unknown display mode '{}'", other)),
        }
    }
}

/// Screen orientation lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Portrait,
    Landscape,
    Default,
}

impl Orientation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Orientation::Portrait => "portrait",
            Orientation::Landscape => "landscape",
            Orientation::Default => "default",
        }
    }
}

impl FromStr for Orientation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "portrait" => Ok(Orientation::Portrait),
            "landscape" => Ok(Orientation::Landscape),
            "default" => Ok(Orientation::Default),
            other => Err(format!("unknown orientation '{}'", other)),
        }
    }
}

/// Validated packaging intent for one build. Immutable once a job owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildOptions {
    pub url: String,
    pub name: String,
    pub short_name: String,
    pub package_id: String,
    pub display: DisplayMode,
    pub orientation: Orientation,
    pub theme_color: String,
    pub background_color: String,
    pub icon_url: String,
    pub maskable_icon_url: Option<String>,
}

/// Raw build submission from the UI. Field types are loose on purpose;
/// `validate` turns it into [`BuildOptions`] or a field-level error.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildRequest {
    pub url: String,
    pub name: String,
    pub short_name: String,
    pub package_id: String,
    pub display: String,
    pub orientation: String,
    pub theme_color: String,
    pub background_color: String,
    pub icon_url: String,
    #[serde(default)]
    pub maskable_icon_url: Option<String>,
    pub token: String,
}

impl BuildRequest {
    /// Validate every field. Outside dev mode the source URL must be https.
    pub fn validate(&self, dev_mode: bool) -> Result<BuildOptions, ValidationError> {
        let url = parse_web_url("url", &self.url, dev_mode)?;

        let name = strip_unsafe(&self.name);
        if name.is_empty() || name.chars().count() > 50 {
            return Err(ValidationError::new("name", "must be 1-50 characters"));
        }

        let short_name = strip_unsafe(&self.short_name);
        if short_name.is_empty() || short_name.chars().count() > 12 {
            return Err(ValidationError::new("short_name", "must be 1-12 characters"));
        }

        if !PACKAGE_ID_RE.is_match(&self.package_id) {
            return Err(ValidationError::new(
                "package_id",
                "must be a reverse-domain identifier like com.example.app",
            ));
        }

        for (field, value) in [
            ("theme_color", &self.theme_color),
            ("background_color", &self.background_color),
        ] {
            if !HEX_COLOR_RE.is_match(value) {
                return Err(ValidationError::new(field, "must be a #rrggbb color"));
            }
        }

        let display = DisplayMode::from_str(&self.display)
            .map_err(|e| ValidationError::new("display", e))?;
        let orientation = Orientation::from_str(&self.orientation)
            .map_err(|e| ValidationError::new("orientation", e))?;

        let icon_url = parse_web_url("icon_url", &self.icon_url, dev_mode)?;
        let maskable_icon_url = match &self.maskable_icon_url {
            Some(raw) if !raw.trim().is_empty() => {
                Some(parse_web_url("maskable_icon_url", raw, dev_mode)?.to_string())
            }
            _ => None,
        };

        Ok(BuildOptions {
            url: url.to_string(),
            name,
            short_name,
            package_id: self.package_id.clone(),
            display,
            orientation,
            theme_color: self.theme_color.clone(),
            background_color: self.background_color.clone(),
            icon_url: icon_url.to_string(),
            maskable_icon_url,
        })
    }
}

fn parse_web_url(field: &'static str, raw: &str, dev_mode: bool) -> Result<Url, ValidationError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| ValidationError::new(field, format!("not a valid URL: {}", e)))?;
    match url.scheme() {
        "https" => Ok(url),
        "http" if dev_mode => Ok(url),
        other => Err(ValidationError::new(
            field,
            format!("scheme '{}' is not allowed; use https", other),
        )),
    }
}

/// Strip control and markup characters, then trim surrounding whitespace.
fn strip_unsafe(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '<' | '>' | '&' | '"' | '\''))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Derive a download file name from the app name: anything outside
/// `[A-Za-z0-9_-]` is dropped.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        "app".to_string()
    } else {
        cleaned
    }
}
