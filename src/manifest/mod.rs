//! PWA manifest resolution and option derivation.
//!
//! Given a user-supplied URL this module finds the web app manifest (either
//! directly or via the page's `<link rel="manifest">` tag), and derives
//! default packaging options from it so the UI can prefill the build form.

pub mod icons;

use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::errors::FetchError;
use crate::fetch::guarded_get;
use crate::manifest::icons::{Icon, select_best_icon, select_maskable_icon};
use crate::options::{DisplayMode, Orientation};

/// Placeholder when the manifest carries no usable name.
const DEFAULT_NAME: &str = "My PWA App";

static LINK_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<link\b[^>]*>").expect("valid regex"));

static REL_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)\brel\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).expect("valid regex")
});

static HREF_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)\bhref\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).expect("valid regex")
});

/// Packaging defaults derived from a manifest, returned to the UI as
/// form-prefill values.
#[derive(Debug, Clone, Serialize)]
pub struct DerivedOptions {
    pub name: String,
    pub short_name: String,
    pub package_id: String,
    pub display: DisplayMode,
    pub orientation: Orientation,
    pub theme_color: String,
    pub background_color: String,
    pub icon_url: Option<String>,
    pub maskable_icon_url: Option<String>,
}

/// Fetch a PWA manifest from `raw_url`, which may point at the manifest
/// itself or at an HTML page that links to one. Returns the parsed manifest
/// and the URL it was finally loaded from (the base for icon resolution).
pub async fn fetch_manifest(
    client: &reqwest::Client,
    raw_url: &str,
    timeout: Duration,
    allow_private: bool,
) -> Result<(Value, Url), FetchError> {
    let url = Url::parse(raw_url.trim())?;

    if looks_like_manifest_url(&url) {
        return fetch_json(client, url, timeout, allow_private).await;
    }

    let response = guarded_get(client, url, timeout, allow_private).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::FetchFailed {
            status: status.as_u16(),
        });
    }
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    // After redirects, hrefs resolve against where the page actually lives.
    let final_url = response.url().clone();
    let body = response.text().await?;

    // Some servers hand the manifest back directly even for extensionless
    // paths; trust the content type over the URL shape.
    if content_type.contains("json") || content_type.contains("manifest") {
        return Ok((parse_manifest(&body)?, final_url));
    }

    let href = find_manifest_link(&body).ok_or(FetchError::ManifestLinkNotFound)?;
    let manifest_url = final_url.join(&href)?;
    fetch_json(client, manifest_url, timeout, allow_private).await
}

async fn fetch_json(
    client: &reqwest::Client,
    url: Url,
    timeout: Duration,
    allow_private: bool,
) -> Result<(Value, Url), FetchError> {
    let response = guarded_get(client, url, timeout, allow_private).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::FetchFailed {
            status: status.as_u16(),
        });
    }
    let final_url = response.url().clone();
    Ok((parse_manifest(&response.text().await?)?, final_url))
}

fn parse_manifest(body: &str) -> Result<Value, FetchError> {
    let value: Value = serde_json::from_str(body).map_err(|_| FetchError::InvalidManifest)?;
    if !value.is_object() {
        return Err(FetchError::InvalidManifest);
    }
    Ok(value)
}

/// Heuristic for URLs that point at a manifest rather than a page.
fn looks_like_manifest_url(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    path.ends_with(".json") || path.contains("/manifest")
}

/// Find the href of a `<link rel="manifest">` tag. Attribute order within
/// the tag does not matter.
pub fn find_manifest_link(html: &str) -> Option<String> {
    for tag in LINK_TAG_RE.find_iter(html) {
        let tag = tag.as_str();
        let Some(rel) = first_capture(&REL_ATTR_RE, tag) else {
            continue;
        };
        if !rel
            .split_whitespace()
            .any(|token| token.eq_ignore_ascii_case("manifest"))
        {
            continue;
        }
        if let Some(href) = first_capture(&HREF_ATTR_RE, tag) {
            return Some(href);
        }
    }
    None
}

fn first_capture(re: &Regex, tag: &str) -> Option<String> {
    let caps = re.captures(tag)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))
        .map(|m| m.as_str().to_string())
}

/// Map manifest fields onto packaging defaults, normalizing anything
/// unusable to a safe fallback rather than failing.
pub fn derive_options(manifest: &Value, manifest_url: &Url) -> DerivedOptions {
    let name = manifest
        .get("name")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .or_else(|| {
            manifest
                .get("short_name")
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
        })
        .unwrap_or(DEFAULT_NAME)
        .trim()
        .to_string();

    let short_name = manifest
        .get("short_name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| name.chars().take(12).collect());

    let display = manifest
        .get("display")
        .and_then(Value::as_str)
        .and_then(|s| DisplayMode::from_str(s).ok())
        .unwrap_or(DisplayMode::Standalone);

    let orientation = manifest
        .get("orientation")
        .and_then(Value::as_str)
        .and_then(|s| Orientation::from_str(s).ok())
        .unwrap_or(Orientation::Default);

    let theme_color = color_or(manifest.get("theme_color"), "#000000");
    let background_color = color_or(manifest.get("background_color"), "#FFFFFF");

    let icon_list: Vec<Icon> = manifest
        .get("icons")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();

    DerivedOptions {
        package_id: derive_package_id(manifest_url.host_str().unwrap_or("app")),
        icon_url: select_best_icon(&icon_list, manifest_url).map(|u| u.to_string()),
        maskable_icon_url: select_maskable_icon(&icon_list, manifest_url).map(|u| u.to_string()),
        name,
        short_name,
        display,
        orientation,
        theme_color,
        background_color,
    }
}

fn color_or(value: Option<&Value>, fallback: &str) -> String {
    static HEX_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^#[0-9a-fA-F]{6}$").expect("valid regex"));
    value
        .and_then(Value::as_str)
        .filter(|s| HEX_RE.is_match(s))
        .unwrap_or(fallback)
        .to_string()
}

/// Build a reverse-domain package id from a hostname. Each label is
/// lowercased, stripped to `[a-z0-9_]`, and prefixed with `a` if it does
/// not start with a letter; `app` labels pad the result to three segments.
pub fn derive_package_id(hostname: &str) -> String {
    let mut labels: Vec<String> = hostname
        .split('.')
        .rev()
        .map(clean_label)
        .collect();
    while labels.len() < 3 {
        labels.push("app".to_string());
    }
    labels.join(".")
}

fn clean_label(label: &str) -> String {
    let cleaned: String = label
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_')
        .collect();
    if cleaned.chars().next().is_some_and(|c| c.is_ascii_lowercase()) {
        cleaned
    } else {
        format!("a{}", cleaned)
    }
}
