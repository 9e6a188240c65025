//! Icon selection from a manifest's icon list.
//!
//! Ranking policy: raster formats beat vector regardless of declared size,
//! then larger declared dimension beats smaller, then manifest order. Icons
//! declaring a `maskable` purpose form a separate pool. Resolved URLs must
//! be https; anything else is skipped in favor of the next candidate.

use serde::Deserialize;
use url::Url;

/// One entry of a manifest's `icons` array. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Icon {
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub sizes: Option<String>,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default, rename = "type")]
    pub mime_type: Option<String>,
}

impl Icon {
    fn is_maskable(&self) -> bool {
        self.purpose
            .as_deref()
            .unwrap_or("")
            .split_whitespace()
            .any(|token| token.eq_ignore_ascii_case("maskable"))
    }

    pub(crate) fn is_vector(&self) -> bool {
        if let Some(mime) = &self.mime_type
            && mime.to_ascii_lowercase().contains("svg")
        {
            return true;
        }
        let path = self.src.split(['?', '#']).next().unwrap_or("");
        path.to_ascii_lowercase().ends_with(".svg")
    }

    /// Largest `W` token of a space-separated `WxH` sizes string.
    fn max_dimension(&self) -> u32 {
        self.sizes
            .as_deref()
            .unwrap_or("")
            .split_whitespace()
            .filter_map(|token| {
                token
                    .split(['x', 'X'])
                    .next()
                    .and_then(|w| w.parse::<u32>().ok())
            })
            .max()
            .unwrap_or(0)
    }
}

/// Best non-maskable icon, resolved against the manifest URL.
pub fn select_best_icon(icons: &[Icon], base: &Url) -> Option<Url> {
    select(icons, base, false)
}

/// Best maskable-purpose icon, resolved against the manifest URL.
pub fn select_maskable_icon(icons: &[Icon], base: &Url) -> Option<Url> {
    select(icons, base, true)
}

fn select(icons: &[Icon], base: &Url, maskable: bool) -> Option<Url> {
    let mut pool: Vec<&Icon> = icons
        .iter()
        .filter(|icon| !icon.src.is_empty() && icon.is_maskable() == maskable)
        .collect();
    // Stable sort keeps manifest order among equal candidates.
    pool.sort_by_key(|icon| (icon.is_vector(), std::cmp::Reverse(icon.max_dimension())));

    for icon in pool {
        if let Ok(resolved) = base.join(&icon.src)
            && resolved.scheme() == "https"
        {
            return Some(resolved);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn icon(src: &str, sizes: Option<&str>, purpose: Option<&str>) -> Icon {
        Icon {
            src: src.to_string(),
            sizes: sizes.map(str::to_string),
            purpose: purpose.map(str::to_string),
            mime_type: None,
        }
    }

    fn base() -> Url {
        Url::parse("https://example.com/manifest.json").unwrap()
    }

    #[test]
    fn raster_beats_larger_vector() {
        let icons = vec![
            icon("/icon.svg", Some("1024x1024"), None),
            icon("/icon-512.png", Some("512x512"), None),
        ];
        let selected = select_best_icon(&icons, &base()).unwrap();
        assert_eq!(selected.as_str(), "https://example.com/icon-512.png");
    }

    #[test]
    fn lone_svg_is_still_selected() {
        let icons = vec![icon("/icon.svg", Some("any"), None)];
        let selected = select_best_icon(&icons, &base()).unwrap();
        assert_eq!(selected.as_str(), "https://example.com/icon.svg");
    }

    #[test]
    fn non_https_candidates_are_rejected() {
        let icons = vec![icon("http://example.com/icon.png", Some("512x512"), None)];
        assert!(select_best_icon(&icons, &base()).is_none());
    }

    #[test]
    fn falls_through_to_next_https_candidate() {
        let icons = vec![
            icon("http://cdn.example.com/big.png", Some("1024x1024"), None),
            icon("/small.png", Some("192x192"), None),
        ];
        let selected = select_best_icon(&icons, &base()).unwrap();
        assert_eq!(selected.as_str(), "https://example.com/small.png");
    }

    #[test]
    fn larger_declared_size_wins_within_a_format() {
        let icons = vec![
            icon("/icon-192.png", Some("192x192"), None),
            icon("/icon-512.png", Some("512x512"), None),
        ];
        let selected = select_best_icon(&icons, &base()).unwrap();
        assert_eq!(selected.as_str(), "https://example.com/icon-512.png");
    }

    #[test]
    fn largest_token_of_a_multi_size_string_counts() {
        let icons = vec![
            icon("/multi.png", Some("48x48 96x96 256x256"), None),
            icon("/single.png", Some("128x128"), None),
        ];
        let selected = select_best_icon(&icons, &base()).unwrap();
        assert_eq!(selected.as_str(), "https://example.com/multi.png");
    }

    #[test]
    fn manifest_order_breaks_ties() {
        let icons = vec![
            icon("/first.png", Some("512x512"), None),
            icon("/second.png", Some("512x512"), None),
        ];
        let selected = select_best_icon(&icons, &base()).unwrap();
        assert_eq!(selected.as_str(), "https://example.com/first.png");
    }

    #[test]
    fn maskable_icons_form_a_separate_pool() {
        let icons = vec![
            icon("/any.png", Some("512x512"), Some("any")),
            icon("/mask.png", Some("192x192"), Some("maskable")),
        ];
        let best = select_best_icon(&icons, &base()).unwrap();
        assert_eq!(best.as_str(), "https://example.com/any.png");
        let mask = select_maskable_icon(&icons, &base()).unwrap();
        assert_eq!(mask.as_str(), "https://example.com/mask.png");
    }

    #[test]
    fn maskable_pool_empty_returns_none() {
        let icons = vec![icon("/any.png", Some("512x512"), None)];
        assert!(select_maskable_icon(&icons, &base()).is_none());
    }

    #[test]
    fn mime_type_marks_vectors_without_extension() {
        let mut svg = icon("/icon", Some("512x512"), None);
        svg.mime_type = Some("image/svg+xml".to_string());
        let png = icon("/icon.png", Some("192x192"), None);
        let selected = select_best_icon(&[svg, png], &base()).unwrap();
        assert_eq!(selected.as_str(), "https://example.com/icon.png");
    }

    #[test]
    fn query_strings_do_not_hide_svg_extensions() {
        let svg = icon("/icon.svg?v=2", None, None);
        assert!(svg.is_vector());
    }

    #[test]
    fn absolute_srcs_resolve_as_is() {
        let icons = vec![icon("https://cdn.example.net/icon.png", Some("512x512"), None)];
        let selected = select_best_icon(&icons, &base()).unwrap();
        assert_eq!(selected.as_str(), "https://cdn.example.net/icon.png");
    }
}
