//! Resource classification for the edge cache.
//!
//! Every intercepted GET is sorted into one of four classes by URL shape;
//! the class decides the caching strategy and the `(max_age, max_items)`
//! bounds its cache enforces.

use std::time::Duration;

use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
  Static,
  Api,
  Image,
  Dynamic,
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "svg", "ico"];
const STATIC_EXTENSIONS: &[&str] = &["js", "css", "woff", "woff2", "ttf", "otf", "eot"];

impl ResourceClass {
  pub const ALL: [ResourceClass; 4] = [
    ResourceClass::Static,
    ResourceClass::Api,
    ResourceClass::Image,
    ResourceClass::Dynamic,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      ResourceClass::Static => "static",
      ResourceClass::Api => "api",
      ResourceClass::Image => "images",
      ResourceClass::Dynamic => "dynamic",
    }
  }

  /// Entries older than this are expired.
  pub fn max_age(&self) -> Duration {
    match self {
      ResourceClass::Static => Duration::from_secs(7 * 24 * 60 * 60),
      ResourceClass::Api => Duration::from_secs(5 * 60),
      ResourceClass::Image => Duration::from_secs(30 * 24 * 60 * 60),
      ResourceClass::Dynamic => Duration::from_secs(24 * 60 * 60),
    }
  }

  /// Count bound for this class; exceeding it evicts the oldest entries.
  pub fn max_items(&self) -> usize {
    match self {
      ResourceClass::Static | ResourceClass::Image => 100,
      ResourceClass::Api | ResourceClass::Dynamic => 50,
    }
  }

  /// Sort a URL into a class. API paths win over everything else; file
  /// extension decides images and static assets; the rest is dynamic.
  pub fn classify(url: &str) -> ResourceClass {
    let path = Url::parse(url).map(|u| u.path().to_string()).unwrap_or_default();

    if path.contains("/api/") || path.contains("/backend/") {
      return ResourceClass::Api;
    }

    if let Some(ext) = path.rsplit('.').next().filter(|e| *e != path) {
      let ext = ext.to_ascii_lowercase();
      if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        return ResourceClass::Image;
      }
      if STATIC_EXTENSIONS.contains(&ext.as_str()) {
        return ResourceClass::Static;
      }
    }

    if path.contains("/_next/static/") {
      return ResourceClass::Static;
    }

    ResourceClass::Dynamic
  }
}

impl std::fmt::Display for ResourceClass {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Whether the edge cache handles a request at all. Non-GETs, non-http
/// schemes and excluded third-party hosts (map tile CDNs) pass through
/// untouched.
pub fn should_intercept(method: crate::gateway::Method, url: &str, excluded_hosts: &[String]) -> bool {
  if method != crate::gateway::Method::Get {
    return false;
  }

  let Ok(parsed) = Url::parse(url) else {
    return false;
  };
  if parsed.scheme() != "http" && parsed.scheme() != "https" {
    return false;
  }

  let host = parsed.host_str().unwrap_or_default();
  if excluded_hosts.iter().any(|h| host == h) {
    return false;
  }
  // Generic tile-server pattern, for CDNs not on the explicit list
  if host.contains(".tile.") {
    return false;
  }

  true
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::gateway::Method;

  #[test]
  fn test_classify_by_url_shape() {
    assert_eq!(
      ResourceClass::classify("http://localhost:8080/api/gems"),
      ResourceClass::Api
    );
    assert_eq!(
      ResourceClass::classify("https://krawl.app/photos/spot.webp"),
      ResourceClass::Image
    );
    assert_eq!(
      ResourceClass::classify("https://krawl.app/_next/static/chunks/main.js"),
      ResourceClass::Static
    );
    assert_eq!(
      ResourceClass::classify("https://krawl.app/fonts/inter.woff2"),
      ResourceClass::Static
    );
    assert_eq!(
      ResourceClass::classify("https://krawl.app/explore"),
      ResourceClass::Dynamic
    );
  }

  #[test]
  fn test_api_path_wins_over_extension() {
    assert_eq!(
      ResourceClass::classify("https://krawl.app/api/export.png"),
      ResourceClass::Api
    );
  }

  #[test]
  fn test_class_bounds() {
    assert_eq!(ResourceClass::Api.max_items(), 50);
    assert_eq!(ResourceClass::Static.max_items(), 100);
    assert_eq!(ResourceClass::Api.max_age(), Duration::from_secs(300));
    assert_eq!(
      ResourceClass::Image.max_age(),
      Duration::from_secs(30 * 24 * 60 * 60)
    );
  }

  #[test]
  fn test_non_get_passes_through() {
    let excluded: Vec<String> = Vec::new();
    assert!(!should_intercept(Method::Post, "https://krawl.app/api/gems", &excluded));
    assert!(should_intercept(Method::Get, "https://krawl.app/api/gems", &excluded));
  }

  #[test]
  fn test_excluded_and_tile_hosts_pass_through() {
    let excluded = vec!["tile.openstreetmap.org".to_string()];
    assert!(!should_intercept(
      Method::Get,
      "https://tile.openstreetmap.org/1/2/3.png",
      &excluded
    ));
    assert!(!should_intercept(
      Method::Get,
      "https://a.tile.example.com/1/2/3.png",
      &excluded
    ));
    assert!(!should_intercept(Method::Get, "file:///etc/hosts", &excluded));
  }
}
