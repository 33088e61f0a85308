//! Request classification.
//!
//! Classification only looks at the URL shape (origin, host, path), never at
//! the query string, so the same asset always lands in the same partition.

use std::fmt;
use url::{Origin, Url};

use crate::config::ClassificationConfig;

/// Resource class of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
  /// Same-origin shell files: pages, styles, scripts, manifests, icons
  AppStatic,
  /// Libraries from public CDNs
  CdnLibrary,
  /// Model weights, tokenizer/OCR data, WASM runtimes
  LargeModelAsset,
  /// Everything else
  Dynamic,
}

impl fmt::Display for ResourceClass {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::AppStatic => "app-static",
      Self::CdnLibrary => "cdn-library",
      Self::LargeModelAsset => "large-model-asset",
      Self::Dynamic => "dynamic",
    };
    f.write_str(name)
  }
}

/// Deterministic URL classifier, built once at startup.
#[derive(Debug, Clone)]
pub struct Classifier {
  origin: Origin,
  rules: ClassificationConfig,
}

impl Classifier {
  pub fn new(app_origin: &Url, rules: ClassificationConfig) -> Self {
    Self {
      origin: app_origin.origin(),
      rules,
    }
  }

  /// First match wins: app-static, cdn-library, large-model-asset, dynamic.
  pub fn classify(&self, url: &Url) -> ResourceClass {
    if self.is_app_static(url) {
      ResourceClass::AppStatic
    } else if self.is_cdn_library(url) {
      ResourceClass::CdnLibrary
    } else if self.is_large_model_asset(url) {
      ResourceClass::LargeModelAsset
    } else {
      ResourceClass::Dynamic
    }
  }

  fn is_app_static(&self, url: &Url) -> bool {
    if url.origin() != self.origin {
      return false;
    }

    let path = url.path();
    self
      .rules
      .app_extensions
      .iter()
      .any(|ext| path.ends_with(ext.as_str()))
      || path.contains(self.rules.icons_segment.as_str())
  }

  fn is_cdn_library(&self, url: &Url) -> bool {
    host_contains_any(url, &self.rules.cdn_hosts)
  }

  fn is_large_model_asset(&self, url: &Url) -> bool {
    let path = url.path();
    host_contains_any(url, &self.rules.model_hosts)
      || self
        .rules
        .model_path_markers
        .iter()
        .any(|marker| path.contains(marker.as_str()))
  }
}

fn host_contains_any(url: &Url, needles: &[String]) -> bool {
  url
    .host_str()
    .is_some_and(|host| needles.iter().any(|n| host.contains(n.as_str())))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn classifier() -> Classifier {
    let origin = Url::parse("https://someone.github.io").unwrap();
    Classifier::new(&origin, ClassificationConfig::default())
  }

  fn class_of(url: &str) -> ResourceClass {
    classifier().classify(&Url::parse(url).unwrap())
  }

  #[test]
  fn test_same_origin_shell_files_are_app_static() {
    for path in [
      "/solver/index.html",
      "/solver/styles.css",
      "/solver/app.js",
      "/solver/manifest.json",
      "/solver/icons/icon-192.png",
      "/solver/logo.png",
    ] {
      let url = format!("https://someone.github.io{}", path);
      assert_eq!(class_of(&url), ResourceClass::AppStatic, "{}", url);
    }
  }

  #[test]
  fn test_query_string_does_not_affect_app_static() {
    assert_eq!(
      class_of("https://someone.github.io/solver/app.js?v=123"),
      ResourceClass::AppStatic
    );
    assert_eq!(
      class_of("https://someone.github.io/solver/styles.css?x=.wasm"),
      ResourceClass::AppStatic
    );
  }

  #[test]
  fn test_icons_segment_without_extension_is_app_static() {
    assert_eq!(
      class_of("https://someone.github.io/solver/icons/maskable"),
      ResourceClass::AppStatic
    );
  }

  #[test]
  fn test_other_origin_with_app_extension_is_not_app_static() {
    assert_eq!(
      class_of("https://cdn.jsdelivr.net/npm/tesseract.js@5/dist/tesseract.min.js"),
      ResourceClass::CdnLibrary
    );
    assert_eq!(class_of("https://unpkg.com/react@18/index.js"), ResourceClass::CdnLibrary);
    assert_eq!(class_of("https://other.example.com/app.js"), ResourceClass::Dynamic);
  }

  #[test]
  fn test_different_port_is_a_different_origin() {
    assert_eq!(
      class_of("https://someone.github.io:8443/app.js"),
      ResourceClass::Dynamic
    );
  }

  #[test]
  fn test_cdn_wasm_is_cdn_library() {
    assert_eq!(
      class_of("https://cdn.jsdelivr.net/npm/tesseract.js-core@5/tesseract-core.wasm"),
      ResourceClass::CdnLibrary
    );
  }

  #[test]
  fn test_large_model_assets() {
    for url in [
      "https://huggingface.co/mlc-ai/Qwen2-1.5B/resolve/main/params_shard_0.bin",
      "https://models.example.com/tessdata/rus.traineddata",
      "https://runtime.example.com/lib/model.wasm",
      "https://models.example.com/q4f16/mlc-chat-config.json",
      "https://models.example.com/q4f16/ndarray-cache.json",
    ] {
      assert_eq!(class_of(url), ResourceClass::LargeModelAsset, "{}", url);
    }
  }

  #[test]
  fn test_marker_in_host_only_falls_through_to_dynamic() {
    assert_eq!(
      class_of("https://tessdata.projectnaptha.com/4.0.0/eng.traineddata.gz"),
      ResourceClass::Dynamic
    );
  }

  #[test]
  fn test_same_origin_wasm_is_large_model_asset() {
    assert_eq!(
      class_of("https://someone.github.io/solver/ocr/worker.wasm"),
      ResourceClass::LargeModelAsset
    );
  }

  #[test]
  fn test_everything_else_is_dynamic() {
    assert_eq!(class_of("https://someone.github.io/api/solve"), ResourceClass::Dynamic);
    assert_eq!(class_of("https://someone.github.io/solver/"), ResourceClass::Dynamic);
    assert_eq!(
      class_of("https://generativelanguage.googleapis.com/v1beta/models"),
      ResourceClass::Dynamic
    );
  }

  #[test]
  fn test_display_names() {
    assert_eq!(ResourceClass::AppStatic.to_string(), "app-static");
    assert_eq!(ResourceClass::LargeModelAsset.to_string(), "large-model-asset");
  }
}
