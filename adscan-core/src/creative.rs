use crate::net;
use crate::rewrite::{contains_host_macro, Base, SnippetRewriter};
use crate::types::CreativeId;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

const TEMPLATE_VALUES_KEY: &str = "creativeTemplateVariableValues";

/// Vendor creative types, keyed by the platform's type tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CreativeType {
  ThirdParty,
  AdExchange,
  AdSense,
  Custom,
  Flash,
  Image,
  InternalRedirect,
  ImageRedirect,
  ImageRedirectOverlay,
  VastRedirect,
  AspectRatioImage,
  Template,
  Other(String),
}

/// Where a type keeps its editable copy inside a platform payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EditableField {
  Key(&'static str),
  AssetUrl,
  TemplateValues,
  ReadOnly,
}

impl CreativeType {
  pub fn from_tag(tag: &str) -> Self {
    match tag {
      "ThirdPartyCreative" => Self::ThirdParty,
      "AdExchangeCreative" => Self::AdExchange,
      "AdSenseCreative" => Self::AdSense,
      "CustomCreative" => Self::Custom,
      "FlashCreative" => Self::Flash,
      "ImageCreative" => Self::Image,
      "InternalRedirectCreative" => Self::InternalRedirect,
      "ImageRedirectCreative" => Self::ImageRedirect,
      "ImageRedirectOverlayCreative" => Self::ImageRedirectOverlay,
      "VastRedirectCreative" => Self::VastRedirect,
      "AspectRatioImageCreative" => Self::AspectRatioImage,
      "TemplateCreative" => Self::Template,
      other => Self::Other(other.to_string()),
    }
  }

  pub fn as_tag(&self) -> &str {
    match self {
      Self::ThirdParty => "ThirdPartyCreative",
      Self::AdExchange => "AdExchangeCreative",
      Self::AdSense => "AdSenseCreative",
      Self::Custom => "CustomCreative",
      Self::Flash => "FlashCreative",
      Self::Image => "ImageCreative",
      Self::InternalRedirect => "InternalRedirectCreative",
      Self::ImageRedirect => "ImageRedirectCreative",
      Self::ImageRedirectOverlay => "ImageRedirectOverlayCreative",
      Self::VastRedirect => "VastRedirectCreative",
      Self::AspectRatioImage => "AspectRatioImageCreative",
      Self::Template => "TemplateCreative",
      Self::Other(tag) => tag,
    }
  }

  fn editable_field(&self) -> EditableField {
    match self {
      Self::ThirdParty => EditableField::Key("snippet"),
      Self::AdExchange | Self::AdSense => EditableField::Key("codeSnippet"),
      Self::Custom => EditableField::Key("htmlSnippet"),
      Self::Image => EditableField::AssetUrl,
      Self::InternalRedirect => EditableField::Key("internalRedirectUrl"),
      Self::ImageRedirect | Self::ImageRedirectOverlay => EditableField::Key("imageUrl"),
      Self::VastRedirect => EditableField::Key("vastXmlUrl"),
      Self::AspectRatioImage => EditableField::Key("thirdPartyImpressionUrl"),
      Self::Template => EditableField::TemplateValues,
      Self::Flash | Self::Other(_) => EditableField::ReadOnly,
    }
  }

  /// Rendered from the preview page rather than from a payload field.
  pub fn uses_preview_page(&self) -> bool {
    matches!(self, Self::Flash | Self::Template)
  }

  pub fn extract_editable_field(&self, payload: &Value) -> Option<String> {
    let value = match self.editable_field() {
      EditableField::Key(key) => payload.get(key),
      EditableField::AssetUrl => payload.get("primaryImageAsset").and_then(|a| a.get("assetUrl")),
      EditableField::TemplateValues | EditableField::ReadOnly => None,
    };
    value.and_then(Value::as_str).map(str::to_string)
  }

  /// Returns false when the type has no single writable field.
  pub fn write_editable_field(&self, payload: &mut Value, value: &str) -> bool {
    let Some(obj) = payload.as_object_mut() else {
      return false;
    };

    match self.editable_field() {
      EditableField::Key(key) => {
        obj.insert(key.to_string(), Value::String(value.to_string()));
        true
      }
      EditableField::AssetUrl => {
        let asset = obj
          .entry("primaryImageAsset")
          .or_insert_with(|| Value::Object(Default::default()));
        match asset.as_object_mut() {
          Some(asset) => {
            asset.insert("assetUrl".to_string(), Value::String(value.to_string()));
            true
          }
          None => false,
        }
      }
      EditableField::TemplateValues | EditableField::ReadOnly => false,
    }
  }
}

impl From<String> for CreativeType {
  fn from(tag: String) -> Self {
    Self::from_tag(&tag)
  }
}

impl From<CreativeType> for String {
  fn from(t: CreativeType) -> Self {
    t.as_tag().to_string()
  }
}

impl fmt::Display for CreativeType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_tag())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Creative {
  pub id: CreativeId,
  pub creative_type: CreativeType,
  pub preview_url: String,

  /// Some rewrite changed the snippet or the expanded snippet.
  #[serde(default)]
  pub modified: bool,

  #[serde(default)]
  pub snippet: Option<String>,
  #[serde(default)]
  pub modified_snippet: Option<String>,
  #[serde(default)]
  pub expanded_snippet: Option<String>,
  #[serde(default)]
  pub modified_expanded_snippet: Option<String>,

  /// String template variable values (template creatives only).
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub template_values: Vec<String>,

  #[serde(skip)]
  pub scan_snippet: Option<String>,
  #[serde(skip)]
  pub modified_scan_snippet: Option<String>,

  #[serde(default)]
  pub compliance: Option<bool>,
  #[serde(default)]
  pub request_match: Option<bool>,
  #[serde(default)]
  pub uploaded: bool,
}

impl Creative {
  pub fn new(id: CreativeId, creative_type: CreativeType, preview_url: impl Into<String>) -> Self {
    Self {
      id,
      creative_type,
      preview_url: preview_url.into(),
      modified: false,
      snippet: None,
      modified_snippet: None,
      expanded_snippet: None,
      modified_expanded_snippet: None,
      template_values: Vec::new(),
      scan_snippet: None,
      modified_scan_snippet: None,
      compliance: None,
      request_match: None,
      uploaded: false,
    }
  }

  /// Builds a creative from a platform payload and derives its rewrites.
  pub fn from_platform(
    payload: &Value,
    rewriter: &SnippetRewriter,
    preview: &dyn PreviewSource,
  ) -> anyhow::Result<Self> {
    let id = payload_id(payload).context("creative payload has no usable id")?;
    let preview_url = payload
      .get("previewUrl")
      .and_then(Value::as_str)
      .ok_or_else(|| anyhow::anyhow!("creative {id} has no previewUrl"))?;
    let tag = payload.get("type").and_then(Value::as_str).unwrap_or_default();
    let creative_type = CreativeType::from_tag(tag);

    let mut creative = Creative::new(id, creative_type.clone(), preview_url);
    let (snippet, modified, expanded, modified_expanded) = match &creative_type {
      CreativeType::ThirdParty => {
        let snippet = payload.get("snippet").and_then(Value::as_str).map(str::to_string);
        let modified = snippet.as_deref().map(|s| rewriter.rewrite(s, Base::None));
        let expanded = payload
          .get("expandedSnippet")
          .and_then(Value::as_str)
          .map(str::to_string);
        let modified_expanded = expanded.as_deref().map(|e| {
          let base = snippet.as_deref().map(Base::Snippet).unwrap_or(Base::None);
          rewriter.rewrite(e, base)
        });
        (snippet, modified, expanded, modified_expanded)
      }
      CreativeType::Flash => {
        let html = preview
          .fetch(preview_url)
          .with_context(|| format!("download preview of flash creative {id}"))?;
        (Some(html.clone()), Some(html), None, None)
      }
      CreativeType::Template => {
        let html = preview
          .fetch(preview_url)
          .with_context(|| format!("download preview of template creative {id}"))?;
        creative.template_values = template_string_values(payload);
        let modified = rewriter.rewrite_html(&html, Base::Values(&creative.template_values));
        (Some(html), Some(modified), None, None)
      }
      other => {
        let snippet = other.extract_editable_field(payload);
        let modified = snippet.as_deref().map(|s| rewriter.rewrite(s, Base::None));
        (snippet, modified, None, None)
      }
    };

    creative.set_snippets(snippet, modified, expanded, modified_expanded);
    Ok(creative)
  }

  /// Re-derives rewrites for a previously stored creative; verdicts are reset.
  pub fn renew(&self, rewriter: &SnippetRewriter) -> Self {
    let snippet = self.snippet.clone();
    let expanded = self.expanded_snippet.clone();

    let (modified, modified_expanded) = match self.creative_type {
      CreativeType::ThirdParty => {
        let modified = snippet.as_deref().map(|s| rewriter.rewrite_html(s, Base::None));
        let modified_expanded = expanded.as_deref().map(|e| {
          let base = snippet.as_deref().map(Base::Snippet).unwrap_or(Base::None);
          rewriter.rewrite_html(e, base)
        });
        (modified, modified_expanded)
      }
      _ => (snippet.as_deref().map(|s| rewriter.rewrite(s, Base::None)), None),
    };

    let mut renewed = Creative::new(self.id, self.creative_type.clone(), self.preview_url.clone());
    renewed.template_values = self.template_values.clone();
    renewed.set_snippets(snippet, modified, expanded, modified_expanded);
    renewed
  }

  /// Applies the modified snippet to a copy of `payload`; None when the
  /// type is not writable or nothing was modified.
  pub fn to_platform(&self, payload: &Value, rewriter: &SnippetRewriter) -> Option<Value> {
    let modified = self.modified_snippet.as_deref()?;
    let mut out = payload.clone();

    match self.creative_type.editable_field() {
      EditableField::TemplateValues => {
        let vars = out.get_mut(TEMPLATE_VALUES_KEY).and_then(Value::as_array_mut);
        for var in vars.into_iter().flatten() {
          if !is_string_variable(var) {
            continue;
          }
          let Some(current) = var.get("value").and_then(Value::as_str) else {
            continue;
          };
          if let Some(upgraded) = rewriter.upgrade_template_value(current, modified) {
            var["value"] = Value::String(upgraded);
          }
        }
        Some(out)
      }
      _ => self
        .creative_type
        .write_editable_field(&mut out, modified)
        .then_some(out),
    }
  }

  /// Resolves `%h` host macros into the snippets the browser will render.
  pub fn prepare_scan_snippets(
    &mut self,
    rewriter: &SnippetRewriter,
    preview: &dyn PreviewSource,
    default_host: &str,
  ) {
    let scan = self.expanded_snippet.clone().or_else(|| self.snippet.clone());
    let modified_scan = self
      .modified_expanded_snippet
      .clone()
      .or_else(|| self.expanded_snippet.clone())
      .or_else(|| self.modified_snippet.clone())
      .or_else(|| self.snippet.clone());

    let needs_preview = [&scan, &modified_scan]
      .into_iter()
      .flatten()
      .any(|s| contains_host_macro(s));

    let preview_html = if needs_preview {
      match preview.fetch(&self.preview_url) {
        Ok(html) => html,
        Err(e) => {
          tracing::warn!(creative_id = self.id, error = %e, "preview download failed; using default ad host");
          String::new()
        }
      }
    } else {
      String::new()
    };

    let resolve = |s: String| {
      if needs_preview {
        rewriter.resolve_host_macro(&s, &preview_html, default_host)
      } else {
        s
      }
    };
    self.scan_snippet = scan.map(resolve);
    self.modified_scan_snippet = modified_scan.map(resolve);
  }

  pub fn is_upload_candidate(&self) -> bool {
    self.modified
      && self.compliance == Some(true)
      && self.request_match == Some(true)
      && self.modified_snippet.is_some()
  }

  fn set_snippets(
    &mut self,
    snippet: Option<String>,
    modified: Option<String>,
    expanded: Option<String>,
    modified_expanded: Option<String>,
  ) {
    let (modified, changed) = keep_if_changed(snippet.as_deref(), modified);
    let (modified_expanded, expanded_changed) = keep_if_changed(expanded.as_deref(), modified_expanded);

    self.snippet = snippet;
    self.modified_snippet = modified;
    self.expanded_snippet = expanded;
    self.modified_expanded_snippet = modified_expanded;
    self.modified = changed || expanded_changed;
  }
}

/// Source of rendered preview pages.
pub trait PreviewSource {
  fn fetch(&self, url: &str) -> anyhow::Result<String>;
}

pub struct HttpPreview {
  client: reqwest::blocking::Client,
}

impl HttpPreview {
  pub fn new(timeout: Duration) -> anyhow::Result<Self> {
    Ok(Self {
      client: net::preview_client(timeout)?,
    })
  }
}

impl PreviewSource for HttpPreview {
  fn fetch(&self, url: &str) -> anyhow::Result<String> {
    net::download_html(&self.client, url)
  }
}

fn keep_if_changed(original: Option<&str>, modified: Option<String>) -> (Option<String>, bool) {
  match (original, modified) {
    (Some(o), Some(m)) if !m.is_empty() && o != m => (Some(m), true),
    _ => (None, false),
  }
}

fn payload_id(payload: &Value) -> Option<CreativeId> {
  match payload.get("id")? {
    Value::Number(n) => n.as_u64(),
    Value::String(s) => s.trim().parse().ok(),
    _ => None,
  }
}

fn is_string_variable(var: &Value) -> bool {
  match var.get("type").and_then(Value::as_str) {
    Some(kind) => kind.contains("String"),
    None => var.get("value").is_some_and(Value::is_string),
  }
}

fn template_string_values(payload: &Value) -> Vec<String> {
  payload
    .get(TEMPLATE_VALUES_KEY)
    .and_then(Value::as_array)
    .into_iter()
    .flatten()
    .filter(|v| is_string_variable(v))
    .filter_map(|v| v.get("value").and_then(Value::as_str).map(str::to_string))
    .collect()
}
