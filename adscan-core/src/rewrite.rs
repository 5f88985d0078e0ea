//! HTTP to HTTPS rewriting of creative snippets.
//!
//! Absolute `http://` references are turned into protocol-relative `//host`
//! references, or into absolute `https://` references when the editable copy
//! of the creative is a set of template values that the ad server substitutes
//! verbatim.

use regex::{Regex, RegexBuilder};
use scraper::{Html, Selector};
use std::collections::HashMap;

pub const DEFAULT_AD_HOST: &str = "https://ad.doubleclick.net";

const HOST_MACRO: &str = "%h";

/// The editable representation a rewrite must stay reachable from.
#[derive(Debug, Clone, Copy)]
pub enum Base<'a> {
  None,
  /// Another snippet of the same creative; only hosts present in it are editable.
  Snippet(&'a str),
  /// Template string values; only hosts they start with are editable.
  Values(&'a [String]),
}

pub struct SnippetRewriter {
  attr_selectors: Vec<(Selector, &'static str)>,
  body_selector: Selector,
  body_region: Regex,
  url_value: Regex,
  leading_host: Regex,
  embedded_url: Regex,
  src_or_background: Regex,
  link_tag: Regex,
  href_attr: Regex,
}

impl SnippetRewriter {
  pub fn new() -> anyhow::Result<Self> {
    let attrs: [(&str, &'static str); 5] = [
      ("[src]", "src"),
      ("[background]", "background"),
      ("link[href][rel=stylesheet]", "href"),
      ("object[data]", "data"),
      ("applet[code]", "code"),
    ];
    let mut attr_selectors = Vec::with_capacity(attrs.len());
    for (css, attr) in attrs {
      attr_selectors.push((parse_selector(css)?, attr));
    }

    Ok(Self {
      attr_selectors,
      body_selector: parse_selector("script, style")?,
      body_region: Regex::new(r"(?is)(<(?:script|style)\b[^>]*>)(.*?)(</(?:script|style)\s*>|\z)")?,
      url_value: Regex::new(r"(?i)^http:(//([^/]*).*)$")?,
      leading_host: Regex::new(r"(?im)^http://([\w\-\.@:]+)")?,
      embedded_url: Regex::new(r#"(?i)http:(//([^/'"?#]+)[^\s'"<>]+)"#)?,
      src_or_background: Regex::new(r"(?i)^(?:src|background)")?,
      link_tag: Regex::new(r"(?i)^link")?,
      href_attr: Regex::new(r"(?i)^href")?,
    })
  }

  /// Rewrites a snippet that is either a bare URL or an HTML fragment.
  pub fn rewrite(&self, snippet: &str, base: Base<'_>) -> String {
    if is_url_value(snippet) {
      self.rewrite_url_value(snippet)
    } else {
      self.rewrite_html(snippet, base)
    }
  }

  /// Upgrades every line starting with `http://host` to `https://host`.
  pub fn rewrite_url_value(&self, value: &str) -> String {
    self.leading_host.replace_all(value, "https://${1}").into_owned()
  }

  pub fn rewrite_html(&self, snippet: &str, base: Base<'_>) -> String {
    let doc = Html::parse_fragment(snippet);
    let mut out = snippet.to_string();

    for (selector, attr) in &self.attr_selectors {
      for el in doc.select(selector) {
        if let Some(url) = el.value().attr(attr) {
          out = self.rewrite_attr_url(&out, el.value().name(), attr, url, base);
        }
      }
    }

    for el in doc.select(&self.body_selector) {
      let content: String = el.text().collect();
      out = self.rewrite_embedded_urls(&out, &content, base);
    }

    out
  }

  /// `url` is the parsed, entity-decoded value; the snippet may hold it
  /// escaped (`&amp;`), so each raw spelling is tried. Only the value of
  /// `attr` on `tag` elements is touched.
  fn rewrite_attr_url(&self, snippet: &str, tag: &str, attr: &str, url: &str, base: Base<'_>) -> String {
    let Some(caps) = self.url_value.captures(url) else {
      return snippet.to_string();
    };
    let Some(host) = caps.get(2) else {
      return snippet.to_string();
    };

    let mut out = snippet.to_string();
    for raw in raw_spellings(url) {
      // "http:" is five ASCII bytes in every spelling.
      let Some(replacement) = replacement_for(&raw[5..], host.as_str(), base) else {
        return snippet.to_string();
      };
      out = replace_attr_value(&out, tag, attr, &raw, &replacement);
    }
    out
  }

  fn rewrite_embedded_urls(&self, snippet: &str, content: &str, base: Base<'_>) -> String {
    let mut out = snippet.to_string();
    let mut at = 0;

    while let Some(caps) = self.embedded_url.captures_at(content, at) {
      let (Some(whole), Some(relative), Some(host)) = (caps.get(0), caps.get(1), caps.get(2)) else {
        break;
      };

      if preceded_by_macro(content, whole.start()) {
        // `h` of `http` is ASCII, so the next byte is a char boundary.
        at = whole.start() + 1;
        continue;
      }
      at = whole.end();

      let original = whole.as_str();
      if !self.is_subresource_reference(content, original) {
        tracing::trace!(url = original, "leaving non-subresource reference in script body");
        continue;
      }

      if let Some(replacement) = replacement_for(relative.as_str(), host.as_str(), base) {
        out = self.replace_in_bodies(&out, original, &replacement);
      }
    }

    out
  }

  /// Replaces `needle` only inside `script`/`style` bodies, so an anchor
  /// elsewhere that links to the same URL keeps its target.
  fn replace_in_bodies(&self, snippet: &str, needle: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(snippet.len());
    let mut last = 0;
    for caps in self.body_region.captures_iter(snippet) {
      let Some(body) = caps.get(2) else {
        continue;
      };
      out.push_str(&snippet[last..body.start()]);
      out.push_str(&replace_unprefixed(body.as_str(), needle, replacement));
      last = body.end();
    }
    out.push_str(&snippet[last..]);
    out
  }

  /// A URL in script text is rewritten when it is a plain literal, or when the
  /// markup the script writes loads it as `src`/`background` or a `link href`.
  fn is_subresource_reference(&self, content: &str, url: &str) -> bool {
    let pattern = format!(
      r#"<(?P<tag>[a-zA-Z][\w\-]*)(?:\s+(?:[\w\-]+=[^\s<>]+)*)*(?P<attr>[\w\-]+)=[\s'"]?{}[^>]*>"#,
      regex::escape(url)
    );
    let Ok(in_tag) = Regex::new(&pattern) else {
      return false;
    };

    let Some(caps) = in_tag.captures(content) else {
      return true;
    };
    let tag = caps.name("tag").map(|m| m.as_str()).unwrap_or_default();
    let attr = caps.name("attr").map(|m| m.as_str()).unwrap_or_default();

    self.src_or_background.is_match(attr) || (self.link_tag.is_match(tag) && self.href_attr.is_match(attr))
  }

  /// Replaces each `%h<path>` with a concrete URL found in the preview page,
  /// falling back to `default_host`.
  pub fn resolve_host_macro(&self, snippet: &str, preview_html: &str, default_host: &str) -> String {
    let mut resolved: HashMap<String, String> = HashMap::new();
    let mut out = String::with_capacity(snippet.len());
    let mut cursor = 0;

    while let Some((start, end)) = next_host_macro(snippet, cursor) {
      let path = &snippet[start + HOST_MACRO.len()..end];
      let url = resolved
        .entry(path.to_string())
        .or_insert_with(|| self.lookup_preview_url(path, preview_html, default_host));

      out.push_str(&snippet[cursor..start]);
      out.push_str(url);
      cursor = end;
    }
    out.push_str(&snippet[cursor..]);
    out
  }

  fn lookup_preview_url(&self, path: &str, preview_html: &str, default_host: &str) -> String {
    let pattern = format!(r#"((?:https?:)?//[^\s'"<>]+{})"#, regex::escape(path));
    let found = Regex::new(&pattern)
      .ok()
      .and_then(|re| re.find(preview_html).map(|m| m.as_str().to_string()));

    match found {
      Some(url) => self.rewrite_url_value(&url),
      None => {
        tracing::debug!(path, default_host, "host macro path not found in preview page");
        self.rewrite_url_value(&format!("{default_host}{path}"))
      }
    }
  }

  /// For an `http://host/...` template value, returns its `https:` form when
  /// the modified snippet already references that host securely.
  pub fn upgrade_template_value(&self, value: &str, modified_snippet: &str) -> Option<String> {
    let caps = self.url_value.captures(value)?;
    let relative = caps.get(1)?.as_str();
    let host = caps.get(2)?.as_str();

    let secure_ref = RegexBuilder::new(&format!(r#"['"](?:https:)?//{}"#, regex::escape(host)))
      .case_insensitive(true)
      .build()
      .ok()?;
    secure_ref
      .is_match(modified_snippet)
      .then(|| format!("https:{relative}"))
  }
}

pub fn contains_host_macro(snippet: &str) -> bool {
  next_host_macro(snippet, 0).is_some()
}

pub fn is_url_value(snippet: &str) -> bool {
  snippet
    .get(..4)
    .is_some_and(|p| p.eq_ignore_ascii_case("http"))
}

fn parse_selector(css: &str) -> anyhow::Result<Selector> {
  Selector::parse(css).map_err(|e| anyhow::anyhow!("invalid selector `{css}`: {e:?}"))
}

fn replacement_for(relative: &str, host: &str, base: Base<'_>) -> Option<String> {
  let needle = format!("http://{host}").to_ascii_lowercase();
  match base {
    Base::None => Some(relative.to_string()),
    Base::Snippet(snippet) => snippet
      .to_ascii_lowercase()
      .contains(&needle)
      .then(|| relative.to_string()),
    Base::Values(values) => values
      .iter()
      .any(|v| v.to_ascii_lowercase().starts_with(&needle))
      .then(|| format!("https:{relative}")),
  }
}

/// `%c`, `%h` and friends are expanded by the ad server at delivery time.
fn preceded_by_macro(text: &str, idx: usize) -> bool {
  let bytes = text.as_bytes();
  idx >= 2 && bytes[idx - 2] == b'%' && bytes[idx - 1].is_ascii_alphabetic()
}

/// The decoded value plus the entity-escaped forms it may take in markup.
fn raw_spellings(value: &str) -> Vec<String> {
  let amp = value.replace('&', "&amp;");
  let full = amp
    .replace('"', "&quot;")
    .replace('\'', "&#39;")
    .replace('<', "&lt;")
    .replace('>', "&gt;");

  let mut out = vec![value.to_string()];
  for form in [amp, full] {
    if !out.contains(&form) {
      out.push(form);
    }
  }
  out
}

fn replace_attr_value(snippet: &str, tag: &str, attr: &str, raw_value: &str, replacement: &str) -> String {
  let pattern = format!(
    r#"(?i)(<{}\b[^>]*?[\s'"/]{}\s*=\s*['"]?){}"#,
    regex::escape(tag),
    regex::escape(attr),
    regex::escape(raw_value)
  );
  let Ok(re) = Regex::new(&pattern) else {
    return snippet.to_string();
  };
  re.replace_all(snippet, |caps: &regex::Captures<'_>| format!("{}{replacement}", &caps[1]))
    .into_owned()
}

fn replace_unprefixed(haystack: &str, needle: &str, replacement: &str) -> String {
  if needle.is_empty() {
    return haystack.to_string();
  }

  let mut out = String::with_capacity(haystack.len());
  let mut last = 0;
  for (idx, _) in haystack.match_indices(needle) {
    out.push_str(&haystack[last..idx]);
    if preceded_by_macro(haystack, idx) {
      out.push_str(needle);
    } else {
      out.push_str(replacement);
    }
    last = idx + needle.len();
  }
  out.push_str(&haystack[last..]);
  out
}

fn is_macro_path_char(c: char) -> bool {
  !c.is_whitespace() && !matches!(c, '\'' | '"' | '<' | '>')
}

/// Byte range of the next `%h<path>` at or after `from`; `%http` is a literal URL.
fn next_host_macro(text: &str, from: usize) -> Option<(usize, usize)> {
  let mut search = from;
  while let Some(rel) = text[search..].find(HOST_MACRO) {
    let start = search + rel;
    let after = start + HOST_MACRO.len();
    let tail = &text[after..];

    if !tail.starts_with("ttp") {
      let path_len: usize = tail
        .chars()
        .take_while(|c| is_macro_path_char(*c))
        .map(char::len_utf8)
        .sum();
      if path_len > 0 {
        return Some((start, after + path_len));
      }
    }
    search = after;
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;

  fn rw() -> SnippetRewriter {
    SnippetRewriter::new().unwrap()
  }

  fn html(snippet: &str) -> String {
    rw().rewrite_html(snippet, Base::None)
  }

  #[test]
  fn iframe_src_becomes_protocol_relative() {
    assert_eq!(
      html("<iframe src='http://www.example.com/ads'></iframe>"),
      "<iframe src='//www.example.com/ads'></iframe>"
    );
  }

  #[test]
  fn upper_case_scheme_and_tags_are_rewritten() {
    assert_eq!(
      html("<img src='HTTP://www.example.com/ads'/>"),
      "<img src='//www.example.com/ads'/>"
    );
    assert_eq!(
      html("<IMG SRC='HTTP://www.example.com/ads'/>"),
      "<IMG SRC='//www.example.com/ads'/>"
    );
  }

  #[test]
  fn stylesheet_link_href_is_rewritten_in_any_attribute_order() {
    assert_eq!(
      html("<link rel=stylesheet type=text/css href=http://www.example.com/ads>"),
      "<link rel=stylesheet type=text/css href=//www.example.com/ads>"
    );
    assert_eq!(
      html("<link type=text/css href=http://www.example.com/ads rel=stylesheet >"),
      "<link type=text/css href=//www.example.com/ads rel=stylesheet >"
    );
  }

  #[test]
  fn entity_escaped_query_is_rewritten() {
    assert_eq!(
      html(r#"<img src="http://ad.example.com/pixel?a=1&amp;b=2">"#),
      r#"<img src="//ad.example.com/pixel?a=1&amp;b=2">"#
    );

    let out = rw().rewrite(
      r#"<iframe src="http://ad.example.com/f?x=1&amp;y=2&z=3"></iframe>"#,
      Base::None,
    );
    assert!(!out.contains("http://ad.example.com"), "{out}");
  }

  #[test]
  fn anchor_with_same_url_as_subresource_keeps_its_target() {
    assert_eq!(
      html(r#"<img src="http://www.example.com/x"><a href="http://www.example.com/x">go</a>"#),
      r#"<img src="//www.example.com/x"><a href="http://www.example.com/x">go</a>"#
    );
    assert_eq!(
      html("<a href='http://cdn.example.com/y'>a</a><script>var u = 'http://cdn.example.com/y';</script>"),
      "<a href='http://cdn.example.com/y'>a</a><script>var u = '//cdn.example.com/y';</script>"
    );
  }

  #[test]
  fn anchor_href_attribute_is_not_a_subresource() {
    let snippet = "<a href=\"http://www.example.com/landing\">x</a>";
    assert_eq!(html(snippet), snippet);
  }

  #[test]
  fn script_string_literal_is_rewritten() {
    assert_eq!(
      html("<script language='JavaScript' type='text/javascript'>var src = 'HTTP://www.example.com/ads';</script>"),
      "<script language='JavaScript' type='text/javascript'>var src = '//www.example.com/ads';</script>"
    );
  }

  #[test]
  fn script_written_img_is_rewritten() {
    assert_eq!(
      html("<script language='JavaScript' type='text/javascript'>document.write(<img src='http://www.example.com/ads'>"),
      "<script language='JavaScript' type='text/javascript'>document.write(<img src='//www.example.com/ads'>"
    );
    assert_eq!(
      html("<script language='JavaScript' type='text/javascript'>document.write(<img x=1 y=z src='http://www.example.com/ads' z=12></script>"),
      "<script language='JavaScript' type='text/javascript'>document.write(<img x=1 y=z src='//www.example.com/ads' z=12></script>"
    );
    assert_eq!(
      html("<script>document.write('<img src=http://www.example.com/x>');</script>"),
      "<script>document.write('<img src=//www.example.com/x>');</script>"
    );
  }

  #[test]
  fn script_written_anchor_href_is_left_alone() {
    let simple = "<script language=JavaScript type=text/javascript>document.write('<a href=http://www.example.com/ads>x</a>');</script>";
    assert_eq!(html(simple), simple);

    let with_attrs = "<script language=JavaScript type=text/javascript>document.write('<a x=1 y=z  href=http://www.example.com/ads z=12>x</a>');</script>";
    assert_eq!(html(with_attrs), with_attrs);
  }

  #[test]
  fn percent_macro_prefixed_urls_are_skipped() {
    let snippet = "<iframe src='%chttp://www.example.com/ads'></iframe>";
    assert_eq!(html(snippet), snippet);

    let script = "<script>var c = '%chttp://www.example.com/click'; var i = 'http://www.example.com/click';</script>";
    assert_eq!(
      html(script),
      "<script>var c = '%chttp://www.example.com/click'; var i = '//www.example.com/click';</script>"
    );
  }

  #[test]
  fn script_comments_and_repeated_urls_are_rewritten() {
    assert_eq!(
      html(r#"<script><!-- var a = "http://www.example.com/ads"; var b = "http://www.example.com/ads"; --></script>"#),
      r#"<script><!-- var a = "//www.example.com/ads"; var b = "//www.example.com/ads"; --></script>"#
    );

    let multiline = "<script><!--\n  var a = \"http://www.example.com/ads\";\n  var b = \"http://www.example.com/ads\";\n--></script>";
    let expect = "<script><!--\n  var a = \"//www.example.com/ads\";\n  var b = \"//www.example.com/ads\";\n--></script>";
    assert_eq!(html(multiline), expect);
  }

  #[test]
  fn comparison_operators_in_script_do_not_hide_urls() {
    assert_eq!(
      html(r#"<script><!-- if(x<z){var a = "http://www.example.com/ads"}; --></script>"#),
      r#"<script><!-- if(x<z){var a = "//www.example.com/ads"}; --></script>"#
    );
  }

  #[test]
  fn bare_scheme_strings_are_ignored() {
    let snippet =
      r#"<script>var cspJsHost = (("https:" == document.location.protocol) ? "https://" : "http://");</script>"#;
    assert_eq!(html(snippet), snippet);
  }

  #[test]
  fn rewriting_is_idempotent() {
    let r = rw();
    let snippets = [
      "<img src=\"http://cdn.example.com/a.png\"><script>var u = 'http://cdn.example.com/b.js';</script>",
      "<link rel=stylesheet href=http://cdn.example.com/s.css><object data=\"http://cdn.example.com/o.swf\"></object>",
      "http://cdn.example.com/image.png",
    ];
    for snippet in snippets {
      let once = r.rewrite(snippet, Base::None);
      assert_ne!(once, snippet);
      assert_eq!(r.rewrite(&once, Base::None), once);
    }
  }

  #[test]
  fn src_rewrite_removes_every_http_reference() {
    let out = html("<div><img src=\"http://img.example.org/p/1.gif\"><img src=\"http://img.example.org/p/1.gif\"></div>");
    assert!(out.contains("//img.example.org/p/1.gif"));
    assert!(!out.contains("http://img.example.org/p/1.gif"));
  }

  #[test]
  fn base_snippet_without_host_blocks_rewrite() {
    let snippet = "<script>screenad = {clicks: ['http://www.example.com/ads']};</script>";
    let base = "<script>screenad = {clicks: ['%%CLICK_URL_UNESC%%//www.example.com/ads']};</script>";
    assert_eq!(rw().rewrite_html(snippet, Base::Snippet(base)), snippet);

    let img = "<img src=\"http://other.example.com/x.png\">";
    assert_eq!(rw().rewrite_html(img, Base::Snippet("<img src=\"http://www.example.com/\">")), img);
  }

  #[test]
  fn base_snippet_with_host_allows_rewrite() {
    let out = rw().rewrite_html(
      "<img src=\"http://www.example.com/x.png\"><img src=\"http://www.example.net/y.png\">",
      Base::Snippet("<img src=\"HTTP://www.example.com/\">"),
    );
    assert_eq!(out, "<img src=\"//www.example.com/x.png\"><img src=\"http://www.example.net/y.png\">");
  }

  #[test]
  fn base_values_force_absolute_https() {
    let snippet = r#"<a href="http://www.example.net">a</a><img src="http://www.example.com/ads"><script>document.write('<img src="http://www.example.net/ads">')</script>"#;
    let expect = r#"<a href="http://www.example.net">a</a><img src="https://www.example.com/ads"><script>document.write('<img src="http://www.example.net/ads">')</script>"#;
    let values = vec!["y".to_string(), "http://www.example.com/ads".to_string()];
    assert_eq!(rw().rewrite_html(snippet, Base::Values(&values)), expect);
  }

  #[test]
  fn url_values_get_https_scheme() {
    let r = rw();
    assert_eq!(
      r.rewrite("http://www.example.com/image.png", Base::None),
      "https://www.example.com/image.png"
    );
    assert_eq!(
      r.rewrite("HTTP://www.example.com/a\nhttp://www.example.net/b", Base::None),
      "https://www.example.com/a\nhttps://www.example.net/b"
    );
  }

  #[test]
  fn host_macro_resolves_from_preview_page() {
    let r = rw();
    let snippet = r#"<a href="%c%u" target="_top"><img src="%h/ads" border="0"></a>"#;
    let preview = r#"<a href="https://www.example.com/" target="_top"><img src="https://www.example.com/ads" border="0"></a>"#;
    assert_eq!(
      r.resolve_host_macro(snippet, preview, DEFAULT_AD_HOST),
      r#"<a href="%c%u" target="_top"><img src="https://www.example.com/ads" border="0"></a>"#
    );

    let preview_http = r#"<a href="http://www.example.com" target="_top"><img src="https://www.example.com/ads" border="0"></a>"#;
    assert_eq!(
      r.resolve_host_macro(snippet, preview_http, DEFAULT_AD_HOST),
      r#"<a href="%c%u" target="_top"><img src="https://www.example.com/ads" border="0"></a>"#
    );
  }

  #[test]
  fn host_macro_resolves_multiple_paths_and_upgrades_http() {
    let snippet = r#"<a href="%c%u" target="_top"><img src="%h/ads1" border="0">%h/ads2</a>"#;
    let preview = r#"<a href="https://www.example.com" target="_top"><img src="https://www.example.com/ads1" border="0">http://www.example.com/ads2</a>"#;
    assert_eq!(
      rw().resolve_host_macro(snippet, preview, DEFAULT_AD_HOST),
      r#"<a href="%c%u" target="_top"><img src="https://www.example.com/ads1" border="0">https://www.example.com/ads2</a>"#
    );
  }

  #[test]
  fn host_macro_falls_back_to_default_ad_host() {
    let out = rw().resolve_host_macro("<img src=\"%h/pixel;sz=1x1\">", "<html></html>", DEFAULT_AD_HOST);
    assert_eq!(out, "<img src=\"https://ad.doubleclick.net/pixel;sz=1x1\">");
  }

  #[test]
  fn percent_http_is_not_a_host_macro() {
    let snippet = r#"<img src="%https://www.example.com">"#;
    assert!(!contains_host_macro(snippet));
    assert_eq!(
      rw().resolve_host_macro(snippet, r#"<img src="https://www.example.com">"#, DEFAULT_AD_HOST),
      snippet
    );
  }

  #[test]
  fn template_value_upgrades_only_when_snippet_is_secure() {
    let r = rw();
    assert_eq!(
      r.upgrade_template_value("http://www.example.com/ads", r#"<img src="https://www.example.com/ads">"#),
      Some("https://www.example.com/ads".to_string())
    );
    assert_eq!(
      r.upgrade_template_value("http://www.example.net/ads", r#"<img src="https://www.example.com/ads">"#),
      None
    );
    assert_eq!(r.upgrade_template_value("plain text", "<img>"), None);
  }
}
