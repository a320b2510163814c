//! HTTP site crawler and homepage name derivation.
//!
//! The crawler fetches the homepage, follows same-host links with a
//! bounded fan-out, and reduces HTML to a markdown-ish text body. A
//! homepage that answers with an anti-bot challenge yields
//! [`SourceError::Blocked`] so the fan-out can branch to a fallback
//! crawler when one is configured.

use super::SiteCrawler;
use crate::errors::SourceError;
use crate::model::{Company, CrawledPage};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;

/// Pages fetched per site, homepage included.
const MAX_PAGES: usize = 12;

/// Per-request timeout.
const FETCH_TIMEOUT_SECS: u64 = 20;

/// Challenge-page markers that indicate a bot gate rather than content.
const BLOCK_MARKERS: &[&str] = &[
    "cf-challenge",
    "captcha",
    "access denied",
    "are you a human",
    "enable javascript and cookies",
];

pub struct HttpCrawler {
    http: reqwest::Client,
    concurrency: usize,
}

impl HttpCrawler {
    pub fn new(concurrency: usize) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .user_agent("Mozilla/5.0 (compatible; prospect/0.1)")
            .build()
            .unwrap_or_default();
        Self { http, concurrency }
    }

    async fn fetch(&self, url: &str) -> Result<String, SourceError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| SourceError::Http {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|source| SourceError::Http {
            url: url.to_string(),
            source,
        })?;

        if status.as_u16() == 403 || status.as_u16() == 503 || looks_blocked(&body) {
            return Err(SourceError::Blocked {
                url: url.to_string(),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl SiteCrawler for HttpCrawler {
    async fn crawl(&self, company: &Company) -> Result<Vec<CrawledPage>, SourceError> {
        let base = normalize_url(&company.url);
        let homepage_html = self.fetch(&base).await?;

        let host = company.host().unwrap_or_default();
        let mut links = extract_links(&homepage_html, &base, &host);
        links.truncate(MAX_PAGES.saturating_sub(1));

        let mut pages = vec![page_from_html(&base, &homepage_html)];

        let fetched: Vec<Option<CrawledPage>> = stream::iter(links)
            .map(|link| async move {
                match self.fetch(&link).await {
                    Ok(html) => Some(page_from_html(&link, &html)),
                    Err(err) => {
                        tracing::debug!(url = %link, %err, "page fetch failed");
                        None
                    }
                }
            })
            .buffer_unordered(self.concurrency.max(1))
            .collect()
            .await;

        pages.extend(fetched.into_iter().flatten());
        Ok(pages)
    }

    async fn probe_name(&self, url: &str) -> Result<Option<String>, SourceError> {
        let html = self.fetch(&normalize_url(url)).await?;
        Ok(derive_name_from_html(&html, url))
    }
}

/// Ensure the URL has a scheme.
pub fn normalize_url(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

fn looks_blocked(html: &str) -> bool {
    let lowered = html.to_lowercase();
    BLOCK_MARKERS.iter().any(|m| lowered.contains(m))
}

fn regexes() -> &'static (Regex, Regex, Regex, Regex, Regex) {
    static RE: OnceLock<(Regex, Regex, Regex, Regex, Regex)> = OnceLock::new();
    RE.get_or_init(|| {
        (
            Regex::new(r#"(?is)<title[^>]*>(.*?)</title>"#).unwrap(),
            Regex::new(r#"(?i)<meta[^>]+property=["']og:site_name["'][^>]+content=["']([^"']+)["']"#)
                .unwrap(),
            Regex::new(r#"(?i)<a[^>]+href=["']([^"'#]+)["']"#).unwrap(),
            Regex::new(r"(?is)<(script|style|noscript)[^>]*>.*?</(script|style|noscript)>").unwrap(),
            Regex::new(r"<[^>]+>").unwrap(),
        )
    })
}

/// Pull a company name out of homepage HTML: `og:site_name` first, then
/// the `<title>` with separator suffixes stripped, then the bare host.
pub fn derive_name_from_html(html: &str, url: &str) -> Option<String> {
    let (title_re, og_re, ..) = {
        let r = regexes();
        (&r.0, &r.1)
    };

    if let Some(cap) = og_re.captures(html) {
        let name = cap[1].trim().to_string();
        if !name.is_empty() {
            return Some(name);
        }
    }

    if let Some(cap) = title_re.captures(html) {
        let raw = cap[1].trim();
        // "Acme Industrial | Precision Machining" -> "Acme Industrial"
        let head = raw
            .split(['|', '–', '—'])
            .next()
            .map(str::trim)
            .unwrap_or(raw);
        let head = head.split(" - ").next().map(str::trim).unwrap_or(head);
        if !head.is_empty() && head.len() < 120 {
            return Some(head.to_string());
        }
    }

    let stripped = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    let host = stripped.split('/').next()?;
    let host = host.strip_prefix("www.").unwrap_or(host);
    let stem = host.split('.').next()?;
    if stem.is_empty() {
        None
    } else {
        Some(stem.to_string())
    }
}

/// Same-host links from homepage HTML, absolutized and deduplicated,
/// skipping asset and fragment URLs.
pub fn extract_links(html: &str, base: &str, host: &str) -> Vec<String> {
    let link_re = &regexes().2;
    let base = base.trim_end_matches('/');
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for cap in link_re.captures_iter(html) {
        let href = cap[1].trim();
        if href.is_empty()
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
            || href.starts_with("javascript:")
        {
            continue;
        }
        let absolute = if href.starts_with("http://") || href.starts_with("https://") {
            if !href.contains(host) {
                continue;
            }
            href.to_string()
        } else if href.starts_with('/') {
            format!("{base}{href}")
        } else {
            continue;
        };

        let lowered = absolute.to_lowercase();
        if [".pdf", ".jpg", ".jpeg", ".png", ".gif", ".svg", ".css", ".js", ".ico"]
            .iter()
            .any(|ext| lowered.ends_with(ext))
        {
            continue;
        }
        if absolute.trim_end_matches('/') == base {
            continue;
        }
        if seen.insert(absolute.clone()) {
            links.push(absolute);
        }
    }
    links
}

/// Reduce an HTML document to a titled markdown-ish page.
pub fn page_from_html(url: &str, html: &str) -> CrawledPage {
    let (title_re, _, _, strip_re, tag_re) = {
        let r = regexes();
        (&r.0, &r.1, &r.2, &r.3, &r.4)
    };

    let title = title_re
        .captures(html)
        .map(|c| decode_entities(c[1].trim()))
        .unwrap_or_else(|| url.to_string());

    let without_blocks = strip_re.replace_all(html, " ");
    let text = tag_re.replace_all(&without_blocks, " ");
    let content = decode_entities(&collapse_whitespace(&text));

    CrawledPage::new(url, &title, &content)
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = true;
    for c in text.chars() {
        if c.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.push(c);
            last_space = false;
        }
    }
    out.trim().to_string()
}

fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOMEPAGE: &str = r#"
        <html><head>
        <title>Acme Industrial | Precision Machining</title>
        <meta property="og:site_name" content="Acme Industrial Inc">
        </head><body>
        <script>var x = 1;</script>
        <a href="/about">About</a>
        <a href="/services">Services</a>
        <a href="/about">About again</a>
        <a href="https://acme.com/contact">Contact</a>
        <a href="https://other-site.com/page">Elsewhere</a>
        <a href="/brochure.pdf">Brochure</a>
        <a href="mailto:info@acme.com">Email</a>
        <p>We machine parts &amp; assemblies.</p>
        </body></html>
    "#;

    #[test]
    fn name_prefers_og_site_name() {
        assert_eq!(
            derive_name_from_html(HOMEPAGE, "https://acme.com").as_deref(),
            Some("Acme Industrial Inc")
        );
    }

    #[test]
    fn name_falls_back_to_title_head() {
        let html = "<title>Acme Industrial | Precision Machining</title>";
        assert_eq!(
            derive_name_from_html(html, "https://acme.com").as_deref(),
            Some("Acme Industrial")
        );
    }

    #[test]
    fn name_falls_back_to_host_stem() {
        assert_eq!(
            derive_name_from_html("<html></html>", "https://www.acme-industrial.com").as_deref(),
            Some("acme-industrial")
        );
    }

    #[test]
    fn links_are_same_host_deduplicated_and_filtered() {
        let links = extract_links(HOMEPAGE, "https://acme.com", "acme.com");
        assert_eq!(
            links,
            vec![
                "https://acme.com/about",
                "https://acme.com/services",
                "https://acme.com/contact",
            ]
        );
    }

    #[test]
    fn page_from_html_strips_scripts_and_tags() {
        let page = page_from_html("https://acme.com", HOMEPAGE);
        assert_eq!(page.title, "Acme Industrial | Precision Machining");
        assert!(page.content.contains("We machine parts & assemblies."));
        assert!(!page.content.contains("var x"));
        assert!(!page.content.contains('<'));
    }

    #[test]
    fn blocked_markers_are_detected() {
        assert!(looks_blocked("<html>Please complete the CAPTCHA to continue</html>"));
        assert!(looks_blocked("Checking your browser... enable JavaScript and cookies"));
        assert!(!looks_blocked(HOMEPAGE));
    }

    #[test]
    fn normalize_url_adds_scheme() {
        assert_eq!(normalize_url("acme.com"), "https://acme.com");
        assert_eq!(normalize_url("https://acme.com"), "https://acme.com");
    }
}
