//! HTTP widget source.
//!
//! Treats the remote player page as plain HTML: a navigation fetches the page
//! with caching disabled and polls until the player container and its
//! `<iframe>` show up. Stills are fetched by an ordered list of strategies:
//!
//! 1. `EmbedSnapshot`: the iframe source itself serves an image
//! 2. `ContainerPoster`: the poster / snapshot image advertised on the page
//!
//! This source spawns no helper processes; `shutdown` only drops page state.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::io::Read;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use url::Url;

use super::{first_success, CaptureStrategy, VideoSource, WidgetPage, WidgetRect};

const DEFAULT_CONTAINER_ID: &str = "ModalBodyPlayer";
const MAX_PAGE_BYTES: u64 = 2 * 1024 * 1024;
const MAX_IMAGE_BYTES: u64 = 16 * 1024 * 1024;

/// Configuration for an HTTP widget source.
#[derive(Clone, Debug)]
pub struct HttpSourceConfig {
    /// Element id of the player container that must be present on the page.
    pub container_id: String,
    /// Upper bound on waiting for the container and iframe after navigation.
    pub load_timeout: Duration,
    /// Delay between page polls while waiting.
    pub poll_interval: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Geometry assumed when the iframe does not state pixel dimensions.
    pub viewport: WidgetRect,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            container_id: DEFAULT_CONTAINER_ID.to_string(),
            load_timeout: Duration::from_secs(25),
            poll_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
            viewport: WidgetRect {
                width: 1920.0,
                height: 1080.0,
            },
        }
    }
}

pub struct HttpWidgetSource {
    config: HttpSourceConfig,
    agent: ureq::Agent,
    page: Option<WidgetPage>,
    strategies: Vec<Box<dyn CaptureStrategy>>,
}

impl HttpWidgetSource {
    pub fn new(config: HttpSourceConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(config.request_timeout)
            .build();
        let strategies: Vec<Box<dyn CaptureStrategy>> = vec![
            Box::new(EmbedSnapshot {
                agent: agent.clone(),
            }),
            Box::new(ContainerPoster {
                agent: agent.clone(),
            }),
        ];
        Self {
            config,
            agent,
            page: None,
            strategies,
        }
    }

    fn fetch_page(&self, address: &str) -> Result<Option<WidgetPage>> {
        let response = self
            .agent
            .get(address)
            .set("Cache-Control", "no-cache")
            .set("Pragma", "no-cache")
            .call()
            .with_context(|| format!("fetch widget page {}", address))?;
        let mut html = String::new();
        response
            .into_reader()
            .take(MAX_PAGE_BYTES)
            .read_to_string(&mut html)
            .context("read widget page")?;
        parse_page(address, &html, &self.config.container_id, self.config.viewport)
    }
}

impl VideoSource for HttpWidgetSource {
    fn name(&self) -> &'static str {
        "http"
    }

    fn navigate(&mut self, address: &str) -> Result<()> {
        self.page = None;
        let deadline = Instant::now() + self.config.load_timeout;
        loop {
            let last_error = match self.fetch_page(address) {
                Ok(Some(page)) => {
                    log::info!(
                        "HttpWidgetSource: {} loaded (embed={})",
                        address,
                        page.embed_src.as_deref().unwrap_or("-")
                    );
                    self.page = Some(page);
                    return Ok(());
                }
                Ok(None) => anyhow!("player container or iframe not present"),
                Err(err) => err,
            };
            if Instant::now() >= deadline {
                return Err(last_error.context(format!(
                    "widget page {} not ready after {:?}",
                    address, self.config.load_timeout
                )));
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    fn embed_source(&self) -> Option<&str> {
        self.page.as_ref().and_then(|page| page.embed_src.as_deref())
    }

    fn widget_rect(&mut self) -> Result<WidgetRect> {
        let page = self
            .page
            .as_ref()
            .ok_or_else(|| anyhow!("http source not navigated"))?;
        page.rect
            .ok_or_else(|| anyhow!("widget geometry unknown"))
    }

    fn raw_frame(&mut self) -> Result<Vec<u8>> {
        let page = self
            .page
            .as_ref()
            .ok_or_else(|| anyhow!("http source not navigated"))?;
        first_success(&mut self.strategies, page)
    }

    fn shutdown(&mut self) -> Result<()> {
        self.page = None;
        Ok(())
    }
}

struct EmbedSnapshot {
    agent: ureq::Agent,
}

impl CaptureStrategy for EmbedSnapshot {
    fn name(&self) -> &'static str {
        "embed-snapshot"
    }

    fn produce_raw_frame(&mut self, page: &WidgetPage) -> Result<Vec<u8>> {
        let src = page
            .embed_src
            .as_deref()
            .ok_or_else(|| anyhow!("page has no embedded player"))?;
        fetch_image(&self.agent, src)
    }
}

struct ContainerPoster {
    agent: ureq::Agent,
}

impl CaptureStrategy for ContainerPoster {
    fn name(&self) -> &'static str {
        "container-poster"
    }

    fn produce_raw_frame(&mut self, page: &WidgetPage) -> Result<Vec<u8>> {
        let poster = page
            .poster
            .as_deref()
            .ok_or_else(|| anyhow!("page advertises no poster image"))?;
        fetch_image(&self.agent, poster)
    }
}

fn fetch_image(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .set("Cache-Control", "no-cache")
        .call()
        .with_context(|| format!("fetch snapshot from {}", url))?;
    let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
    if !content_type.starts_with("image/") {
        return Err(anyhow!(
            "{} served '{}' instead of an image",
            url,
            content_type
        ));
    }
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_IMAGE_BYTES + 1)
        .read_to_end(&mut bytes)
        .context("read snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty snapshot"));
    }
    if bytes.len() as u64 > MAX_IMAGE_BYTES {
        return Err(anyhow!("snapshot larger than {} bytes", MAX_IMAGE_BYTES));
    }
    Ok(bytes)
}

fn iframe_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<iframe\b[^>]*>").expect("static regex"))
}

fn poster_attr() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\b(?:poster|data-snapshot)\s*=\s*["']([^"']+)["']"#)
            .expect("static regex")
    })
}

fn attribute<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let pattern = format!(r#"(?i)\s{}\s*=\s*["']([^"']*)["']"#, regex::escape(name));
    let re = Regex::new(&pattern).ok()?;
    re.captures(tag)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
}

fn pixel_length(value: Option<&str>) -> Option<f64> {
    let value = value?.trim();
    let value = value.strip_suffix("px").unwrap_or(value);
    value.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0)
}

fn resolve(base: &Url, reference: &str) -> Option<String> {
    if reference.starts_with("about:") {
        return Some(reference.to_string());
    }
    base.join(reference).ok().map(|u| u.to_string())
}

/// Extract player state from a widget page; `None` while the page is not
/// ready (container or iframe missing).
fn parse_page(
    address: &str,
    html: &str,
    container_id: &str,
    viewport: WidgetRect,
) -> Result<Option<WidgetPage>> {
    let base = Url::parse(address).with_context(|| format!("parse widget address {}", address))?;
    let container = Regex::new(&format!(
        r#"(?i)\bid\s*=\s*["']{}["']"#,
        regex::escape(container_id)
    ))
    .context("build container pattern")?;
    if !container.is_match(html) {
        return Ok(None);
    }
    let Some(tag) = iframe_tag().find(html).map(|m| m.as_str()) else {
        return Ok(None);
    };

    let embed_src = attribute(tag, "src").and_then(|src| {
        if src.is_empty() {
            None
        } else {
            resolve(&base, src)
        }
    });
    let rect = WidgetRect {
        width: pixel_length(attribute(tag, "width")).unwrap_or(viewport.width),
        height: pixel_length(attribute(tag, "height")).unwrap_or(viewport.height),
    };
    let poster = poster_attr()
        .captures(html)
        .and_then(|caps| caps.get(1))
        .and_then(|m| resolve(&base, m.as_str()));

    Ok(Some(WidgetPage {
        address: address.to_string(),
        embed_src,
        poster,
        rect: Some(rect),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIEWPORT: WidgetRect = WidgetRect {
        width: 1920.0,
        height: 1080.0,
    };

    #[test]
    fn page_without_container_is_not_ready() -> Result<()> {
        let html = r#"<div id="Other"><iframe src="/embed/1"></iframe></div>"#;
        assert_eq!(
            parse_page("http://cams.local/city", html, "ModalBodyPlayer", VIEWPORT)?,
            None
        );
        Ok(())
    }

    #[test]
    fn iframe_src_and_geometry_are_extracted() -> Result<()> {
        let html = r#"
            <div id="ModalBodyPlayer" data-snapshot="/snap/42.jpg">
              <iframe width="640" height="360px" src="/embed/42?autoplay=1"></iframe>
            </div>"#;
        let page = parse_page("http://cams.local/city#42", html, "ModalBodyPlayer", VIEWPORT)?
            .expect("page ready");
        assert_eq!(
            page.embed_src.as_deref(),
            Some("http://cams.local/embed/42?autoplay=1")
        );
        assert_eq!(page.poster.as_deref(), Some("http://cams.local/snap/42.jpg"));
        assert_eq!(
            page.rect,
            Some(WidgetRect {
                width: 640.0,
                height: 360.0
            })
        );
        Ok(())
    }

    #[test]
    fn relative_sizes_fall_back_to_viewport() -> Result<()> {
        let html = r#"<div id='ModalBodyPlayer'><iframe src="about:blank" width="100%"></iframe></div>"#;
        let page = parse_page("http://cams.local/", html, "ModalBodyPlayer", VIEWPORT)?
            .expect("page ready");
        assert_eq!(page.rect, Some(VIEWPORT));
        assert_eq!(page.embed_src.as_deref(), Some("about:blank"));
        assert!(!super::super::is_usable_embed(page.embed_src.as_deref()));
        Ok(())
    }
}
