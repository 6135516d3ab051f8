use crate::config::{SiteConfig, IMAGE_PLACEHOLDER};
use crate::error::ImageError;
use crate::images::ImageCache;
use crate::models::{Question, UserProfile};
use anyhow::{Context, Result};
use html_escape::{decode_html_entities, encode_double_quoted_attribute};
use lol_html::errors::AttributeNameError;
use lol_html::html_content::Element;
use lol_html::{element, rewrite_str, RewriteStrSettings};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::borrow::Cow;
use std::cell::Cell;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Bytes left alone in a path segment: the RFC 3986 unreserved set.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Prefix every locally stored image is referenced by.
pub const IMAGES_PREFIX: &str = "../static/images/";

/// What a hyperlink in a post points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    Question(i64),
    Answer(i64),
    TagListing(String),
    User(i64),
    /// Same community, but no offline page exists for it
    SiteOther(String),
    Foreign,
    /// Already offline-relative (or a bare fragment); left alone
    Relative,
}

/// Rewrites links and images in post HTML so the pages work offline.
///
/// Shared immutably by every worker.
pub struct ContentRewriter {
    domain: String,
    base: Url,
    user_profiles: bool,
    external_links: bool,
    images: Option<Arc<ImageCache>>,
}

impl ContentRewriter {
    /// `images` is `None` when image fetching is disabled.
    pub fn new(config: &SiteConfig, images: Option<Arc<ImageCache>>) -> Result<Self> {
        let base = Url::parse(&format!("https://{}/", config.domain))
            .with_context(|| format!("Invalid site domain: {}", config.domain))?;
        Ok(Self {
            domain: config.domain.clone(),
            base,
            user_profiles: config.user_profiles,
            external_links: config.external_links,
            images,
        })
    }

    pub fn classify(&self, href: &str) -> LinkTarget {
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') {
            return LinkTarget::Relative;
        }

        let url = match Url::parse(href) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let candidate = if href.starts_with('/') {
                    self.base.join(href)
                } else if self.names_site(href) {
                    Url::parse(&format!("https://{}", href))
                } else {
                    return LinkTarget::Relative;
                };
                match candidate {
                    Ok(url) => url,
                    Err(_) => return LinkTarget::Foreign,
                }
            }
            Err(_) => return LinkTarget::Foreign,
        };

        if !matches!(url.scheme(), "http" | "https") {
            return LinkTarget::Foreign;
        }
        match url.host_str() {
            Some(host) if host.eq_ignore_ascii_case(&self.domain) => self.classify_path(&url),
            _ => LinkTarget::Foreign,
        }
    }

    fn names_site(&self, href: &str) -> bool {
        href.get(..self.domain.len())
            .map(|prefix| prefix.eq_ignore_ascii_case(&self.domain))
            .unwrap_or(false)
            && matches!(href.as_bytes().get(self.domain.len()), None | Some(b'/'))
    }

    fn classify_path(&self, url: &Url) -> LinkTarget {
        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();

        match segments.as_slice() {
            ["questions", "tagged", tag, ..] => LinkTarget::TagListing(unquote(tag)),
            ["q" | "questions", id, ..] => match id.parse::<i64>() {
                Ok(question) => {
                    // `/questions/<q>/<title>/<a>#<a>` cites an answer directly
                    let cited = segments
                        .last()
                        .filter(|last| Some(**last) == url.fragment())
                        .and_then(|last| last.parse().ok());
                    cited
                        .map(LinkTarget::Answer)
                        .unwrap_or(LinkTarget::Question(question))
                }
                Err(_) => self.site_other(url),
            },
            ["a", id, ..] => match id.parse() {
                Ok(answer) => LinkTarget::Answer(answer),
                Err(_) => self.site_other(url),
            },
            ["users", id, ..] if self.user_profiles => match id.parse() {
                Ok(user) => LinkTarget::User(user),
                Err(_) => self.site_other(url),
            },
            _ => self.site_other(url),
        }
    }

    fn site_other(&self, url: &Url) -> LinkTarget {
        let mut absolute = url.clone();
        let _ = absolute.set_scheme("https");
        LinkTarget::SiteOther(absolute.to_string())
    }

    /// New `href` for a link: `Some(value)` to set, `None` to drop the attribute.
    /// Returns the original text when the link needs no change.
    pub fn link_href<'a>(&self, href: &'a str) -> Option<Cow<'a, str>> {
        match self.classify(href) {
            LinkTarget::Question(id) => Some(Cow::Owned(format!("../element/{}", id))),
            LinkTarget::Answer(id) => Some(Cow::Owned(format!("../element/{}#a{}", id, id))),
            LinkTarget::TagListing(tag) => {
                Some(Cow::Owned(format!("../tag/{}/1", quote_segment(&tag))))
            }
            LinkTarget::User(id) => Some(Cow::Owned(format!("../user/{}", id))),
            LinkTarget::SiteOther(absolute) => self.external_links.then_some(Cow::Owned(absolute)),
            LinkTarget::Foreign => self.external_links.then_some(Cow::Borrowed(href)),
            LinkTarget::Relative => Some(Cow::Borrowed(href)),
        }
    }

    /// Returns whether the element changed.
    fn rewrite_anchor(&self, el: &mut Element) -> Result<bool, AttributeNameError> {
        let Some(raw) = el.get_attribute("href") else {
            return Ok(false);
        };
        let href = decode_html_entities(&raw);

        match self.link_href(&href) {
            Some(Cow::Borrowed(_)) => Ok(false),
            Some(Cow::Owned(new)) => {
                el.set_attribute("href", &encode_double_quoted_attribute(&new))?;
                Ok(true)
            }
            None => {
                el.remove_attribute("href");
                Ok(true)
            }
        }
    }

    fn rewrite_img(&self, el: &mut Element) -> Result<bool, AttributeNameError> {
        let Some(raw) = el.get_attribute("src") else {
            return Ok(false);
        };
        let Some(cache) = &self.images else {
            el.set_attribute("src", "")?;
            return Ok(true);
        };

        let src = decode_html_entities(&raw);
        if src.starts_with(IMAGES_PREFIX) || src == IMAGE_PLACEHOLDER {
            return Ok(false);
        }

        let placed = self
            .absolute_image_url(&src)
            .ok_or_else(|| ImageError::NotAnImage {
                url: src.to_string(),
            })
            .and_then(|url| cache.place(&url));
        match placed {
            Ok(filename) => {
                el.set_attribute("src", &format!("{}{}", IMAGES_PREFIX, filename))?;
                if !el.has_attribute("style") {
                    el.set_attribute("style", "max-width:100%")?;
                }
            }
            Err(e) => {
                debug!(src = %src, error = %e, "Using placeholder image");
                el.set_attribute("src", IMAGE_PLACEHOLDER)?;
            }
        }
        Ok(true)
    }

    fn absolute_image_url(&self, src: &str) -> Option<String> {
        if src.starts_with("//") {
            return Some(src.to_string());
        }
        match Url::parse(src) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Some(src.to_string()),
            Ok(_) => None,
            Err(url::ParseError::RelativeUrlWithoutBase) if src.starts_with('/') => {
                self.base.join(src).ok().map(String::from)
            }
            Err(_) => None,
        }
    }

    /// Runs the tokenizer over `html`, rewriting anchors and/or images. Markup
    /// that needs no change comes back borrowed and byte-identical.
    fn rewrite<'a>(&self, html: &'a str, links: bool, images: bool) -> Cow<'a, str> {
        if !html.contains('<') {
            return Cow::Borrowed(html);
        }
        let changed = Cell::new(false);
        let mut handlers = Vec::with_capacity(2);
        if links {
            handlers.push(element!("a[href]", |el| {
                if self.rewrite_anchor(el)? {
                    changed.set(true);
                }
                Ok(())
            }));
        }
        if images {
            handlers.push(element!("img[src]", |el| {
                if self.rewrite_img(el)? {
                    changed.set(true);
                }
                Ok(())
            }));
        }

        let rewritten = rewrite_str(
            html,
            RewriteStrSettings {
                element_content_handlers: handlers,
                ..RewriteStrSettings::default()
            },
        );
        match rewritten {
            Ok(out) if changed.get() => Cow::Owned(out),
            Ok(_) => Cow::Borrowed(html),
            Err(e) => {
                warn!(error = %e, "Leaving markup that could not be rewritten");
                Cow::Borrowed(html)
            }
        }
    }

    /// Rewrites every anchor. Text without anchors comes back borrowed and unchanged.
    pub fn rewrite_links<'a>(&self, html: &'a str) -> Cow<'a, str> {
        self.rewrite(html, true, false)
    }

    pub fn rewrite_images<'a>(&self, html: &'a str) -> Cow<'a, str> {
        self.rewrite(html, false, true)
    }

    pub fn rewrite_html<'a>(&self, html: &'a str) -> Cow<'a, str> {
        self.rewrite(html, true, true)
    }

    fn rewrite_in_place(&self, html: &mut String) {
        if let Cow::Owned(rewritten) = self.rewrite_html(html) {
            *html = rewritten;
        }
    }

    /// Rewrites the question body, its answers, and every comment.
    pub fn rewrite_question(&self, question: &mut Question) {
        self.rewrite_in_place(&mut question.body);
        for comment in &mut question.comments {
            self.rewrite_in_place(&mut comment.text);
        }
        for answer in &mut question.answers {
            self.rewrite_in_place(&mut answer.body);
            for comment in &mut answer.comments {
                self.rewrite_in_place(&mut comment.text);
            }
        }
    }

    /// Wraps and rewrites the "about me" text; only profile pages show it.
    pub fn rewrite_profile(&self, profile: &mut UserProfile) {
        if !self.user_profiles {
            return;
        }
        if let Some(about) = profile.about_me.take() {
            let mut wrapped = format!("<p>{}</p>", about);
            self.rewrite_in_place(&mut wrapped);
            profile.about_me = Some(wrapped);
        }
    }
}

/// Percent-encodes a single URL path segment.
pub fn quote_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}

/// Decodes `%XX` escapes; malformed escapes are kept literally.
pub fn unquote(segment: &str) -> String {
    percent_decode_str(segment).decode_utf8_lossy().into_owned()
}
