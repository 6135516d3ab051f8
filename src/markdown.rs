use crate::config::COMMENT_PLACEHOLDER;
use pulldown_cmark::{html, Options, Parser};

/// Converts comment markup to HTML. Implementations must be shareable across workers.
pub trait MarkdownConverter: Send + Sync {
    fn to_html(&self, text: &str) -> String;
}

/// CommonMark with the extensions comment authors commonly rely on.
#[derive(Debug, Clone, Copy)]
pub struct CommonMark {
    options: Options,
}

impl CommonMark {
    pub fn new() -> Self {
        let mut options = Options::empty();
        options.insert(Options::ENABLE_STRIKETHROUGH);
        options.insert(Options::ENABLE_TABLES);
        Self { options }
    }
}

impl Default for CommonMark {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkdownConverter for CommonMark {
    fn to_html(&self, text: &str) -> String {
        let parser = Parser::new_ext(text, self.options);
        let mut out = String::with_capacity(text.len() + text.len() / 2);
        html::push_html(&mut out, parser);
        out
    }
}

/// Comment text as inline HTML: the outer paragraph is unwrapped, and an
/// empty result becomes the placeholder.
pub fn comment_html(converter: &dyn MarkdownConverter, text: &str) -> String {
    let converted = converter.to_html(text);
    let trimmed = converted.trim_end();
    let inner = trimmed
        .strip_prefix("<p>")
        .and_then(|s| s.strip_suffix("</p>"))
        .unwrap_or(trimmed);
    if inner.trim().is_empty() {
        COMMENT_PLACEHOLDER.to_string()
    } else {
        inner.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paragraph_is_unwrapped() {
        let md = CommonMark::new();
        assert_eq!(comment_html(&md, "plain *text*"), "plain <em>text</em>");
    }

    #[test]
    fn inline_code_survives() {
        let md = CommonMark::new();
        assert_eq!(
            comment_html(&md, "use `Vec::new()`"),
            "use <code>Vec::new()</code>"
        );
    }

    #[test]
    fn empty_comment_becomes_placeholder() {
        let md = CommonMark::new();
        assert_eq!(comment_html(&md, ""), COMMENT_PLACEHOLDER);
        assert_eq!(comment_html(&md, "   \n"), COMMENT_PLACEHOLDER);
    }

    #[test]
    fn links_are_rendered() {
        let md = CommonMark::new();
        let html = comment_html(&md, "see [this](https://site.com/q/1)");
        assert_eq!(html, r#"see <a href="https://site.com/q/1">this</a>"#);
    }

    #[test]
    fn multi_paragraph_keeps_inner_breaks() {
        let md = CommonMark::new();
        let html = comment_html(&md, "one\n\ntwo");
        assert_eq!(html, "one</p>\n<p>two");
    }
}
