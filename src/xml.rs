//! Minimal XML tag writer used to build TiVoConnect container/item responses.
//!
//! The original built these with raw string formatting and `cgi.escape`; we
//! keep that directness rather than pulling in a templating engine, matching
//! the size and shape of the documents TiVo expects.

/// Escapes the five XML predefined entities. Mirrors `cgi.escape(s, True)`.
pub(crate) fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Builds a single `<Tag>value</Tag>` element with escaped content, or an
/// empty string if `value` is `None`.
pub(crate) fn tag(name: &str, value: Option<&str>) -> String {
    match value {
        Some(v) => format!("<{name}>{}</{name}>\n", escape(v)),
        None => String::new(),
    }
}

pub(crate) struct XmlBuilder {
    buf: String,
}

impl XmlBuilder {
    pub(crate) fn new() -> XmlBuilder {
        XmlBuilder {
            buf: String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n"),
        }
    }

    pub(crate) fn push_raw(&mut self, s: &str) -> &mut Self {
        self.buf.push_str(s);
        self
    }

    pub(crate) fn push_tag(&mut self, name: &str, value: Option<&str>) -> &mut Self {
        self.buf.push_str(&tag(name, value));
        self
    }

    pub(crate) fn open(&mut self, name: &str) -> &mut Self {
        self.buf.push('<');
        self.buf.push_str(name);
        self.buf.push_str(">\n");
        self
    }

    pub(crate) fn close(&mut self, name: &str) -> &mut Self {
        self.buf.push_str("</");
        self.buf.push_str(name);
        self.buf.push_str(">\n");
        self
    }

    pub(crate) fn finish(self) -> String {
        self.buf
    }
}

impl Default for XmlBuilder {
    fn default() -> Self {
        XmlBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape() {
        assert_eq!(escape("Tom & Jerry <1>"), "Tom &amp; Jerry &lt;1&gt;");
    }

    #[test]
    fn test_tag_none_is_empty() {
        assert_eq!(tag("Foo", None), "");
    }

    #[test]
    fn test_builder_nesting() {
        let mut b = XmlBuilder::new();
        b.open("TiVoContainer")
            .open("Details")
            .push_tag("Title", Some("Root"))
            .close("Details");
        b.close("TiVoContainer");
        let out = b.finish();
        assert!(out.contains("<Title>Root</Title>"));
        assert!(out.starts_with("<?xml"));
    }
}
