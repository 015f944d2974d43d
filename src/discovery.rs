//! `go-import` discovery documents.
//!
//! Tooling that resolves a vanity import path fetches it with `?go-get=1`
//! and looks for `<meta name="go-import" content="prefix vcs url">` tags.
//! One tag is emitted per mapping, in the order given.

use crate::cache::MappingEntry;

/// Render a discovery document for `entries` as served from `host`.
///
/// Each entry binds `<host>/<import_path>` to `<scheme>://<host><repo_location>`.
/// An empty input yields an empty `<head></head>`.
pub fn render_go_import<'a, I>(host: &str, scheme: &str, entries: I) -> String
where
    I: IntoIterator<Item = &'a MappingEntry>,
{
    let mut doc = String::from("<head>");
    for entry in entries {
        let prefix = escape_attr(&format!("{host}/{}", entry.import_path));
        let url = escape_attr(&format!("{scheme}://{host}{}", entry.repo_location));
        doc.push_str(&format!(
            r#"<meta name="go-import" content="{prefix} git {url}">"#
        ));
    }
    doc.push_str("</head>");
    doc
}

/// Escape the characters that would break out of a double-quoted attribute.
fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cache_renders_empty_head() {
        assert_eq!(render_go_import("gopin.example", "http", std::iter::empty()), "<head></head>");
    }

    #[test]
    fn single_entry() {
        let entry = MappingEntry::new(
            "github.com/owner/repo/0123456789abcdef0123456789abcdef01234567",
            "/github.com/owner/repo/0123456789abcdef0123456789abcdef01234567",
        );
        let doc = render_go_import("gopin.example", "http", [&entry]);
        assert_eq!(
            doc,
            "<head><meta name=\"go-import\" content=\"\
             gopin.example/github.com/owner/repo/0123456789abcdef0123456789abcdef01234567 \
             git \
             http://gopin.example/github.com/owner/repo/0123456789abcdef0123456789abcdef01234567\
             \"></head>"
        );
    }

    #[test]
    fn preserves_input_order() {
        let entries = vec![
            MappingEntry::new("b", "/b"),
            MappingEntry::new("a", "/a"),
        ];
        let doc = render_go_import("h", "https", &entries);
        let b = doc.find("h/b git https://h/b").unwrap();
        let a = doc.find("h/a git https://h/a").unwrap();
        assert!(b < a);
        assert_eq!(doc.matches("<meta ").count(), 2);
    }

    #[test]
    fn host_cannot_break_out_of_attribute() {
        let entry = MappingEntry::new("p", "/p");
        let doc = render_go_import("evil\"><script>", "http", [&entry]);
        assert!(!doc.contains("<script>"));
        assert!(doc.contains("evil&quot;&gt;&lt;script&gt;/p"));
    }
}
