use super::{Converter, Converters, Link, Representation};
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use quick_xml::Reader;
use quick_xml::events::Event;
use scraper::{Html, Selector};
use serde_json::Value;
use trawl_model::OutputType;

/// Elements whose text is never shown to a reader.
const INVISIBLE: [&str; 4] = ["script", "style", "noscript", "template"];

pub(super) fn register(converters: &mut Converters) {
    for mime in ["text/plain", "text/csv", "text/markdown", "text/x-markdown"] {
        converters.register(OutputType::Text, Some(mime), Converter::Content(plain));
    }
    converters.register(OutputType::Text, Some("text/html"), Converter::Content(html_text));
    converters.register(OutputType::Text, Some("application/xhtml+xml"), Converter::Content(html_text));
    converters.register(OutputType::Links, Some("text/html"), Converter::Content(html_links));
    converters.register(OutputType::Text, Some("application/json"), Converter::Content(json_text));
    for mime in ["application/xml", "text/xml"] {
        converters.register(OutputType::Text, Some(mime), Converter::Content(xml_text));
    }
}

fn plain(content: &[u8]) -> Result<Representation> {
    Ok(Representation::Text(String::from_utf8_lossy(content).into_owned()))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn html_text(content: &[u8]) -> Result<Representation> {
    let document = Html::parse_document(&String::from_utf8_lossy(content));
    let mut parts = Vec::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else { continue };
        let hidden = node
            .parent()
            .and_then(|parent| parent.value().as_element().map(|e| INVISIBLE.contains(&e.name())))
            .unwrap_or(false);
        let text = collapse_whitespace(text);
        if !hidden && !text.is_empty() {
            parts.push(text);
        }
    }
    Ok(Representation::Text(parts.join(" ")))
}

fn html_links(content: &[u8]) -> Result<Representation> {
    let document = Html::parse_document(&String::from_utf8_lossy(content));
    let selector = Selector::parse("a[href]").map_err(|e| {
        tracing::error!(error = %e, "link selector failed to parse");
        exn::Exn::from(ErrorKind::Conversion(OutputType::Links))
    })?;
    let links = document
        .select(&selector)
        .filter_map(|element| {
            let url = element.value().attr("href")?.trim().to_string();
            let text = collapse_whitespace(&element.text().collect::<String>());
            Some(Link { url, text: (!text.is_empty()).then_some(text) })
        })
        .collect();
    Ok(Representation::Links(links))
}

/// Every key and string, number and boolean value of a JSON document, one
/// per line. Content that doesn't parse is scanned as plain text.
fn json_text(content: &[u8]) -> Result<Representation> {
    let Ok(document) = serde_json::from_slice::<Value>(content) else {
        return plain(content);
    };
    let mut lines = Vec::new();
    flatten(&document, &mut lines);
    Ok(Representation::Text(lines.join("\n")))
}

fn flatten(value: &Value, lines: &mut Vec<String>) {
    match value {
        Value::Object(obj) => {
            for (key, value) in obj {
                lines.push(key.clone());
                flatten(value, lines);
            }
        }
        Value::Array(items) => items.iter().for_each(|item| flatten(item, lines)),
        Value::String(s) => lines.push(s.clone()),
        Value::Number(n) => lines.push(n.to_string()),
        Value::Bool(b) => lines.push(b.to_string()),
        Value::Null => {}
    }
}

fn xml_text(content: &[u8]) -> Result<Representation> {
    let mut reader = Reader::from_reader(content);
    reader.config_mut().trim_text(true);
    let mut parts = Vec::new();
    loop {
        match reader.read_event().or_raise(|| ErrorKind::Conversion(OutputType::Text))? {
            Event::Text(text) => {
                parts.push(text.unescape().or_raise(|| ErrorKind::Conversion(OutputType::Text))?.into_owned())
            }
            Event::CData(data) => parts.push(String::from_utf8_lossy(&data.into_inner()).into_owned()),
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(Representation::Text(parts.join("\n")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn text(rep: Representation) -> String {
        match rep {
            Representation::Text(text) => text,
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn test_html_text_skips_scripts() {
        let html = b"<html><head><title>T</title><script>var x = 1;</script></head>\
            <body><p>Hello\n   world</p><style>p {}</style><p>again</p></body></html>";
        assert_eq!(text(html_text(html).unwrap()), "T Hello world again");
    }

    #[test]
    fn test_html_links() {
        let html = b"<p><a href=' /a '>First  link</a> <a>no href</a> <a href=\"b.html\"></a></p>";
        let Representation::Links(links) = html_links(html).unwrap() else { panic!("expected links") };
        assert_eq!(
            links,
            vec![
                Link { url: "/a".into(), text: Some("First link".into()) },
                Link { url: "b.html".into(), text: None },
            ]
        );
    }

    #[rstest]
    #[case(br#"{"name": "Jens", "cpr": ["111111-1118", 42], "ok": true}"#.as_slice(), "cpr\n111111-1118\n42\nname\nJens\nok\ntrue")]
    #[case(b"not json, just text".as_slice(), "not json, just text")]
    fn test_json_text(#[case] content: &[u8], #[case] expected: &str) {
        assert_eq!(text(json_text(content).unwrap()), expected);
    }

    #[test]
    fn test_xml_text() {
        let xml = b"<?xml version=\"1.0\"?><doc><a>one &amp; two</a><b><![CDATA[<raw>]]></b></doc>";
        assert_eq!(text(xml_text(xml).unwrap()), "one & two\n<raw>");
    }

    #[test]
    fn test_plain_is_lossy() {
        assert_eq!(text(plain(b"caf\xc3\xa9 \xff").unwrap()), "caf\u{e9} \u{fffd}");
    }
}
