//! Forgiving HTML parser that builds a [`Dom`] from fetched markup.
//!
//! This is not a full HTML5 tree builder. It keeps what the preview needs:
//! document structure, attributes in source order, comments and doctype for
//! faithful re-serialization, raw-text elements, and the common implied end
//! tags real pages rely on.

use crate::dom::{Dom, Element, NodeId};
use crate::{Error, Result};

pub fn parse_html(html: &str) -> Result<Dom> {
    let mut dom = Dom::new();
    let root = dom.root();
    parse_into(&mut dom, root, html)?;
    Ok(dom)
}

/// Parses `html` and appends the resulting nodes under `parent`.
pub fn parse_fragment_into(dom: &mut Dom, parent: NodeId, html: &str) -> Result<()> {
    if !dom.can_have_children(parent) {
        return Err(Error::HtmlParse("fragment parent cannot have children".into()));
    }
    parse_into(dom, parent, html)
}

fn parse_into(dom: &mut Dom, container: NodeId, html: &str) -> Result<()> {
    let bytes = html.as_bytes();
    let mut stack = vec![container];
    let mut i = 0usize;

    while i < bytes.len() {
        let parent = *stack
            .last()
            .ok_or_else(|| Error::HtmlParse("invalid stack state".into()))?;

        if starts_with_at(bytes, i, b"<!--") {
            // An unterminated comment runs to the end of input.
            let (end, next) = match find_subslice(bytes, i + 4, b"-->") {
                Some(end) => (end, end + 3),
                None => (bytes.len(), bytes.len()),
            };
            dom.create_comment(parent, &html[i + 4..end]);
            i = next;
            continue;
        }

        if bytes[i] == b'<' && bytes.get(i + 1) == Some(&b'!') {
            let (doctype, next) = parse_declaration(html, i);
            if let Some(name) = doctype {
                dom.create_doctype(parent, &name);
            }
            i = next;
            continue;
        }

        if bytes[i] == b'<' && bytes.get(i + 1) == Some(&b'?') {
            i = find_subslice(bytes, i, b">").map(|end| end + 1).unwrap_or(bytes.len());
            continue;
        }

        if bytes[i] == b'<' && bytes.get(i + 1) == Some(&b'/') && is_tag_start(bytes.get(i + 2)) {
            // A tag cut off by the end of input is dropped.
            let Some((tag, next)) = parse_end_tag(html, i) else {
                break;
            };
            i = next;
            if let Some(depth) = stack
                .iter()
                .rposition(|node| *node != container && dom.is_tag(*node, &tag))
            {
                stack.truncate(depth);
            }
            continue;
        }

        if bytes[i] == b'<' && is_tag_start(bytes.get(i + 1)) {
            let Some((tag, attrs, self_closing, next)) = parse_start_tag(html, i) else {
                break;
            };
            i = next;
            close_implied_end_tags(dom, &mut stack, container, &tag);
            let parent = *stack
                .last()
                .ok_or_else(|| Error::HtmlParse("missing parent element".into()))?;
            let node = dom.create_element(parent, Element::with_attrs(&tag, attrs));

            if is_raw_text_tag(&tag) && !self_closing {
                let close = find_raw_end_tag(bytes, i, tag.as_bytes()).unwrap_or(bytes.len());
                let body = &html[i..close];
                if !body.is_empty() {
                    if tag == "title" || tag == "textarea" {
                        dom.create_text(node, &decode_entities(body));
                    } else {
                        dom.create_text(node, body);
                    }
                }
                i = if close < bytes.len() {
                    parse_end_tag(html, close).map_or(bytes.len(), |(_, next)| next)
                } else {
                    close
                };
                continue;
            }

            if !self_closing && !is_void_tag(&tag) {
                stack.push(node);
            }
            continue;
        }

        let text_start = i;
        i += 1;
        while i < bytes.len() && bytes[i] != b'<' {
            i += 1;
        }
        let text = &html[text_start..i];
        if !text.is_empty() {
            dom.create_text(parent, &decode_entities(text));
        }
    }

    Ok(())
}

fn close_implied_end_tags(dom: &Dom, stack: &mut Vec<NodeId>, container: NodeId, tag: &str) {
    let closes: &[&str] = match tag {
        "li" => &["li"],
        "dt" | "dd" => &["dt", "dd"],
        "option" => &["option"],
        "optgroup" => &["optgroup", "option"],
        "tr" => &["tr", "td", "th"],
        "td" | "th" => &["td", "th"],
        "thead" | "tbody" | "tfoot" => &["thead", "tbody", "tfoot", "tr", "td", "th"],
        "body" => &["head"],
        _ if closes_paragraph(tag) => &["p"],
        _ => &[],
    };
    if closes.is_empty() {
        return;
    }
    let scope_boundaries: &[&str] = match tag {
        "li" => &["ul", "ol"],
        "dt" | "dd" => &["dl"],
        "option" | "optgroup" => &["select", "datalist"],
        "tr" | "td" | "th" | "thead" | "tbody" | "tfoot" => &["table"],
        _ => &["button", "table", "template"],
    };
    let mut close_at = None;
    for index in (0..stack.len()).rev() {
        let node = stack[index];
        if node == container {
            break;
        }
        if closes.iter().any(|name| dom.is_tag(node, name)) {
            close_at = Some(index);
            break;
        }
        if scope_boundaries.iter().any(|name| dom.is_tag(node, name)) {
            break;
        }
    }
    if let Some(index) = close_at {
        stack.truncate(index);
    }
}

fn closes_paragraph(tag: &str) -> bool {
    matches!(
        tag,
        "address"
            | "article"
            | "aside"
            | "blockquote"
            | "details"
            | "div"
            | "dl"
            | "fieldset"
            | "figcaption"
            | "figure"
            | "footer"
            | "form"
            | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
            | "header"
            | "hr"
            | "main"
            | "nav"
            | "ol"
            | "p"
            | "pre"
            | "section"
            | "table"
            | "ul"
    )
}

type StartTag = (String, Vec<(String, String)>, bool, usize);

/// `None` when the input ends inside the tag.
fn parse_start_tag(html: &str, at: usize) -> Option<StartTag> {
    let bytes = html.as_bytes();
    let mut i = at + 1;
    let tag_start = i;
    while i < bytes.len() && is_tag_char(bytes[i]) {
        i += 1;
    }
    let tag = html[tag_start..i].to_ascii_lowercase();

    let mut attrs: Vec<(String, String)> = Vec::new();
    let mut self_closing = false;

    loop {
        skip_ws(bytes, &mut i);
        let &b = bytes.get(i)?;
        if b == b'>' {
            i += 1;
            break;
        }
        if b == b'/' {
            i += 1;
            if bytes.get(i) == Some(&b'>') {
                self_closing = true;
                i += 1;
                break;
            }
            continue;
        }
        if !is_attr_name_char(b) {
            // Junk between attributes, e.g. stray quotes from broken templates.
            i += 1;
            continue;
        }

        let name_start = i;
        while i < bytes.len() && is_attr_name_char(bytes[i]) {
            i += 1;
        }
        let name = html[name_start..i].to_ascii_lowercase();
        skip_ws(bytes, &mut i);
        let value = if bytes.get(i) == Some(&b'=') {
            i += 1;
            skip_ws(bytes, &mut i);
            parse_attr_value(html, &mut i)?
        } else {
            String::new()
        };
        // First occurrence wins, as in browsers.
        if !attrs.iter().any(|(existing, _)| *existing == name) {
            attrs.push((name, value));
        }
    }

    Some((tag, attrs, self_closing, i))
}

fn parse_attr_value(html: &str, i: &mut usize) -> Option<String> {
    let bytes = html.as_bytes();
    match bytes.get(*i) {
        Some(&quote @ (b'"' | b'\'')) => {
            *i += 1;
            let start = *i;
            while *i < bytes.len() && bytes[*i] != quote {
                *i += 1;
            }
            if *i >= bytes.len() {
                return None;
            }
            let raw = &html[start..*i];
            *i += 1;
            Some(decode_entities(raw))
        }
        Some(_) => {
            let start = *i;
            while *i < bytes.len() && !bytes[*i].is_ascii_whitespace() && bytes[*i] != b'>' {
                *i += 1;
            }
            Some(decode_entities(&html[start..*i]))
        }
        None => None,
    }
}

/// Skips a `<!...>` declaration, returning the doctype name when it is one.
/// An unterminated declaration runs to the end of input.
fn parse_declaration(html: &str, at: usize) -> (Option<String>, usize) {
    let bytes = html.as_bytes();
    let mut i = at + 2;
    let mut quote: Option<u8> = None;
    let mut bracket_depth = 0usize;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'\'' | b'"' => quote = Some(b),
                b'[' => bracket_depth += 1,
                b']' if bracket_depth > 0 => bracket_depth -= 1,
                b'>' if bracket_depth == 0 => return (doctype_name(&html[at + 2..i]), i + 1),
                _ => {}
            },
        }
        i += 1;
    }
    (doctype_name(&html[at + 2..]), bytes.len())
}

fn doctype_name(declaration: &str) -> Option<String> {
    let body = declaration.trim();
    body.get(..7)
        .filter(|head| head.eq_ignore_ascii_case("doctype"))
        .map(|_| body[7..].trim().to_string())
}

/// `None` when the input ends before the closing `>`.
fn parse_end_tag(html: &str, at: usize) -> Option<(String, usize)> {
    let bytes = html.as_bytes();
    let mut i = at + 2;
    let tag_start = i;
    while i < bytes.len() && is_tag_char(bytes[i]) {
        i += 1;
    }
    let tag = html[tag_start..i].to_ascii_lowercase();
    while i < bytes.len() && bytes[i] != b'>' {
        i += 1;
    }
    if i >= bytes.len() {
        return None;
    }
    Some((tag, i + 1))
}

fn find_raw_end_tag(bytes: &[u8], from: usize, tag: &[u8]) -> Option<usize> {
    let mut i = from;
    while i + 2 + tag.len() <= bytes.len() {
        if bytes[i] == b'<'
            && bytes[i + 1] == b'/'
            && bytes[i + 2..i + 2 + tag.len()].eq_ignore_ascii_case(tag)
            && bytes
                .get(i + 2 + tag.len())
                .is_none_or(|b| b.is_ascii_whitespace() || *b == b'>' || *b == b'/')
        {
            return Some(i);
        }
        i += 1;
    }
    None
}

pub fn decode_entities(src: &str) -> String {
    if !src.contains('&') {
        return src.to_string();
    }
    let mut out = String::with_capacity(src.len());
    let mut rest = src;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp + 1..];
        let token_len = tail
            .char_indices()
            .find(|(_, ch)| !(ch.is_ascii_alphanumeric() || *ch == '#'))
            .map(|(idx, _)| idx)
            .unwrap_or(tail.len());
        let token = &tail[..token_len];
        let terminated = tail[token_len..].starts_with(';');
        let decoded = match token.strip_prefix('#') {
            Some(numeric) => decode_numeric_reference(numeric),
            // Unterminated names stay literal so query strings like `&copy=1` survive.
            None if terminated || matches!(token, "amp" | "lt" | "gt" | "quot" | "nbsp") => {
                named_reference(token)
            }
            None => None,
        };
        match decoded {
            Some(ch) if !token.is_empty() => {
                out.push(ch);
                let consumed = if terminated { token_len + 1 } else { token_len };
                rest = &tail[consumed..];
            }
            _ => {
                out.push('&');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_numeric_reference(value: &str) -> Option<char> {
    let codepoint = match value.strip_prefix(|c| c == 'x' || c == 'X') {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => value.parse::<u32>().ok()?,
    };
    char::from_u32(codepoint)
}

fn named_reference(name: &str) -> Option<char> {
    Some(match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{00A0}',
        "copy" => '©',
        "reg" => '®',
        "trade" => '™',
        "euro" => '€',
        "pound" => '£',
        "yen" => '¥',
        "laquo" => '«',
        "raquo" => '»',
        "ldquo" => '“',
        "rdquo" => '”',
        "lsquo" => '‘',
        "rsquo" => '’',
        "hellip" => '…',
        "middot" => '·',
        "ndash" => '–',
        "mdash" => '—',
        "times" => '×',
        "deg" => '°',
        _ => return None,
    })
}

pub fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\u{00A0}' => out.push_str("&nbsp;"),
            _ => out.push(ch),
        }
    }
    out
}

pub fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

pub fn is_void_tag(tag: &str) -> bool {
    matches!(
        tag,
        "area"
            | "base"
            | "br"
            | "col"
            | "embed"
            | "hr"
            | "img"
            | "input"
            | "link"
            | "meta"
            | "param"
            | "source"
            | "track"
            | "wbr"
    )
}

/// Elements whose content is consumed verbatim up to the matching end tag.
pub fn is_raw_text_tag(tag: &str) -> bool {
    is_unescaped_text_tag(tag) || matches!(tag, "textarea" | "title")
}

/// Elements whose text children serialize without entity escaping.
pub fn is_unescaped_text_tag(tag: &str) -> bool {
    matches!(
        tag,
        "script" | "style" | "noscript" | "xmp" | "iframe" | "noembed"
    )
}

fn starts_with_at(bytes: &[u8], at: usize, needle: &[u8]) -> bool {
    bytes.get(at..at + needle.len()) == Some(needle)
}

fn find_subslice(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from > bytes.len() {
        return None;
    }
    bytes[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| from + pos)
}

fn skip_ws(bytes: &[u8], i: &mut usize) {
    while *i < bytes.len() && bytes[*i].is_ascii_whitespace() {
        *i += 1;
    }
}

fn is_tag_start(b: Option<&u8>) -> bool {
    b.is_some_and(u8::is_ascii_alphabetic)
}

fn is_tag_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b':'
}

fn is_attr_name_char(b: u8) -> bool {
    !b.is_ascii_whitespace() && !matches!(b, b'"' | b'\'' | b'>' | b'/' | b'=' | b'<')
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trips_structure_doctype_and_comments() -> Result<()> {
        let html = "<!DOCTYPE html><html><head><title>A &amp; B</title></head>\
                    <body><!-- note --><p class=\"lead\">Hi</p></body></html>";
        let dom = parse_html(html)?;
        assert_eq!(dom.to_html(), html);
        Ok(())
    }

    #[test]
    fn keeps_script_body_raw() -> Result<()> {
        let html = "<script>if (a < b && c > d) { x = \"</div>\"; }</script>";
        let dom = parse_html(html)?;
        let script = dom.query_selector("script")?.expect("script");
        assert_eq!(
            dom.text_content(script),
            "if (a < b && c > d) { x = \"</div>\"; }"
        );
        assert_eq!(dom.to_html(), html);
        Ok(())
    }

    #[test]
    fn closes_implied_paragraphs_and_list_items() -> Result<()> {
        let dom = parse_html("<ul><li>one<li>two</ul><p>a<div>b</div>")?;
        assert_eq!(
            dom.to_html(),
            "<ul><li>one</li><li>two</li></ul><p>a</p><div>b</div>"
        );
        Ok(())
    }

    #[test]
    fn ignores_unmatched_end_tags() -> Result<()> {
        let dom = parse_html("<div><span>x</b></span>y</div>")?;
        assert_eq!(dom.to_html(), "<div><span>x</span>y</div>");
        Ok(())
    }

    #[test]
    fn decodes_attribute_entities_and_keeps_order() -> Result<()> {
        let dom = parse_html("<a href=\"/s?a=1&amp;b=2\" data-x=1 hidden>go</a>")?;
        let a = dom.query_selector("a")?.expect("anchor");
        let element = dom.element(a).expect("element");
        assert_eq!(element.attr("href"), Some("/s?a=1&b=2"));
        let names = element
            .attrs()
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["href", "data-x", "hidden"]);
        Ok(())
    }

    #[test]
    fn input_cut_off_mid_construct_still_parses() -> Result<()> {
        assert_eq!(parse_html("<p>x</p></div")?.to_html(), "<p>x</p>");
        assert_eq!(
            parse_html("<p>x<!-- never closed")?.to_html(),
            "<p>x<!-- never closed--></p>"
        );
        assert_eq!(parse_html("<p>ok</p><a href='x>oops</a>")?.to_html(), "<p>ok</p>");
        assert_eq!(parse_html("<div><img src=")?.to_html(), "<div></div>");
        assert_eq!(
            parse_html("<script>var a = 1;</script")?.to_html(),
            "<script>var a = 1;</script>"
        );
        assert_eq!(parse_html("<!DOCTYPE html")?.to_html(), "<!DOCTYPE html>");
        assert_eq!(parse_html("<style>p{}")?.to_html(), "<style>p{}</style>");
        Ok(())
    }

    #[test]
    fn decode_entities_leaves_unknown_references() {
        assert_eq!(decode_entities("a &bogus; b &#65;&#x42;"), "a &bogus; b AB");
        assert_eq!(decode_entities("fish & chips"), "fish & chips");
        assert_eq!(decode_entities("/s?a=1&copy=2&amp;b"), "/s?a=1&copy=2&b");
    }
}
