use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Node, Selector};

use crate::declarations::DocumentDeclaration;
use crate::error::FilterError;

/// Tags whose content never belongs in a legal text.
const SKIP_TAGS: &[&str] = &[
    "head", "iframe", "img", "noscript", "script", "style", "svg", "template",
];

const INLINE_TAGS: &[&str] = &[
    "a", "abbr", "b", "br", "code", "em", "i", "mark", "small", "span", "strong", "sub", "sup",
    "time", "u",
];

/// Extract the human-meaningful text of a fetched document as markdown.
///
/// HTML goes through the declaration's content selectors (document order),
/// with noise-selector subtrees dropped along the way; markdown and plain
/// text pass through unchanged. The declaration's named transforms run
/// last, in declaration order. Deterministic for a given input.
pub fn extract(
    content: &[u8],
    mime_type: &str,
    declaration: &DocumentDeclaration,
    is_refiltering: bool,
) -> Result<String, FilterError> {
    tracing::debug!(mime_type, is_refiltering, "filtering document");

    let text = match mime_type {
        "text/html" => extract_html(content, declaration)?,
        "text/markdown" | "text/plain" => decode_utf8(content)?,
        other => {
            return Err(FilterError::UnsupportedMime {
                mime: other.to_string(),
            });
        }
    };

    apply_transforms(text, &declaration.filter_names)
}

fn decode_utf8(content: &[u8]) -> Result<String, FilterError> {
    String::from_utf8(content.to_vec()).map_err(|err| FilterError::Encoding {
        detail: err.to_string(),
    })
}

fn parse_selectors(raw: &[String]) -> Result<Vec<Selector>, FilterError> {
    raw.iter()
        .map(|selector| {
            Selector::parse(selector).map_err(|_| FilterError::Selector {
                selector: selector.clone(),
            })
        })
        .collect()
}

fn extract_html(content: &[u8], declaration: &DocumentDeclaration) -> Result<String, FilterError> {
    let html = decode_utf8(content)?;
    let document = Html::parse_document(&html);

    let content_selectors = parse_selectors(&declaration.content_selectors)?;
    let noise_selectors = parse_selectors(&declaration.noise_selectors)?;

    let mut blocks = Vec::new();
    for selector in &content_selectors {
        for element in document.select(selector) {
            render_block(element, &noise_selectors, &mut blocks);
        }
    }

    Ok(blocks.join("\n\n"))
}

fn is_noise(element: ElementRef<'_>, noise: &[Selector]) -> bool {
    noise.iter().any(|selector| selector.matches(&element))
}

fn render_block(element: ElementRef<'_>, noise: &[Selector], blocks: &mut Vec<String>) {
    if is_noise(element, noise) {
        return;
    }

    let name = element.value().name();
    if SKIP_TAGS.contains(&name) {
        return;
    }

    match name {
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level: usize = name[1..].parse().unwrap_or(1);
            let text = inline_text(element, noise);
            if !text.is_empty() {
                blocks.push(format!("{} {text}", "#".repeat(level)));
            }
        }
        "p" => {
            let text = inline_text(element, noise);
            if !text.is_empty() {
                blocks.push(text);
            }
        }
        "ul" | "ol" => {
            let mut items = Vec::new();
            for child in element.child_elements() {
                if child.value().name() == "li" && !is_noise(child, noise) {
                    let text = inline_text(child, noise);
                    if !text.is_empty() {
                        items.push(format!("- {text}"));
                    }
                }
            }
            if !items.is_empty() {
                blocks.push(items.join("\n"));
            }
        }
        "li" => {
            let text = inline_text(element, noise);
            if !text.is_empty() {
                blocks.push(format!("- {text}"));
            }
        }
        "blockquote" => {
            let text = inline_text(element, noise);
            if !text.is_empty() {
                let quoted: Vec<String> = text.lines().map(|line| format!("> {line}")).collect();
                blocks.push(quoted.join("\n"));
            }
        }
        "pre" => {
            let raw: String = element.text().collect();
            let raw = raw.trim_matches('\n');
            if !raw.trim().is_empty() {
                blocks.push(format!("```\n{raw}\n```"));
            }
        }
        _ => render_container(element, noise, blocks),
    }
}

/// Generic containers interleave loose text with block children; loose runs
/// become paragraphs of their own.
fn render_container(element: ElementRef<'_>, noise: &[Selector], blocks: &mut Vec<String>) {
    let mut inline_buf = String::new();

    for child in element.children() {
        match child.value() {
            Node::Text(text) => push_text(&mut inline_buf, text),
            Node::Element(_) => {
                let Some(child_element) = ElementRef::wrap(child) else {
                    continue;
                };
                let name = child_element.value().name();
                if SKIP_TAGS.contains(&name) || is_noise(child_element, noise) {
                    continue;
                }
                if INLINE_TAGS.contains(&name) {
                    inline_buf.push_str(&render_inline(child_element, noise));
                } else {
                    flush_inline(&mut inline_buf, blocks);
                    render_block(child_element, noise, blocks);
                }
            }
            _ => {}
        }
    }

    flush_inline(&mut inline_buf, blocks);
}

fn flush_inline(buf: &mut String, blocks: &mut Vec<String>) {
    let text = tidy_inline(buf);
    if !text.is_empty() {
        blocks.push(text);
    }
    buf.clear();
}

fn inline_text(element: ElementRef<'_>, noise: &[Selector]) -> String {
    tidy_inline(&inline_children(element, noise))
}

fn inline_children(element: ElementRef<'_>, noise: &[Selector]) -> String {
    let mut buf = String::new();
    for child in element.children() {
        match child.value() {
            Node::Text(text) => push_text(&mut buf, text),
            Node::Element(_) => {
                if let Some(child_element) = ElementRef::wrap(child) {
                    buf.push_str(&render_inline(child_element, noise));
                }
            }
            _ => {}
        }
    }
    buf
}

fn render_inline(element: ElementRef<'_>, noise: &[Selector]) -> String {
    let name = element.value().name();
    if SKIP_TAGS.contains(&name) || is_noise(element, noise) {
        return String::new();
    }

    let inner = inline_children(element, noise);
    match name {
        "a" => match element.value().attr("href") {
            Some(href) if !inner.trim().is_empty() => format!("[{}]({href})", inner.trim()),
            _ => inner,
        },
        "strong" | "b" => format!("**{}**", inner.trim()),
        "em" | "i" => format!("*{}*", inner.trim()),
        "code" => format!("`{}`", inner.trim()),
        "br" => "\n".to_string(),
        _ => inner,
    }
}

/// Source whitespace (including newlines) becomes plain spaces; only `<br>`
/// produces a line break.
fn push_text(buf: &mut String, text: &str) {
    for ch in text.chars() {
        buf.push(if ch.is_whitespace() { ' ' } else { ch });
    }
}

fn tidy_inline(text: &str) -> String {
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

type Transform = fn(&str) -> String;

/// Named post-extraction transforms referenced from declarations.
static TRANSFORMS: Lazy<BTreeMap<&'static str, Transform>> = Lazy::new(|| {
    BTreeMap::from([
        ("strip-empty-lines", strip_empty_lines as Transform),
        ("drop-query-params", drop_query_params as Transform),
    ])
});

pub fn transform_exists(name: &str) -> bool {
    TRANSFORMS.contains_key(name)
}

fn apply_transforms(text: String, names: &[String]) -> Result<String, FilterError> {
    let mut out = text;
    for name in names {
        let Some(transform) = TRANSFORMS.get(name.as_str()) else {
            return Err(FilterError::UnknownTransform { name: name.clone() });
        };
        out = transform(&out);
    }
    Ok(out)
}

fn strip_empty_lines(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn drop_query_params(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("](") {
        let after = &rest[start + 2..];
        let Some(end) = after.find(')') else { break };
        let url = &after[..end];
        out.push_str(&rest[..start + 2]);
        out.push_str(url.split('?').next().unwrap_or(url));
        out.push(')');
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}
