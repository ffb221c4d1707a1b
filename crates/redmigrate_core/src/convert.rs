use scraper::{ElementRef, Html, Node};

use crate::assembla::AssemblaApi;
use crate::assets::{AssetStore, ResolvedAsset};
use crate::ledger::UploadLedger;

#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    /// Language tag prepended inside `<pre>` blocks, empty by default.
    pub code_language: String,
}

/// Converted text plus the assets that were resolved while producing it, in
/// document order. The caller re-uploads the assets as attachments.
#[derive(Debug)]
pub struct Conversion {
    pub text: String,
    pub uploads: Vec<ResolvedAsset>,
}

/// Convert an HTML fragment from the source platform into Redmine markup.
///
/// Image references are resolved through `store` as a side effect; a
/// reference that fails to resolve (or has an unrecognized URL shape)
/// degrades to the raw `src` emitted in image markup rather than aborting
/// the conversion.
pub fn convert_html<A: AssemblaApi + ?Sized>(
    html: &str,
    api: &mut A,
    store: &AssetStore,
) -> Conversion {
    convert_html_with_options(html, api, store, &ConvertOptions::default())
}

pub fn convert_html_with_options<A: AssemblaApi + ?Sized>(
    html: &str,
    api: &mut A,
    store: &AssetStore,
    options: &ConvertOptions,
) -> Conversion {
    let document = Html::parse_fragment(html);
    let mut converter = TreeConverter {
        api,
        store,
        options,
        ledger: UploadLedger::new(),
    };
    let text = converter.convert_children(document.root_element(), false);
    Conversion {
        text,
        uploads: converter.ledger.drain(),
    }
}

/// Closed enumeration of the element kinds the converter understands.
/// Anything else falls through to `Other`, which passes converted children
/// through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElementKind {
    Heading(u8),
    Image,
    Pre,
    Link,
    Code,
    ListItem,
    Strikethrough,
    Paragraph,
    Strong,
    Emphasis,
    Blockquote,
    LineBreak,
    Divider,
    Other,
}

impl ElementKind {
    fn classify(name: &str) -> Self {
        match name {
            "h1" => Self::Heading(1),
            "h2" => Self::Heading(2),
            "h3" => Self::Heading(3),
            "h4" => Self::Heading(4),
            "h5" => Self::Heading(5),
            "h6" => Self::Heading(6),
            "img" => Self::Image,
            "pre" => Self::Pre,
            "a" => Self::Link,
            "code" => Self::Code,
            "li" => Self::ListItem,
            "del" | "s" => Self::Strikethrough,
            "p" => Self::Paragraph,
            "strong" | "b" => Self::Strong,
            "em" | "i" => Self::Emphasis,
            "blockquote" => Self::Blockquote,
            "br" => Self::LineBreak,
            "hr" => Self::Divider,
            _ => Self::Other,
        }
    }
}

struct TreeConverter<'a, A: AssemblaApi + ?Sized> {
    api: &'a mut A,
    store: &'a AssetStore,
    options: &'a ConvertOptions,
    ledger: UploadLedger,
}

impl<A: AssemblaApi + ?Sized> TreeConverter<'_, A> {
    fn convert_children(&mut self, element: ElementRef<'_>, inline: bool) -> String {
        let name = element.value().name();
        let in_pre = name == "pre" || has_ancestor(element, "pre");
        // whitespace-only text between list items or between top-level
        // blocks carries no content
        let drops_blank_text = matches!(name, "ul" | "ol" | "html");

        let mut output = String::new();
        for child in element.children() {
            match child.value() {
                Node::Text(text) => {
                    let raw: &str = text;
                    if drops_blank_text && raw.trim().is_empty() {
                        continue;
                    }
                    if in_pre {
                        output.push_str(raw);
                    } else {
                        output.push_str(&collapse_whitespace(raw));
                    }
                }
                Node::Element(_) => {
                    if let Some(child_element) = ElementRef::wrap(child) {
                        output.push_str(&self.convert_element(child_element, inline));
                    }
                }
                _ => {}
            }
        }
        output
    }

    fn convert_element(&mut self, element: ElementRef<'_>, inline: bool) -> String {
        let kind = ElementKind::classify(element.value().name());
        let children_inline = inline || matches!(kind, ElementKind::Heading(_));
        let text = self.convert_children(element, children_inline);

        match kind {
            ElementKind::Heading(level) => rule_heading(level, &text, inline),
            ElementKind::Image => self.rule_image(element),
            ElementKind::Pre => rule_pre(&text, &self.options.code_language),
            ElementKind::Link => rule_link(element, &text),
            ElementKind::Code => self.rule_code(element, &text),
            ElementKind::ListItem => rule_list_item(element, &text),
            ElementKind::Strikethrough => inline_wrap("-", &text),
            ElementKind::Paragraph => rule_paragraph(&text, inline),
            ElementKind::Strong => inline_wrap("**", &text),
            ElementKind::Emphasis => inline_wrap("*", &text),
            ElementKind::Blockquote => rule_blockquote(&text, inline),
            ElementKind::LineBreak => "  \n".to_string(),
            ElementKind::Divider => "\n\n---\n\n".to_string(),
            ElementKind::Other => text,
        }
    }

    /// Classify the `src` into one of the two known source URL shapes,
    /// resolve the document, and emit image markup. Unrecognized shapes and
    /// failed resolutions degrade to the raw `src` so the reference stays
    /// visible instead of dropping content.
    fn rule_image(&mut self, element: ElementRef<'_>) -> String {
        let src = element.value().attr("src").unwrap_or("");
        let style = match element.value().attr("style") {
            Some(style) if !style.is_empty() => format!("{{{style}}}"),
            _ => String::new(),
        };

        if let Some((space_id, document_id)) = classify_image_src(src)
            && let Ok(asset) = self.store.resolve(&mut *self.api, &space_id, &document_id)
        {
            let filename = asset.filename.clone();
            self.ledger.record(asset);
            return format!("\n!{style}{filename}!\n");
        }
        format!("\n!{style}{src}!\n")
    }

    fn rule_code(&self, element: ElementRef<'_>, text: &str) -> String {
        if has_ancestor(element, "pre") {
            return text.to_string();
        }
        if text.contains('\n') {
            return rule_pre(text, &self.options.code_language);
        }
        inline_wrap("@", text)
    }
}

fn rule_heading(level: u8, text: &str, inline: bool) -> String {
    if inline {
        return text.to_string();
    }
    let text = text.trim_end();
    format!("\nh{level}. {text}\n\n")
}

fn rule_pre(text: &str, code_language: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    format!("<pre>{code_language}{text}</pre>")
}

fn rule_link(element: ElementRef<'_>, text: &str) -> String {
    let (prefix, suffix, text) = chomp(text);
    if text.is_empty() {
        return String::new();
    }
    let href = element.value().attr("href").unwrap_or("");
    let title = element.value().attr("title");

    // internal wiki cross-references do not resolve on the target platform
    if href.is_empty() || href.contains("/wiki/") {
        return text.to_string();
    }
    if text.replace("\\_", "_") == href && title.is_none() {
        return format!("{prefix}<{href}>{suffix}");
    }
    match title {
        Some(title) => {
            let escaped = title.replace('"', "\\\"");
            format!("{prefix}[{text}]({href} \"{escaped}\"){suffix}")
        }
        None => format!("{prefix}[{text}]({href}){suffix}"),
    }
}

fn rule_list_item(element: ElementRef<'_>, text: &str) -> String {
    let parent = element.parent().and_then(ElementRef::wrap);
    let bullet = match parent {
        Some(parent) if parent.value().name() == "ol" => {
            let start = parent
                .value()
                .attr("start")
                .and_then(|value| value.trim().parse::<i64>().ok())
                .unwrap_or(1);
            let position = preceding_item_count(element) as i64;
            format!("{}.", start + position)
        }
        _ => "*".repeat(ancestor_count(element, "ul")),
    };
    format!("{bullet} {}\n", text.trim())
}

fn rule_paragraph(text: &str, inline: bool) -> String {
    if inline {
        return text.to_string();
    }
    if text.is_empty() {
        return String::new();
    }
    format!("{text}\n\n")
}

fn rule_blockquote(text: &str, inline: bool) -> String {
    if inline {
        return text.to_string();
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let quoted = trimmed
        .lines()
        .map(|line| format!("> {line}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!("\n{quoted}\n\n")
}

/// Wrap chomped text in an inline delimiter, re-applying the surrounding
/// whitespace outside the markup. Empty text emits nothing.
fn inline_wrap(markup: &str, text: &str) -> String {
    let (prefix, suffix, text) = chomp(text);
    if text.is_empty() {
        return String::new();
    }
    format!("{prefix}{markup}{text}{markup}{suffix}")
}

/// Split single leading/trailing spaces off the text so markup can sit
/// tight against the content.
fn chomp(text: &str) -> (&'static str, &'static str, &str) {
    let prefix = if text.starts_with(' ') { " " } else { "" };
    let suffix = if text.ends_with(' ') { " " } else { "" };
    (prefix, suffix, text.trim())
}

/// The two known source-platform URL shapes for embedded images:
/// `…assembla…/spaces/{space}/documents/{doc}/…` (absolute) and
/// `/spaces/{space}/documents/{doc}/…` (relative).
fn classify_image_src(src: &str) -> Option<(String, String)> {
    let segments: Vec<&str> = src.split('/').collect();
    if src.contains("assembla") {
        if segments.len() > 6 {
            return Some((segments[4].to_string(), segments[6].to_string()));
        }
    } else if src.contains("spaces") && segments.len() > 4 {
        return Some((segments[2].to_string(), segments[4].to_string()));
    }
    None
}

/// Collapse runs of tabs and spaces to a single space. Newlines survive:
/// the inline-code rule distinguishes single-line from multiline text.
fn collapse_whitespace(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut in_run = false;
    for ch in text.chars() {
        if matches!(ch, ' ' | '\t') {
            if !in_run {
                output.push(' ');
                in_run = true;
            }
        } else {
            output.push(ch);
            in_run = false;
        }
    }
    output
}

fn has_ancestor(element: ElementRef<'_>, name: &str) -> bool {
    ancestor_count(element, name) > 0
}

fn ancestor_count(element: ElementRef<'_>, name: &str) -> usize {
    element
        .ancestors()
        .filter(|node| matches!(node.value(), Node::Element(e) if e.name() == name))
        .count()
}

fn preceding_item_count(element: ElementRef<'_>) -> usize {
    element
        .prev_siblings()
        .filter(|node| matches!(node.value(), Node::Element(e) if e.name() == "li"))
        .count()
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::assembla::mock::MockAssembla;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    fn convert(html: &str, api: &mut MockAssembla) -> Conversion {
        let temp = tempdir().expect("tempdir");
        let store = AssetStore::new(temp.path());
        let conversion = convert_html(html, api, &store);
        // keep the store alive until conversion is done
        drop(temp);
        conversion
    }

    #[test]
    fn headings_render_in_block_context() {
        let mut api = MockAssembla::default();
        for level in 1..=3u8 {
            let conversion = convert(&format!("<h{level}>Title</h{level}>"), &mut api);
            assert_eq!(conversion.text, format!("\nh{level}. Title\n\n"));
        }
    }

    #[test]
    fn headings_pass_text_through_in_inline_context() {
        assert_eq!(rule_heading(2, "Title", true), "Title");
        assert_eq!(rule_heading(2, "Title", false), "\nh2. Title\n\n");
    }

    #[test]
    fn ordered_list_honors_start_offset() {
        let mut api = MockAssembla::default();
        let conversion = convert(
            r#"<ol start="5"><li>alpha</li><li>beta</li><li>gamma</li></ol>"#,
            &mut api,
        );
        assert_eq!(conversion.text, "5. alpha\n6. beta\n7. gamma\n");
    }

    #[test]
    fn ordered_list_defaults_to_one() {
        let mut api = MockAssembla::default();
        let conversion = convert("<ol><li>first</li><li>second</li></ol>", &mut api);
        assert_eq!(conversion.text, "1. first\n2. second\n");
    }

    #[test]
    fn unordered_list_bullet_depth_follows_nesting() {
        let mut api = MockAssembla::default();
        let conversion = convert(
            "<ul><li>outer</li><li><ul><li>inner</li></ul></li></ul>",
            &mut api,
        );
        assert!(conversion.text.contains("* outer\n"));
        assert!(conversion.text.contains("** inner\n"));
    }

    #[test]
    fn autolink_when_text_equals_href_without_title() {
        let mut api = MockAssembla::default();
        let conversion = convert(
            r#"<a href="https://example.com">https://example.com</a>"#,
            &mut api,
        );
        assert_eq!(conversion.text, "<https://example.com>");
    }

    #[test]
    fn titled_link_keeps_the_title() {
        let mut api = MockAssembla::default();
        let conversion = convert(
            r#"<a href="https://example.com" title="Example">the site</a>"#,
            &mut api,
        );
        assert_eq!(
            conversion.text,
            "[the site](https://example.com \"Example\")"
        );
    }

    #[test]
    fn plain_link_renders_bracket_form() {
        let mut api = MockAssembla::default();
        let conversion = convert(r#"<a href="https://example.com">the site</a>"#, &mut api);
        assert_eq!(conversion.text, "[the site](https://example.com)");
    }

    #[test]
    fn internal_wiki_link_is_unlinked() {
        let mut api = MockAssembla::default();
        let conversion = convert(r#"<a href="/wiki/Other_Page">Other Page</a>"#, &mut api);
        assert_eq!(conversion.text, "Other Page");
    }

    #[test]
    fn empty_link_emits_nothing() {
        let mut api = MockAssembla::default();
        let conversion = convert(r#"<a href="https://example.com"></a>"#, &mut api);
        assert_eq!(conversion.text, "");
    }

    #[test]
    fn inline_code_uses_at_delimiters() {
        let mut api = MockAssembla::default();
        let conversion = convert("<code>x = 1</code>", &mut api);
        assert_eq!(conversion.text, "@x = 1@");
    }

    #[test]
    fn multiline_code_redirects_to_pre() {
        let mut api = MockAssembla::default();
        let conversion = convert("<code>line one\nline two</code>", &mut api);
        assert_eq!(conversion.text, "<pre>line one\nline two</pre>");
    }

    #[test]
    fn code_inside_pre_is_not_double_wrapped() {
        let mut api = MockAssembla::default();
        let conversion = convert("<pre><code>line one\nline two</code></pre>", &mut api);
        assert_eq!(conversion.text, "<pre>line one\nline two</pre>");
    }

    #[test]
    fn empty_pre_emits_nothing() {
        let mut api = MockAssembla::default();
        let conversion = convert("<pre></pre>", &mut api);
        assert_eq!(conversion.text, "");
    }

    #[test]
    fn strikethrough_tags_wrap_in_dashes() {
        let mut api = MockAssembla::default();
        let conversion = convert("<del>gone</del> and <s>also gone</s>", &mut api);
        assert_eq!(conversion.text, "-gone- and -also gone-");
    }

    #[test]
    fn paragraph_and_emphasis_render() {
        let mut api = MockAssembla::default();
        let conversion = convert("<p>Hello <strong>world</strong> in <em>style</em></p>", &mut api);
        assert_eq!(conversion.text, "Hello **world** in *style*\n\n");
    }

    #[test]
    fn unhandled_elements_pass_children_through() {
        let mut api = MockAssembla::default();
        let conversion = convert("<div><span>keep this</span></div>", &mut api);
        assert_eq!(conversion.text, "keep this");
    }

    #[test]
    fn absolute_image_src_resolves_and_records_upload() {
        let temp = tempdir().expect("tempdir");
        let store = AssetStore::new(temp.path());
        let mut api = MockAssembla::default();
        let mut payload = PNG_MAGIC.to_vec();
        payload.extend_from_slice(&[0, 0, 0, 0]);
        api.add_document("123", "456", &payload);

        let conversion = convert_html(
            r#"<img src="https://www.assembla.com/spaces/123/documents/456/download/456">"#,
            &mut api,
            &store,
        );
        assert_eq!(conversion.text, "\n!123_456.png!\n");
        assert_eq!(conversion.uploads.len(), 1);
        assert_eq!(conversion.uploads[0].filename, "123_456.png");
        assert!(conversion.uploads[0].local_path.exists());
    }

    #[test]
    fn relative_image_src_resolves_via_second_shape() {
        let temp = tempdir().expect("tempdir");
        let store = AssetStore::new(temp.path());
        let mut api = MockAssembla::default();
        let mut payload = PNG_MAGIC.to_vec();
        payload.extend_from_slice(&[0, 0, 0, 0]);
        api.add_document("123", "456", &payload);

        let conversion = convert_html(
            r#"<img src="/spaces/123/documents/456/download">"#,
            &mut api,
            &store,
        );
        assert_eq!(conversion.text, "\n!123_456.png!\n");
        assert_eq!(conversion.uploads.len(), 1);
    }

    #[test]
    fn image_style_attribute_is_carried_over() {
        let temp = tempdir().expect("tempdir");
        let store = AssetStore::new(temp.path());
        let mut api = MockAssembla::default();
        let mut payload = PNG_MAGIC.to_vec();
        payload.extend_from_slice(&[0, 0, 0, 0]);
        api.add_document("123", "456", &payload);

        let conversion = convert_html(
            r#"<img style="width:300px" src="/spaces/123/documents/456/download">"#,
            &mut api,
            &store,
        );
        assert_eq!(conversion.text, "\n!{width:300px}123_456.png!\n");
    }

    #[test]
    fn failed_image_resolution_falls_back_to_raw_src() {
        let temp = tempdir().expect("tempdir");
        let store = AssetStore::new(temp.path());
        let mut api = MockAssembla::default();
        api.add_failing_document("123", "456", 404);

        let src = "/spaces/123/documents/456/download";
        let conversion = convert_html(&format!(r#"<img src="{src}">"#), &mut api, &store);
        assert_eq!(conversion.text, format!("\n!{src}!\n"));
        assert!(conversion.uploads.is_empty());
    }

    #[test]
    fn unrecognized_image_src_falls_back_to_raw_src() {
        let temp = tempdir().expect("tempdir");
        let store = AssetStore::new(temp.path());
        let mut api = MockAssembla::default();

        let src = "https://elsewhere.example/logo.png";
        let conversion = convert_html(&format!(r#"<img src="{src}">"#), &mut api, &store);
        assert_eq!(conversion.text, format!("\n!{src}!\n"));
        assert!(conversion.uploads.is_empty());
    }

    #[test]
    fn exhausted_download_still_completes_surrounding_conversion() {
        let temp = tempdir().expect("tempdir");
        let store = AssetStore::new(temp.path());
        let mut api = MockAssembla::default();
        api.add_unreachable_document("123", "456");

        let conversion = convert_html(
            r#"<p>before</p><img src="/spaces/123/documents/456/download"><p>after</p>"#,
            &mut api,
            &store,
        );
        assert!(conversion.text.contains("before"));
        assert!(conversion.text.contains("!/spaces/123/documents/456/download!"));
        assert!(conversion.text.contains("after"));
        assert!(conversion.uploads.is_empty());
    }

    #[test]
    fn classify_image_src_extracts_both_shapes() {
        assert_eq!(
            classify_image_src("https://www.assembla.com/spaces/123/documents/456/download/456"),
            Some(("123".to_string(), "456".to_string()))
        );
        assert_eq!(
            classify_image_src("/spaces/123/documents/456/download"),
            Some(("123".to_string(), "456".to_string()))
        );
        assert_eq!(classify_image_src("https://elsewhere.example/x.png"), None);
        assert_eq!(classify_image_src(""), None);
    }

    #[test]
    fn chomp_tracks_surrounding_spaces() {
        assert_eq!(chomp(" padded "), (" ", " ", "padded"));
        assert_eq!(chomp("tight"), ("", "", "tight"));
        assert_eq!(chomp(""), ("", "", ""));
    }
}
