use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::{NoExpand, Regex};

use crate::assembla::AssemblaApi;
use crate::assets::AssetStore;
use crate::convert::Conversion;
use crate::ledger::UploadLedger;

static HASH_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"###([^#\n]+)###|##([^#\n]+)##|#([^#\n]+)#").expect("hardcoded regex is valid")
});
static H1_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^h1\.([^\n]*)").expect("hardcoded regex is valid"));
static H2_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^h2\.([^\n]*)").expect("hardcoded regex is valid"));
static H3_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^h3\.([^\n]*)").expect("hardcoded regex is valid"));
static IMAGE_CAPTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[image:(.*)\|.*\]\]").expect("hardcoded regex is valid"));
static IMAGE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[image:.*\|").expect("hardcoded regex is valid"));

/// Convert a free-text field in the legacy lightweight dialect (ticket
/// comments never pass through HTML parsing) into Redmine markup.
///
/// Unlike the tree converter, an image token that fails to resolve fails the
/// whole conversion: comments carry their images inline, and substituting a
/// broken token would silently corrupt the note.
pub fn convert_comment<A: AssemblaApi + ?Sized>(
    text: &str,
    space_id: &str,
    api: &mut A,
    store: &AssetStore,
) -> Result<Conversion> {
    let mut output = normalize_headings(text);
    output = IMAGE_CAPTION
        .replace_all(&output, "[[image:$1|")
        .into_owned();

    let tokens: Vec<String> = IMAGE_TOKEN
        .find_iter(&output)
        .map(|found| found.as_str().to_string())
        .collect();

    let mut ledger = UploadLedger::new();
    for token in tokens {
        let document_id = &token[8..token.len() - 1];
        let asset = store
            .resolve(api, space_id, document_id)
            .with_context(|| format!("failed to resolve comment image {document_id}"))?;
        let pattern = Regex::new(&format!(r"\[\[image:{}\|", regex::escape(document_id)))
            .context("failed to build image token pattern")?;
        let replacement = format!("!{}!", asset.filename);
        output = pattern
            .replace_all(&output, NoExpand(&replacement))
            .into_owned();
        ledger.record(asset);
    }

    Ok(Conversion {
        text: output,
        uploads: ledger.drain(),
    })
}

/// Normalize the two legacy heading conventions: hash-delimited headings
/// lose their closing hashes (single hashes promote to the `###` level) in
/// one pass so a converted heading is never re-matched at a shallower
/// level, and `hN.` heading lines gain a trailing line break.
fn normalize_headings(text: &str) -> String {
    let mut output = HASH_HEADING
        .replace_all(text, |caps: &regex::Captures| {
            if let Some(inner) = caps.get(1) {
                format!("###{}", inner.as_str())
            } else if let Some(inner) = caps.get(2) {
                format!("##{}", inner.as_str())
            } else {
                format!("###{}", &caps[3])
            }
        })
        .into_owned();
    output = H1_LINE.replace_all(&output, "h1.$1\n").into_owned();
    output = H2_LINE.replace_all(&output, "h2.$1\n").into_owned();
    output = H3_LINE.replace_all(&output, "h3.$1\n").into_owned();
    output
}
