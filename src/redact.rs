//! Post text redaction.
//!
//! Facets annotate byte ranges of the post text with rich-text features.
//! Mentions and links are masked with fixed-width tokens before the text is
//! cached, so nothing identifying survives to the deletion feed.  Overlaps
//! are resolved first-start-wins; later overlapping facets are discarded.

use serde::Deserialize;

const MENTION_TOKEN: &str = "@█████████";
const LINK_TOKEN: &str = "www.█████████";

/// Half-open byte range `[start, end)` into the post text.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ByteSlice {
    #[serde(rename = "byteStart", default)]
    pub byte_start: u64,
    #[serde(rename = "byteEnd", default)]
    pub byte_end: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "$type")]
pub enum FacetFeature {
    #[serde(rename = "app.bsky.richtext.facet#mention")]
    Mention {
        #[serde(default)]
        did: String,
    },
    #[serde(rename = "app.bsky.richtext.facet#link")]
    Link {
        #[serde(default)]
        uri: String,
    },
    /// Tags and any future feature kinds pass through unredacted.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Facet {
    #[serde(default)]
    pub index: ByteSlice,
    #[serde(default)]
    pub features: Vec<FacetFeature>,
}

struct Redaction {
    index: ByteSlice,
    replacement: &'static str,
}

/// A facet is redactable if any feature is a mention or link; mention wins
/// when a facet carries both.
fn as_redaction(facet: &Facet) -> Option<Redaction> {
    let mut link = false;
    for feature in &facet.features {
        match feature {
            FacetFeature::Mention { .. } => {
                return Some(Redaction {
                    index: facet.index,
                    replacement: MENTION_TOKEN,
                });
            }
            FacetFeature::Link { .. } => link = true,
            FacetFeature::Other => {}
        }
    }
    link.then_some(Redaction {
        index: facet.index,
        replacement: LINK_TOKEN,
    })
}

/// Mask every mention and link facet in `text`.
///
/// Facets are applied in byte-start order; a facet overlapping an already
/// applied one is dropped, as is any facet with `end <= start` or a start
/// beyond the text.  An `end` past the text clamps to the text length.
pub fn redact(text: &str, facets: &[Facet]) -> String {
    if facets.is_empty() {
        return text.to_owned();
    }
    let source = text.as_bytes();
    let len = source.len() as u64;

    let mut redactions: Vec<Redaction> = facets.iter().filter_map(as_redaction).collect();
    redactions.sort_by_key(|r| r.index.byte_start);

    let mut out: Vec<u8> = Vec::with_capacity(source.len());
    let mut cursor: u64 = 0;
    for redaction in redactions {
        let ByteSlice {
            byte_start: start,
            byte_end: end,
        } = redaction.index;
        if start < cursor {
            continue; // overlaps a prior facet
        }
        if start >= len {
            break; // sorted by start, nothing later can apply
        }
        if end <= start {
            continue;
        }
        out.extend_from_slice(&source[cursor as usize..start as usize]);
        out.extend_from_slice(redaction.replacement.as_bytes());
        cursor = end.min(len);
    }
    out.extend_from_slice(&source[cursor as usize..]);

    String::from_utf8_lossy(&out).into_owned()
}
