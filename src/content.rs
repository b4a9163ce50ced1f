//! HTML content pipeline: inline-image extraction plus sanitisation.
//!
//! Entry content is an opaque blob everywhere else; this is the one place
//! that parses and mutates it. A single lenient rewrite pass
//!
//! - lifts `data:` URI images out of the content and into the attachment
//!   store, pointing their `src` at the served blob and wrapping them in
//!   a link to the full-size original,
//! - drops `<script>` and `<style>` elements, comments, and any attribute
//!   outside a curated safe set (inline `style` stays),
//! - unwraps `<html>`/`<head>`/`<body>` scaffolding so only body content
//!   is stored.
//!
//! Content that cannot be parsed at all passes through unchanged, binding
//! no attachments. Downstream always stores the sanitised bytes.

use std::cell::RefCell;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use jiff::Timestamp;
use lol_html::html_content::{ContentType, Element};
use lol_html::{RewriteStrSettings, doc_comments, element, rewrite_str};

use crate::attachments::{AttachmentError, Blobs, Upload, save_attachment};
use crate::model::Attachment;
use crate::storage::Storage;

/// Errors from content ingestion. A parse failure is not an error (the
/// content just passes through), a failed blob write is.
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error(transparent)]
    Attachment(#[from] AttachmentError),
}

/// The outcome of an ingest pass: the sanitised content plus the inline
/// attachments that were extracted from it (unbound when the entry is
/// still being created).
#[derive(Debug)]
pub struct IngestedContent {
    pub content: String,
    pub attachments: Vec<Attachment>,
}

/// Attributes that survive sanitisation: the usual HTML-cleaner
/// whitelist plus inline `style`.
const SAFE_ATTRS: &[&str] = &[
    "abbr", "accept", "accept-charset", "accesskey", "action", "align", "alt", "axis",
    "border", "cellpadding", "cellspacing", "char", "charoff", "charset", "checked", "cite",
    "class", "clear", "cols", "colspan", "color", "compact", "coords", "datetime", "dir",
    "disabled", "enctype", "for", "frame", "headers", "height", "href", "hreflang", "hspace",
    "id", "ismap", "label", "lang", "longdesc", "maxlength", "media", "method", "multiple",
    "name", "nohref", "noshade", "nowrap", "prompt", "readonly", "rel", "rev", "rows",
    "rowspan", "rules", "scope", "selected", "shape", "size", "span", "src", "start", "style",
    "summary", "tabindex", "target", "title", "type", "usemap", "valign", "value", "vspace",
    "width",
];

/// Run the ingest pass over HTML content.
///
/// Extracted images are saved through the attachment pipeline with
/// `embedded = true`, bound to `entry_id` when it is already known.
pub fn ingest_html(
    storage: &Storage,
    blobs: &dyn Blobs,
    content: &str,
    timestamp: Timestamp,
    entry_id: Option<i64>,
) -> Result<IngestedContent, ContentError> {
    let attachments: RefCell<Vec<Attachment>> = RefCell::new(Vec::new());
    let save_error: RefCell<Option<AttachmentError>> = RefCell::new(None);
    let inline_index: RefCell<usize> = RefCell::new(0);
    let inside_anchor: RefCell<bool> = RefCell::new(false);

    let rewritten = rewrite_str(
        content,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!("script", |el| {
                    el.remove();
                    Ok(())
                }),
                element!("style", |el| {
                    el.remove();
                    Ok(())
                }),
                element!("head", |el| {
                    el.remove();
                    Ok(())
                }),
                element!("html", |el| {
                    el.remove_and_keep_content();
                    Ok(())
                }),
                element!("body", |el| {
                    el.remove_and_keep_content();
                    Ok(())
                }),
                // Runs before the [src] handler below for the same element,
                // marking images that already sit inside a link.
                element!("a [src]", |_el| {
                    *inside_anchor.borrow_mut() = true;
                    Ok(())
                }),
                element!("[src]", |el| {
                    let wrapped = inside_anchor.replace(false);
                    match extract_inline_image(
                        storage,
                        blobs,
                        el,
                        timestamp,
                        entry_id,
                        &inline_index,
                    ) {
                        Ok(Some(attachment)) => {
                            let link = attachment.link();
                            el.set_attribute("src", &link)?;
                            if !wrapped {
                                el.before(&format!("<a href=\"{link}\">"), ContentType::Html);
                                el.after("</a>", ContentType::Html);
                            }
                            attachments.borrow_mut().push(attachment);
                        }
                        Ok(None) => {}
                        Err(err) => {
                            *save_error.borrow_mut() = Some(err);
                            return Err("attachment save failed".into());
                        }
                    }
                    Ok(())
                }),
                // Attribute whitelist, applied last so it sees the final
                // attributes of every element.
                element!("*", |el| {
                    let dropped: Vec<String> = el
                        .attributes()
                        .iter()
                        .map(|a| a.name())
                        .filter(|name| !SAFE_ATTRS.contains(&name.as_str()))
                        .collect();
                    for name in dropped {
                        el.remove_attribute(&name);
                    }
                    Ok(())
                }),
            ],
            document_content_handlers: vec![doc_comments!(|c| {
                c.remove();
                Ok(())
            })],
            ..RewriteStrSettings::default()
        },
    );

    if let Some(err) = save_error.into_inner() {
        return Err(err.into());
    }
    match rewritten {
        Ok(content) => Ok(IngestedContent {
            content,
            attachments: attachments.into_inner(),
        }),
        Err(err) => {
            // Lenient contract: unparseable content passes through as-is.
            tracing::warn!(%err, "could not parse entry content, passing through unchanged");
            Ok(IngestedContent {
                content: content.to_string(),
                attachments: Vec::new(),
            })
        }
    }
}

/// Decode and store one `data:` URI image. Returns `Ok(None)` for
/// elements that should be left alone: non-data sources, undecodable
/// payloads, and unusable MIME types.
fn extract_inline_image(
    storage: &Storage,
    blobs: &dyn Blobs,
    el: &Element<'_, '_>,
    timestamp: Timestamp,
    entry_id: Option<i64>,
    inline_index: &RefCell<usize>,
) -> Result<Option<Attachment>, AttachmentError> {
    let Some(src) = el.get_attribute("src") else {
        return Ok(None);
    };
    let Some(rest) = src.strip_prefix("data:") else {
        return Ok(None);
    };
    let Some((header, payload)) = rest.split_once(',') else {
        return Ok(None);
    };
    let Some((mime, encoding)) = header.split_once(';') else {
        return Ok(None);
    };
    if !encoding.eq_ignore_ascii_case("base64") {
        return Ok(None);
    }
    let Some(bytes) = decode_base64(payload) else {
        tracing::warn!("could not decode inline image payload, leaving element untouched");
        return Ok(None);
    };
    let Some(subtype) = mime.split('/').nth(1) else {
        tracing::warn!(%mime, "inline image has no usable subtype, leaving element untouched");
        return Ok(None);
    };

    let index = inline_index.replace_with(|i| *i + 1);
    let upload = Upload {
        filename: format!("inline-{}-{}.{}", bytes.len(), index, subtype.to_lowercase()),
        content_type: Some(mime.to_string()),
        bytes,
    };
    save_attachment(storage, blobs, &upload, timestamp, entry_id, None, true).map(Some)
}

/// Base64 with optional padding: browsers are sloppy about the trailing
/// `=` when building data URIs.
fn decode_base64(payload: &str) -> Option<Vec<u8>> {
    let mut data: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    while data.len() % 4 != 0 {
        data.push('=');
    }
    BASE64.decode(data).ok()
}

/// Plain text of an HTML fragment, for content previews in listings.
pub fn strip_tags(html: &str) -> String {
    let text: RefCell<String> = RefCell::new(String::new());
    let stripped = rewrite_str(
        html,
        RewriteStrSettings {
            document_content_handlers: vec![lol_html::doc_text!(|chunk| {
                text.borrow_mut().push_str(chunk.as_str());
                Ok(())
            })],
            ..RewriteStrSettings::default()
        },
    );
    match stripped {
        Ok(_) => text.into_inner(),
        Err(_) => html.to_string(),
    }
}
