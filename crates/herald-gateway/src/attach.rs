//! Attachment decoding and inbound content-block assembly.

use std::path::Path;

use base64::Engine;
use serde_json::Value;
use tracing::{debug, warn};

use herald_core::types::{ContentBlock, SavedAttachment, UserContent};

/// Decode base64 attachments from an HTTP body and save them to disk.
///
/// Each item needs `content_type` and `data` (base64); items missing either
/// are silently skipped. Optional `filename` keeps the original name; saved
/// files get a millisecond-timestamp prefix.
pub fn decode_attachments(raw: &[Value], download_dir: &Path) -> Vec<SavedAttachment> {
    if let Err(e) = std::fs::create_dir_all(download_dir) {
        warn!(error = %e, dir = %download_dir.display(), "cannot create download dir");
        return Vec::new();
    }

    let mut attachments = Vec::new();
    for item in raw {
        let content_type = item.get("content_type").and_then(|v| v.as_str()).unwrap_or("");
        let data_b64 = item.get("data").and_then(|v| v.as_str()).unwrap_or("");
        if content_type.is_empty() || data_b64.is_empty() {
            continue;
        }
        let data = match base64::engine::general_purpose::STANDARD.decode(data_b64) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "skipping attachment with invalid base64");
                continue;
            }
        };
        let filename = item
            .get("filename")
            .and_then(|v| v.as_str())
            .unwrap_or("attachment")
            .to_string();
        let ts = chrono::Utc::now().timestamp_millis();
        let local_path = download_dir.join(format!("{ts}_{filename}"));
        if let Err(e) = std::fs::write(&local_path, &data) {
            warn!(error = %e, path = %local_path.display(), "failed to save attachment");
            continue;
        }
        debug!(path = %local_path.display(), bytes = data.len(), "attachment saved");
        attachments.push(SavedAttachment {
            content_type: content_type.to_string(),
            local_path: local_path.display().to_string(),
            filename,
            size: data.len() as u64,
        });
    }
    attachments
}

/// Compose the inbound user content: plain text, or a block list embedding
/// image attachments (other types become a text marker naming the file).
pub fn build_user_content(text: String, attachments: &[SavedAttachment]) -> UserContent {
    if attachments.is_empty() {
        return UserContent::Text(text);
    }

    let mut blocks = vec![ContentBlock::Text { text }];
    for attachment in attachments {
        if attachment.content_type.starts_with("image/") {
            match std::fs::read(&attachment.local_path) {
                Ok(bytes) => blocks.push(ContentBlock::Image {
                    media_type: attachment.content_type.clone(),
                    data: base64::engine::general_purpose::STANDARD.encode(bytes),
                }),
                Err(e) => {
                    warn!(error = %e, path = %attachment.local_path, "cannot re-read image attachment");
                }
            }
        } else {
            blocks.push(ContentBlock::Text {
                text: format!(
                    "[attachment: {} ({}, {} bytes) saved at {}]",
                    attachment.filename, attachment.content_type, attachment.size, attachment.local_path
                ),
            });
        }
    }
    UserContent::Blocks(blocks)
}
