//! Resolved peer handles.
//!
//! The rest of this service stores channels as `(numeric_id, access_hash)`
//! pairs (see `tgm_common::SourceChannel`/`MirrorChannel`); this module
//! turns that pair into the `InputPeer`/`InputChannel` shapes the raw
//! MTProto API expects.

use grammers_tl_types as tl;

#[derive(Debug, Clone, Copy)]
pub struct ChannelRef {
    pub numeric_id: i64,
    pub access_hash: i64,
}

impl ChannelRef {
    pub fn new(numeric_id: i64, access_hash: i64) -> Self {
        Self { numeric_id, access_hash }
    }

    pub fn as_input_peer(&self) -> tl::enums::InputPeer {
        tl::enums::InputPeer::Channel(tl::types::InputPeerChannel {
            channel_id: self.numeric_id,
            access_hash: self.access_hash,
        })
    }

    pub fn as_input_channel(&self) -> tl::enums::InputChannel {
        tl::enums::InputChannel::Channel(tl::types::InputChannel {
            channel_id: self.numeric_id,
            access_hash: self.access_hash,
        })
    }
}

/// Extracts `(numeric_id, access_hash)` from a resolved `Chat`/`Channel`
/// TL object, panicking on non-channel peers since this service only ever
/// mirrors channels.
pub fn channel_ref_from_resolved(chat: &tl::enums::Chat) -> Option<ChannelRef> {
    match chat {
        tl::enums::Chat::Channel(c) => c.access_hash.map(|hash| ChannelRef::new(c.id, hash)),
        _ => None,
    }
}

/// A simplified view of a fetched history message; the subset of fields the
/// history-backfill and realtime workers actually branch on (C7/C9).
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub id: i32,
    pub date: i32,
    pub text: String,
    pub grouped_id: Option<i64>,
    pub has_media: bool,
    pub is_video: bool,
    pub file_size: Option<i64>,
    pub has_spoiler: bool,
    pub noforwards: bool,
}

/// Flattens a raw `tl::enums::Message` into the shape the workers consume,
/// returning `None` for service messages and other non-content variants.
pub fn simplify_message(message: &tl::enums::Message) -> Option<RawMessage> {
    let tl::enums::Message::Message(m) = message else { return None };
    let (has_media, is_video, file_size, has_spoiler) = match &m.media {
        Some(tl::enums::MessageMedia::Document(doc)) => {
            let is_video = matches!(&doc.document, Some(tl::enums::Document::Document(d))
                if d.attributes.iter().any(|a| matches!(a, tl::enums::DocumentAttribute::Video(_))));
            let size = match &doc.document {
                Some(tl::enums::Document::Document(d)) => Some(d.size),
                _ => None,
            };
            (true, is_video, size, doc.spoiler)
        }
        Some(tl::enums::MessageMedia::Photo(photo)) => (true, false, None, photo.spoiler),
        Some(_) => (true, false, None, false),
        None => (false, false, None, false),
    };
    Some(RawMessage {
        id: m.id,
        date: m.date,
        text: m.message.clone(),
        grouped_id: m.grouped_id,
        has_media,
        is_video,
        file_size,
        has_spoiler,
        noforwards: m.noforwards,
    })
}

/// A realtime update relevant to the mirroring workers (C9); everything
/// else (typing notices, read receipts, presence) collapses to `Other`.
#[derive(Debug)]
pub enum ChatUpdate {
    NewMessage { channel_id: i64, message: RawMessage },
    MessageEdited { channel_id: i64, message: RawMessage },
    MessagesDeleted { channel_id: Option<i64>, message_ids: Vec<i32> },
    Other,
}

/// Flattens a live `grammers_client` message into the same shape
/// `simplify_message` produces from history pages, so C9 never has to
/// branch on two different message representations. The spoiler flag
/// isn't exposed on the high-level media API and defaults to `false` here;
/// callers that need it precisely re-fetch via `get_history`.
pub fn raw_message_from_update(message: &grammers_client::types::Message) -> RawMessage {
    let (has_media, is_video, file_size) = match message.media() {
        Some(grammers_client::types::Media::Document(doc)) => {
            let is_video = doc.mime_type().map(|m| m.starts_with("video/")).unwrap_or(false);
            (true, is_video, Some(doc.size()))
        }
        Some(_) => (true, false, None),
        None => (false, false, None),
    };
    RawMessage {
        id: message.id(),
        date: message.date().timestamp() as i32,
        text: message.text().to_string(),
        grouped_id: message.grouped_id(),
        has_media,
        is_video,
        file_size,
        has_spoiler: false,
        noforwards: false,
    }
}
