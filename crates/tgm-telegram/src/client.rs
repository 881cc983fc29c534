//! The chat-service adapter (C3): a thin, typed wrapper around
//! `grammers-client`'s raw `invoke` surface exposing exactly the
//! operations this service's workers need.

use grammers_client::{Client, Config};
use grammers_session::Session;
use grammers_tl_types as tl;
use rand::Rng;
use tracing::{debug, warn};

use crate::errors::{classify, ChatError};
use crate::peer::{raw_message_from_update, simplify_message, ChannelRef, ChatUpdate, RawMessage};
use tgm_common::identifiers::ChatRef;

#[derive(Clone)]
pub struct ChatClient {
    inner: Client,
}

/// Admin rights granted to operator-configured channel administrators
/// during auto-channel setup (C6).
fn full_admin_rights() -> tl::enums::ChatAdminRights {
    tl::enums::ChatAdminRights::Rights(tl::types::ChatAdminRights {
        change_info: true,
        post_messages: true,
        edit_messages: true,
        delete_messages: true,
        ban_users: true,
        invite_users: true,
        pin_messages: true,
        add_admins: true,
        anonymous: false,
        manage_call: true,
        other: true,
        manage_topics: false,
        post_stories: true,
        edit_stories: true,
        delete_stories: true,
    })
}

impl ChatClient {
    /// Connects using a previously-decrypted session blob. Returns
    /// `ChatError::SessionInvalid` if the session is rejected and
    /// `ChatError::FatalConfig` if the API id/hash themselves are invalid.
    pub async fn connect(api_id: i32, api_hash: &str, session_bytes: &[u8]) -> Result<Self, ChatError> {
        let session = Session::load(session_bytes).map_err(|_| ChatError::SessionInvalid)?;
        let config = Config {
            session,
            api_id,
            api_hash: api_hash.to_string(),
            params: Default::default(),
        };
        let inner = Client::connect(config).await.map_err(|e| {
            let message = e.to_string();
            if message.contains("API_ID_INVALID") || message.contains("API_ID_PUBLISHED_FLOOD") {
                ChatError::FatalConfig(message)
            } else if message.contains("AUTH_KEY") {
                ChatError::SessionInvalid
            } else {
                ChatError::Transient(message)
            }
        })?;
        if !inner.is_authorized().await.unwrap_or(false) {
            return Err(ChatError::SessionInvalid);
        }
        Ok(Self { inner })
    }

    fn classify_invocation(err: &grammers_client::client::bots::InvocationError) -> ChatError {
        let message = err.to_string();
        let code = message.split(" (").next().unwrap_or(&message).trim();
        classify(code, &message)
    }

    /// Resolves a canonicalized identifier (§6) into a channel. `SelfUser`
    /// and invite hashes are not channels this service mirrors directly and
    /// return `None`.
    pub async fn resolve_identifier(&self, chat_ref: &ChatRef) -> Result<Option<ChannelRef>, ChatError> {
        match chat_ref {
            ChatRef::Username(username) => self.resolve_username(username).await,
            ChatRef::NumericId(_) | ChatRef::InviteHash(_) | ChatRef::SelfUser => Ok(None),
        }
    }

    pub async fn resolve_username(&self, username: &str) -> Result<Option<ChannelRef>, ChatError> {
        let result = self
            .inner
            .invoke(&tl::functions::contacts::ResolveUsername { username: username.to_string() })
            .await
            .map_err(|e| Self::classify_invocation(&e))?;
        let tl::enums::contacts::ResolvedPeer::Peer(resolved) = result;
        for chat in resolved.chats {
            if let Some(channel_ref) = crate::peer::channel_ref_from_resolved(&chat) {
                return Ok(Some(channel_ref));
            }
        }
        Ok(None)
    }

    /// Resolves a username to an `InputUser`, for admin-promotion during
    /// auto-channel setup (C6). Distinct from `resolve_username` because the
    /// callers need a user peer, not a channel peer.
    pub async fn resolve_user(&self, username: &str) -> Result<Option<tl::enums::InputUser>, ChatError> {
        let result = self
            .inner
            .invoke(&tl::functions::contacts::ResolveUsername { username: username.to_string() })
            .await
            .map_err(|e| Self::classify_invocation(&e))?;
        let tl::enums::contacts::ResolvedPeer::Peer(resolved) = result;
        for user in resolved.users {
            if let tl::enums::User::User(u) = user {
                if let Some(access_hash) = u.access_hash {
                    return Ok(Some(tl::enums::InputUser::User(tl::types::InputUser {
                        user_id: u.id,
                        access_hash,
                    })));
                }
            }
        }
        Ok(None)
    }

    /// Forwards `message_ids` from `from` to `to` as anonymous copies
    /// (`drop_author=true`), recovering the resulting mirror message ids
    /// from the `UpdateMessageID` updates in the response.
    pub async fn forward_as_copy(
        &self,
        from: ChannelRef,
        to: ChannelRef,
        message_ids: &[i32],
    ) -> Result<Vec<Option<i32>>, ChatError> {
        let random_ids: Vec<i64> = message_ids.iter().map(|_| rand::thread_rng().gen()).collect();
        let updates = self
            .inner
            .invoke(&tl::functions::messages::ForwardMessages {
                silent: false,
                background: false,
                with_my_score: false,
                drop_author: true,
                drop_media_captions: false,
                noforwards: false,
                from_peer: from.as_input_peer(),
                id: message_ids.to_vec(),
                random_id: random_ids.clone(),
                to_peer: to.as_input_peer(),
                top_msg_id: None,
                schedule_date: None,
                send_as: None,
            })
            .await
            .map_err(|e| Self::classify_invocation(&e))?;

        Ok(extract_new_message_ids(&updates, &random_ids))
    }

    pub async fn send_text(&self, to: ChannelRef, text: &str) -> Result<i32, ChatError> {
        let random_id: i64 = rand::thread_rng().gen();
        let updates = self
            .inner
            .invoke(&tl::functions::messages::SendMessage {
                no_webpage: false,
                silent: false,
                background: false,
                clear_draft: false,
                noforwards: false,
                update_stickersets_order: false,
                invert_media: false,
                peer: to.as_input_peer(),
                reply_to: None,
                message: text.to_string(),
                random_id,
                reply_markup: None,
                entities: None,
                schedule_date: None,
                send_as: None,
                quick_reply_shortcut: None,
                effect: None,
            })
            .await
            .map_err(|e| Self::classify_invocation(&e))?;
        extract_new_message_ids(&updates, &[random_id])
            .into_iter()
            .next()
            .flatten()
            .ok_or_else(|| ChatError::Other("no message id in response".to_string()))
    }

    pub async fn edit_text(&self, chat: ChannelRef, message_id: i32, text: &str) -> Result<(), ChatError> {
        self.inner
            .invoke(&tl::functions::messages::EditMessage {
                no_webpage: false,
                invert_media: false,
                peer: chat.as_input_peer(),
                id: message_id,
                message: Some(text.to_string()),
                media: None,
                reply_markup: None,
                entities: None,
                schedule_date: None,
                quick_reply_shortcut_id: None,
            })
            .await
            .map_err(|e| Self::classify_invocation(&e))?;
        Ok(())
    }

    /// Fetches full channel metadata for the C10 health-check scheduler.
    pub async fn fetch_full_channel(&self, channel: ChannelRef) -> Result<tl::types::ChannelFull, ChatError> {
        let result = self
            .inner
            .invoke(&tl::functions::channels::GetFullChannel { channel: channel.as_input_channel() })
            .await
            .map_err(|e| Self::classify_invocation(&e))?;
        let tl::enums::messages::ChatFull::Full(full) = result;
        match full.full_chat {
            tl::enums::ChatFull::ChannelFull(channel_full) => Ok(channel_full),
            _ => Err(ChatError::Other("expected ChannelFull".to_string())),
        }
    }

    /// Fetches up to `limit` messages with id in `(min_id, max_id]`, oldest
    /// first, for the C7 history-backfill worker. `max_id = 0` means "from
    /// the latest message backwards".
    pub async fn get_history(
        &self,
        channel: ChannelRef,
        min_id: i32,
        max_id: i32,
        limit: i32,
    ) -> Result<Vec<RawMessage>, ChatError> {
        let result = self
            .inner
            .invoke(&tl::functions::messages::GetHistory {
                peer: channel.as_input_peer(),
                offset_id: max_id,
                offset_date: 0,
                add_offset: 0,
                limit,
                max_id: 0,
                min_id,
                hash: 0,
            })
            .await
            .map_err(|e| Self::classify_invocation(&e))?;
        let messages = match result {
            tl::enums::messages::Messages::Messages(m) => m.messages,
            tl::enums::messages::Messages::Slice(m) => m.messages,
            tl::enums::messages::Messages::ChannelMessages(m) => m.messages,
            tl::enums::messages::Messages::NotModified(_) => Vec::new(),
        };
        let mut out: Vec<RawMessage> = messages.iter().filter_map(simplify_message).collect();
        out.sort_by_key(|m| m.id);
        Ok(out)
    }

    /// Total message count in the channel, for seeding `progress_total`
    /// when a history-backfill task starts without a known total (C7).
    pub async fn get_total_message_count(&self, channel: ChannelRef) -> Result<i64, ChatError> {
        let result = self
            .inner
            .invoke(&tl::functions::messages::GetHistory {
                peer: channel.as_input_peer(),
                offset_id: 0,
                offset_date: 0,
                add_offset: 0,
                limit: 0,
                max_id: 0,
                min_id: 0,
                hash: 0,
            })
            .await
            .map_err(|e| Self::classify_invocation(&e))?;
        Ok(match result {
            tl::enums::messages::Messages::Slice(m) => m.count as i64,
            tl::enums::messages::Messages::ChannelMessages(m) => m.count as i64,
            tl::enums::messages::Messages::Messages(m) => m.messages.len() as i64,
            tl::enums::messages::Messages::NotModified(_) => 0,
        })
    }

    /// Creates a broadcast channel titled `title` for auto-mirror setup
    /// (C6).
    pub async fn create_broadcast_channel(&self, title: &str, about: &str) -> Result<ChannelRef, ChatError> {
        let updates = self
            .inner
            .invoke(&tl::functions::channels::CreateChannel {
                broadcast: true,
                megagroup: false,
                for_import: false,
                forum: false,
                title: title.to_string(),
                about: about.to_string(),
                geo_point: None,
                address: None,
                ttl_period: None,
            })
            .await
            .map_err(|e| Self::classify_invocation(&e))?;
        extract_created_channel(&updates).ok_or_else(|| ChatError::Other("channel creation returned no chat".to_string()))
    }

    /// Creates the discussion megagroup paired with a broadcast channel and
    /// links it via `SetDiscussionGroup`.
    pub async fn create_and_link_discussion(&self, broadcast: ChannelRef, title: &str) -> Result<ChannelRef, ChatError> {
        let updates = self
            .inner
            .invoke(&tl::functions::channels::CreateChannel {
                broadcast: false,
                megagroup: true,
                for_import: false,
                forum: false,
                title: title.to_string(),
                about: String::new(),
                geo_point: None,
                address: None,
                ttl_period: None,
            })
            .await
            .map_err(|e| Self::classify_invocation(&e))?;
        let group = extract_created_channel(&updates)
            .ok_or_else(|| ChatError::Other("discussion group creation returned no chat".to_string()))?;

        self.inner
            .invoke(&tl::functions::channels::SetDiscussionGroup {
                broadcast: broadcast.as_input_channel(),
                group: group.as_input_channel(),
            })
            .await
            .map_err(|e| Self::classify_invocation(&e))?;
        Ok(group)
    }

    /// Best-effort invite-link export; callers treat failure as non-fatal.
    pub async fn export_invite_link(&self, channel: ChannelRef) -> Result<String, ChatError> {
        let invite = self
            .inner
            .invoke(&tl::functions::messages::ExportChatInvite {
                legacy_revoke_permanent: false,
                request_needed: false,
                peer: channel.as_input_peer(),
                expire_date: None,
                usage_limit: None,
                title: None,
                subscription_pricing: None,
            })
            .await
            .map_err(|e| Self::classify_invocation(&e))?;
        match invite {
            tl::enums::ExportedChatInvite::ExportedChatInvite(e) => Ok(e.link),
            _ => Err(ChatError::Other("unexpected invite export variant".to_string())),
        }
    }

    /// Invites `user` into `channel` (tolerating `USER_ALREADY_PARTICIPANT`)
    /// then promotes it to full administrator (C6).
    pub async fn invite_and_promote_admin(&self, channel: ChannelRef, user: tl::enums::InputUser) -> Result<(), ChatError> {
        let invite_result = self
            .inner
            .invoke(&tl::functions::channels::InviteToChannel {
                channel: channel.as_input_channel(),
                users: vec![user.clone()],
            })
            .await;
        if let Err(e) = invite_result {
            let classified = Self::classify_invocation(&e);
            if classified.code() != Some("USER_ALREADY_PARTICIPANT") {
                return Err(classified);
            }
        }
        self.inner
            .invoke(&tl::functions::channels::EditAdmin {
                channel: channel.as_input_channel(),
                user_id: user,
                admin_rights: full_admin_rights(),
                rank: "admin".to_string(),
            })
            .await
            .map_err(|e| Self::classify_invocation(&e))?;
        Ok(())
    }

    /// Blocks until the next realtime update arrives, translated into the
    /// subset C9 cares about (new/edited channel messages, deletions).
    pub async fn next_update(&self) -> Result<ChatUpdate, ChatError> {
        let update = self.inner.next_update().await.map_err(|e| Self::classify_invocation(&e))?;
        Ok(match update {
            grammers_client::Update::NewMessage(message) => ChatUpdate::NewMessage {
                channel_id: message.chat().id(),
                message: raw_message_from_update(&message),
            },
            grammers_client::Update::MessageEdited(message) => ChatUpdate::MessageEdited {
                channel_id: message.chat().id(),
                message: raw_message_from_update(&message),
            },
            grammers_client::Update::MessageDeleted(deletion) => ChatUpdate::MessagesDeleted {
                channel_id: deletion.channel_id(),
                message_ids: deletion.messages().to_vec(),
            },
            _ => ChatUpdate::Other,
        })
    }

    /// Sleeps out a `flood_wait(s)` if `s` is within `max_wait_sec`, else
    /// returns it unchanged for the caller to pause the task.
    pub async fn sleep_for_flood_wait_if_within_budget(err: &ChatError, max_wait_sec: u32) -> Option<ChatError> {
        if let ChatError::FloodWait(secs) = err {
            if *secs <= max_wait_sec {
                debug!(secs, "sleeping out flood wait within budget");
                tokio::time::sleep(std::time::Duration::from_secs(*secs as u64 + 1)).await;
                return None;
            }
            warn!(secs, max_wait_sec, "flood wait exceeds budget, pausing task");
        }
        Some(err.clone())
    }
}

/// Extracts the created channel's `(id, access_hash)` from a
/// `channels.CreateChannel` response's embedded chat list.
fn extract_created_channel(updates: &tl::enums::Updates) -> Option<ChannelRef> {
    let chats: &[tl::enums::Chat] = match updates {
        tl::enums::Updates::Updates(u) => &u.chats,
        tl::enums::Updates::Combined(u) => &u.chats,
        _ => return None,
    };
    chats.iter().find_map(crate::peer::channel_ref_from_resolved)
}

/// Walks the `Updates` envelope looking for `UpdateMessageID` entries that
/// pair a `random_id` with the server-assigned message id, in the order
/// the caller's `random_id`s were submitted. `None` at a given position
/// means the random-id cross-reference didn't resolve it, which the caller
/// falls back on [`fallback_new_message_ids`] to recover.
fn extract_new_message_ids(updates: &tl::enums::Updates, random_ids: &[i64]) -> Vec<Option<i32>> {
    let update_list: Vec<tl::enums::Update> = match updates {
        tl::enums::Updates::Updates(u) => u.updates.clone(),
        tl::enums::Updates::Combined(u) => u.updates.clone(),
        _ => Vec::new(),
    };

    let mut results: Vec<Option<i32>> = random_ids
        .iter()
        .map(|rid| {
            update_list.iter().find_map(|u| match u {
                tl::enums::Update::MessageId(m) if m.random_id == *rid => Some(m.id),
                _ => None,
            })
        })
        .collect();

    let missing = results.iter().filter(|r| r.is_none()).count();
    if missing > 0 {
        fill_missing_from_embedded_messages(&update_list, &mut results, missing);
    }

    results
}

/// Fallback tier for when the random-id cross-reference is incomplete:
/// the envelope's own `NewMessage`/`NewChannelMessage` updates carry the
/// freshly-created messages in the same order the server processed them,
/// so the last `missing` of them are taken as a positional match for
/// whichever random-ids didn't resolve.
fn fill_missing_from_embedded_messages(update_list: &[tl::enums::Update], results: &mut [Option<i32>], missing: usize) {
    let embedded_ids: Vec<i32> = update_list
        .iter()
        .filter_map(|u| match u {
            tl::enums::Update::NewChannelMessage(m) => simplify_message(&m.message).map(|rm| rm.id),
            tl::enums::Update::NewMessage(m) => simplify_message(&m.message).map(|rm| rm.id),
            _ => None,
        })
        .collect();
    if embedded_ids.len() < missing {
        return;
    }
    let mut tail = embedded_ids[embedded_ids.len() - missing..].iter().copied();
    for slot in results.iter_mut() {
        if slot.is_none() {
            *slot = tail.next();
        }
    }
}
