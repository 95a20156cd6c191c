//! InnerTube `get_live_chat` response model.
//!
//! Only the fields the normalizer reads are modelled. Every field that the
//! platform has been seen to omit is optional, so a missing avatar or badge
//! list never fails the whole response; unknown actions and renderers are
//! captured as raw JSON and dropped later.

use serde::{Deserialize, Serialize};

/// Response from the `get_live_chat` endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLiveChatResponse {
    /// Absent once the live chat has ended
    #[serde(default)]
    pub continuation_contents: Option<ContinuationContents>,
}

impl GetLiveChatResponse {
    pub fn live_chat_continuation(&self) -> Option<&LiveChatContinuation> {
        self.continuation_contents
            .as_ref()
            .and_then(|c| c.live_chat_continuation.as_ref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuationContents {
    #[serde(default)]
    pub live_chat_continuation: Option<LiveChatContinuation>,
}

/// Actions plus the token for the next request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiveChatContinuation {
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub continuations: Vec<ContinuationData>,
}

/// One entry of the `continuations` array. Exactly one field is normally set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuationData {
    #[serde(default)]
    pub invalidation_continuation_data: Option<ContinuationToken>,
    #[serde(default)]
    pub timed_continuation_data: Option<ContinuationToken>,
    #[serde(default)]
    pub reload_continuation_data: Option<ContinuationToken>,
}

impl ContinuationData {
    pub fn token(&self) -> Option<&ContinuationToken> {
        self.invalidation_continuation_data
            .as_ref()
            .or(self.timed_continuation_data.as_ref())
            .or(self.reload_continuation_data.as_ref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuationToken {
    pub continuation: String,
    /// Suggested wait before the next request, in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Text made of runs, or a single simple text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub runs: Vec<MessageRun>,
    #[serde(default)]
    pub simple_text: Option<String>,
}

impl Message {
    /// Flatten runs to plain text. Emoji runs render as their first shortcut.
    pub fn plain_text(&self) -> String {
        if let Some(text) = &self.simple_text {
            return text.clone();
        }
        self.runs.iter().map(MessageRun::plain_text).collect()
    }
}

/// A fragment of a message, containing either text or an emoji.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageRun {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub emoji: Option<Emoji>,
}

impl MessageRun {
    pub fn plain_text(&self) -> String {
        if let Some(text) = &self.text {
            return text.clone();
        }
        match &self.emoji {
            Some(emoji) => emoji
                .shortcuts
                .first()
                .cloned()
                .unwrap_or_else(|| format!(":{}:", emoji.emoji_id)),
            None => String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Emoji {
    #[serde(default)]
    pub emoji_id: String,
    #[serde(default)]
    pub shortcuts: Vec<String>,
    #[serde(default)]
    pub is_custom_emoji: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Thumbnails {
    #[serde(default)]
    pub thumbnails: Vec<Thumbnail>,
}

impl Thumbnails {
    pub fn first_url(&self) -> Option<&str> {
        self.thumbnails.first().map(|t| t.url.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thumbnail {
    pub url: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

/// Badge displayed next to an author's name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorBadge {
    #[serde(rename = "liveChatAuthorBadgeRenderer", default)]
    pub renderer: Option<LiveChatAuthorBadgeRenderer>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveChatAuthorBadgeRenderer {
    #[serde(default)]
    pub icon: Option<Icon>,
    /// Present on membership badges
    #[serde(default)]
    pub custom_thumbnail: Option<Thumbnails>,
    #[serde(default)]
    pub tooltip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Icon {
    pub icon_type: String,
}

/// Fields shared by every author-attributed renderer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorFields {
    #[serde(default)]
    pub author_name: Option<Message>,
    #[serde(default)]
    pub author_photo: Option<Thumbnails>,
    #[serde(default)]
    pub author_external_channel_id: Option<String>,
    #[serde(default)]
    pub author_badges: Vec<AuthorBadge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveChatTextMessageRenderer {
    pub id: String,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub timestamp_usec: Option<String>,
    #[serde(flatten)]
    pub author: AuthorFields,
}

/// Super Chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveChatPaidMessageRenderer {
    pub id: String,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub timestamp_usec: Option<String>,
    #[serde(default)]
    pub purchase_amount_text: Option<Message>,
    #[serde(flatten)]
    pub author: AuthorFields,
}

/// Super Sticker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveChatPaidStickerRenderer {
    pub id: String,
    #[serde(default)]
    pub timestamp_usec: Option<String>,
    #[serde(default)]
    pub purchase_amount_text: Option<Message>,
    #[serde(default)]
    pub sticker: Option<Thumbnails>,
    #[serde(flatten)]
    pub author: AuthorFields,
}

/// New member or milestone message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveChatMembershipItemRenderer {
    pub id: String,
    #[serde(default)]
    pub timestamp_usec: Option<String>,
    #[serde(default)]
    pub header_primary_text: Option<Message>,
    #[serde(default)]
    pub header_subtext: Option<Message>,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(flatten)]
    pub author: AuthorFields,
}

/// Gift membership purchase. Author fields live inside the header renderer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveChatSponsorshipsGiftPurchaseAnnouncementRenderer {
    pub id: String,
    #[serde(default)]
    pub timestamp_usec: Option<String>,
    #[serde(default)]
    pub author_external_channel_id: Option<String>,
    #[serde(default)]
    pub header: Option<SponsorshipsHeader>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SponsorshipsHeader {
    #[serde(rename = "liveChatSponsorshipsHeaderRenderer", default)]
    pub renderer: Option<LiveChatSponsorshipsHeaderRenderer>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveChatSponsorshipsHeaderRenderer {
    #[serde(default)]
    pub primary_text: Option<Message>,
    #[serde(flatten)]
    pub author: AuthorFields,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddChatItemActionWrapper {
    pub add_chat_item_action: AddChatItemAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddChatItemAction {
    pub item: ChatItem,
}

/// Archived chat wraps the same actions one level deeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayChatItemActionWrapper {
    pub replay_chat_item_action: ReplayChatItemAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayChatItemAction {
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// Actions in the live chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Action {
    AddChatItem(AddChatItemActionWrapper),
    ReplayChatItem(ReplayChatItemActionWrapper),
    /// Ticker, removal, moderation and anything newer
    Unknown(serde_json::Value),
}

/// Chat item renderers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatItem {
    TextMessage {
        #[serde(rename = "liveChatTextMessageRenderer")]
        renderer: LiveChatTextMessageRenderer,
    },
    PaidMessage {
        #[serde(rename = "liveChatPaidMessageRenderer")]
        renderer: LiveChatPaidMessageRenderer,
    },
    PaidSticker {
        #[serde(rename = "liveChatPaidStickerRenderer")]
        renderer: LiveChatPaidStickerRenderer,
    },
    MembershipItem {
        #[serde(rename = "liveChatMembershipItemRenderer")]
        renderer: LiveChatMembershipItemRenderer,
    },
    SponsorshipsGiftPurchaseAnnouncement {
        #[serde(rename = "liveChatSponsorshipsGiftPurchaseAnnouncementRenderer")]
        renderer: LiveChatSponsorshipsGiftPurchaseAnnouncementRenderer,
    },
    Unknown(serde_json::Value),
}

impl ChatItem {
    /// Returns a string identifying the type of chat item
    pub fn get_type(&self) -> &'static str {
        match self {
            ChatItem::TextMessage { .. } => "textMessage",
            ChatItem::PaidMessage { .. } => "paidMessage",
            ChatItem::PaidSticker { .. } => "paidSticker",
            ChatItem::MembershipItem { .. } => "membershipItem",
            ChatItem::SponsorshipsGiftPurchaseAnnouncement { .. } => {
                "sponsorshipsGiftPurchaseAnnouncement"
            }
            ChatItem::Unknown(_) => "unknown",
        }
    }
}

/// Next continuation token and its suggested timeout, if the response carries one.
pub fn get_next_continuation(response: &GetLiveChatResponse) -> Option<&ContinuationToken> {
    response
        .live_chat_continuation()?
        .continuations
        .iter()
        .find_map(ContinuationData::token)
}
