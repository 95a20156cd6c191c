//! 生ペイロードから [`ChatEvent`] への正規化
//!
//! 種別はペイロードの形（`snippet.type` やレンダラー名）だけで判定し、
//! 本文の内容からは推測しない。未知の種別や必須の詳細を欠く課金イベントは
//! 捨てて件数だけ数える。

use crate::api::innertube::get_live_chat::{
    Action, AuthorBadge, AuthorFields, ChatItem, GetLiveChatResponse,
};
use crate::api::youtube::{LiveChatMessageItem, LiveChatMessagesResponse};
use crate::models::{ChatEvent, EventVariant, RoleFlags};
use crate::poller::RawPayload;
use chrono::{DateTime, TimeZone, Utc};

/// 正規化の結果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    /// 受信順のイベント
    pub events: Vec<ChatEvent>,
    /// 未対応の種別で捨てた件数
    pub dropped: usize,
}

pub fn normalize(raw: &RawPayload) -> Normalized {
    match raw {
        RawPayload::Official(response) => normalize_official(response),
        RawPayload::Unofficial(response) => normalize_innertube(response),
    }
}

// =============================================================================
// 公式API
// =============================================================================

pub fn normalize_official(response: &LiveChatMessagesResponse) -> Normalized {
    let mut normalized = Normalized::default();
    for item in &response.items {
        match official_event(item) {
            Some(event) => normalized.events.push(event),
            None => {
                tracing::debug!(
                    "🗑️ Dropping official item {} of type {}",
                    item.id,
                    item.snippet.message_type
                );
                normalized.dropped += 1;
            }
        }
    }
    normalized
}

fn official_variant(item: &LiveChatMessageItem) -> Option<EventVariant> {
    let snippet = &item.snippet;
    let variant = match snippet.message_type.as_str() {
        "textMessageEvent" => EventVariant::Text,
        "superChatEvent" => {
            let details = snippet.super_chat_details.as_ref()?;
            EventVariant::PaidPromotion {
                amount: details.amount_display_string.clone().unwrap_or_default(),
                currency: details.currency.clone().unwrap_or_default(),
            }
        }
        "superStickerEvent" => {
            let metadata = snippet
                .super_sticker_details
                .as_ref()?
                .super_sticker_metadata
                .as_ref()?;
            EventVariant::PaidSticker {
                sticker_id: metadata.sticker_id.clone(),
            }
        }
        "newSponsorEvent" => EventVariant::Membership {
            level: snippet
                .new_sponsor_details
                .as_ref()
                .and_then(|d| d.member_level_name.clone())
                .unwrap_or_default(),
        },
        "memberMilestoneChatEvent" => EventVariant::Membership {
            level: "milestone".to_string(),
        },
        "membershipGiftingEvent" => EventVariant::MembershipGift {
            count: snippet
                .membership_gifting_details
                .as_ref()
                .and_then(|d| d.gift_memberships_count)
                .unwrap_or(1),
        },
        "giftMembershipReceivedEvent" => EventVariant::MembershipGift { count: 1 },
        _ => return None,
    };
    Some(variant)
}

fn official_event(item: &LiveChatMessageItem) -> Option<ChatEvent> {
    let variant = official_variant(item)?;
    let published_at = item
        .snippet
        .published_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))?;

    let author = item.author_details.clone().unwrap_or_default();
    Some(ChatEvent {
        id: item.id.clone(),
        author_id: author.channel_id,
        author_display_name: author.display_name,
        author_avatar_url: author.profile_image_url.unwrap_or_default(),
        published_at,
        body_text: item.snippet.display_message.clone().unwrap_or_default(),
        role_flags: RoleFlags {
            owner: author.is_chat_owner,
            moderator: author.is_chat_moderator,
            member: author.is_chat_sponsor,
            verified: author.is_verified,
        },
        variant,
    })
}

// =============================================================================
// InnerTube
// =============================================================================

pub fn normalize_innertube(response: &GetLiveChatResponse) -> Normalized {
    let mut normalized = Normalized::default();
    if let Some(continuation) = response.live_chat_continuation() {
        collect_actions(&continuation.actions, &mut normalized);
    }
    normalized
}

fn collect_actions(actions: &[Action], out: &mut Normalized) {
    for action in actions {
        match action {
            Action::AddChatItem(wrapper) => match innertube_event(&wrapper.add_chat_item_action.item)
            {
                Some(event) => out.events.push(event),
                None => {
                    tracing::debug!(
                        "🗑️ Dropping chat item of type {}",
                        wrapper.add_chat_item_action.item.get_type()
                    );
                    out.dropped += 1;
                }
            },
            Action::ReplayChatItem(wrapper) => {
                collect_actions(&wrapper.replay_chat_item_action.actions, out)
            }
            Action::Unknown(_) => out.dropped += 1,
        }
    }
}

fn innertube_event(item: &ChatItem) -> Option<ChatEvent> {
    match item {
        ChatItem::TextMessage { renderer } => Some(build_event(
            &renderer.id,
            &renderer.author,
            &renderer.timestamp_usec,
            renderer.message.as_ref().map(|m| m.plain_text()),
            EventVariant::Text,
        )),
        ChatItem::PaidMessage { renderer } => {
            let amount_text = renderer.purchase_amount_text.as_ref()?.plain_text();
            let (amount, currency) = parse_amount(&amount_text);
            Some(build_event(
                &renderer.id,
                &renderer.author,
                &renderer.timestamp_usec,
                renderer.message.as_ref().map(|m| m.plain_text()),
                EventVariant::PaidPromotion { amount, currency },
            ))
        }
        ChatItem::PaidSticker { renderer } => {
            let sticker_id = renderer.sticker.as_ref()?.first_url()?.to_string();
            Some(build_event(
                &renderer.id,
                &renderer.author,
                &renderer.timestamp_usec,
                None,
                EventVariant::PaidSticker { sticker_id },
            ))
        }
        ChatItem::MembershipItem { renderer } => {
            let level = renderer
                .header_subtext
                .as_ref()
                .map(|t| t.plain_text())
                .unwrap_or_default();
            let mut event = build_event(
                &renderer.id,
                &renderer.author,
                &renderer.timestamp_usec,
                renderer.message.as_ref().map(|m| m.plain_text()),
                EventVariant::Membership { level },
            );
            event.role_flags.member = true;
            Some(event)
        }
        ChatItem::SponsorshipsGiftPurchaseAnnouncement { renderer } => {
            let header = renderer
                .header
                .as_ref()
                .and_then(|h| h.renderer.clone())
                .unwrap_or_default();
            let text = header
                .primary_text
                .as_ref()
                .map(|t| t.plain_text())
                .unwrap_or_default();
            let count = text
                .chars()
                .filter(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse()
                .unwrap_or(1);

            let mut author = header.author;
            if author.author_external_channel_id.is_none() {
                author.author_external_channel_id = renderer.author_external_channel_id.clone();
            }
            let mut event = build_event(
                &renderer.id,
                &author,
                &renderer.timestamp_usec,
                Some(text),
                EventVariant::MembershipGift { count },
            );
            event.role_flags.member = true;
            Some(event)
        }
        ChatItem::Unknown(_) => None,
    }
}

fn build_event(
    id: &str,
    author: &AuthorFields,
    timestamp_usec: &Option<String>,
    body: Option<String>,
    variant: EventVariant,
) -> ChatEvent {
    ChatEvent {
        id: id.to_string(),
        author_id: author.author_external_channel_id.clone().unwrap_or_default(),
        author_display_name: author
            .author_name
            .as_ref()
            .map(|n| n.plain_text())
            .unwrap_or_default(),
        author_avatar_url: author
            .author_photo
            .as_ref()
            .and_then(|p| p.first_url())
            .unwrap_or_default()
            .to_string(),
        published_at: parse_timestamp_usec(timestamp_usec),
        body_text: body.unwrap_or_default(),
        role_flags: badge_flags(&author.author_badges),
        variant,
    }
}

/// バッジからロールを判定する。メンバーはカスタムサムネイルの有無で見る
fn badge_flags(badges: &[AuthorBadge]) -> RoleFlags {
    let mut flags = RoleFlags::default();
    for renderer in badges.iter().filter_map(|b| b.renderer.as_ref()) {
        if let Some(icon) = &renderer.icon {
            match icon.icon_type.as_str() {
                "OWNER" => flags.owner = true,
                "MODERATOR" => flags.moderator = true,
                "VERIFIED" => flags.verified = true,
                _ => {}
            }
        }
        if renderer.custom_thumbnail.is_some() {
            flags.member = true;
        }
    }
    flags
}

fn parse_timestamp_usec(timestamp_usec: &Option<String>) -> DateTime<Utc> {
    timestamp_usec
        .as_deref()
        .and_then(|ts| ts.parse::<i64>().ok())
        .and_then(|usec| Utc.timestamp_micros(usec).single())
        .unwrap_or_else(|| {
            tracing::debug!("Invalid timestampUsec {:?}, using receive time", timestamp_usec);
            Utc::now()
        })
}

/// 金額表示を金額と通貨に分ける（例: "¥1,000" -> ("1,000", "JPY")）
pub fn parse_amount(text: &str) -> (String, String) {
    let currency = if text.starts_with('¥') || text.starts_with('￥') {
        "JPY"
    } else if text.starts_with('€') {
        "EUR"
    } else if text.starts_with('£') {
        "GBP"
    } else {
        "USD"
    };

    let amount = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .collect();

    (amount, currency.to_string())
}
