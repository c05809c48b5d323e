//! Token dictionaries shared by encoder and decoder.
//!
//! Strings found here travel as a one-byte index (primary dictionary) or a
//! dictionary tag plus a one-byte index (secondary dictionaries). The tables
//! are immutable and the reverse index is built once per process.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Primary dictionary. Index 0 is reserved for the empty string.
pub static SINGLE_BYTE_TOKENS: &[&str] = &[
    "",
    "xmlstreamstart",
    "xmlstreamend",
    "s.whatsapp.net",
    "type",
    "participant",
    "from",
    "receipt",
    "id",
    "notification",
    "disappearing_mode",
    "status",
    "jid",
    "broadcast",
    "user",
    "devices",
    "device_hash",
    "to",
    "offline",
    "message",
    "result",
    "class",
    "xmlns",
    "duration",
    "notify",
    "iq",
    "t",
    "ack",
    "g.us",
    "enc",
    "urn:xmpp:whatsapp:push",
    "presence",
    "config_value",
    "picture",
    "verified_name",
    "config_code",
    "key-index-list",
    "contact",
    "mediatype",
    "routing_info",
    "edge_routing",
    "get",
    "read",
    "urn:xmpp:ping",
    "fallback_hostname",
    "0",
    "chatstate",
    "business_hours_config",
    "unavailable",
    "download_buckets",
    "skmsg",
    "verified_level",
    "composing",
    "handshake",
    "device-list",
    "media",
    "text",
    "fallback_ip4",
    "media_conn",
    "device",
    "creation",
    "location",
    "config",
    "item",
    "fallback_ip6",
    "count",
    "w:profile:picture",
    "image",
    "business",
    "2",
    "hostname",
    "call-creator",
    "display_name",
    "relaylatency",
    "platform",
    "abprops",
    "success",
    "msg",
    "offline_preview",
    "prop",
    "key-index",
    "v",
    "day_of_week",
    "pkmsg",
    "version",
    "1",
    "ping",
    "w:p",
    "download",
    "video",
    "set",
    "specific_hours",
    "props",
    "primary",
    "unknown",
    "hash",
    "commerce_experience",
    "last",
    "subscribe",
    "max_buckets",
    "call",
    "profile",
    "member_since_text",
    "close_time",
    "call-id",
    "sticker",
    "mode",
    "participants",
    "value",
    "query",
    "profile_options",
    "open_time",
    "code",
    "list",
    "host",
    "ts",
    "contacts",
    "upload",
    "lid",
    "preview",
    "update",
    "usync",
    "w:stats",
    "delivery",
    "auth_ttl",
    "context",
    "fail",
    "cart_enabled",
    "appdata",
    "category",
    "atn",
    "direct_connection",
    "decrypt-fail",
    "relay_id",
    "mmg-fallback.whatsapp.net",
    "target",
    "available",
    "name",
    "last_id",
    "mmg.whatsapp.net",
    "categories",
    "401",
    "is_new",
    "index",
    "tctoken",
    "ip4",
    "token_id",
    "latency",
    "recipient",
    "edit",
    "ip6",
    "add",
    "thumbnail-document",
    "26",
    "paused",
    "true",
    "identity",
    "stream:error",
    "key",
    "sidelist",
    "background",
    "audio",
    "3",
    "thumbnail-image",
    "biz-cover-photo",
    "cat",
    "gcm",
    "thumbnail-video",
    "error",
    "auth",
    "deny",
    "serial",
    "in",
    "registration",
    "thumbnail-link",
    "remove",
    "00",
    "gif",
    "thumbnail-gif",
    "tag",
    "capability",
    "multicast",
    "item-not-found",
    "description",
    "business_hours",
    "config_expo_key",
    "md-app-state",
    "expiration",
    "fallback",
    "ttl",
    "300",
    "md-msg-hist",
    "device_orientation",
    "out",
    "w:m",
    "open_24h",
    "side_list",
    "token",
    "inactive",
    "account_sync",
    "phash",
    "false",
    "participants_cache",
    "conflict",
    "reason",
    "retry",
    "signed_prekey",
    "prekey",
    "skey",
    "keys",
    "w:g2",
    "newsletter",
    "interactive",
    "sender_key",
    "pair-device",
    "pair-success",
    "edge_routing_info",
    "encrypt",
    "notice",
    "addressing_mode",
    "call-offer",
    "group",
    "admin",
    "w:mex",
    "mute",
    "subject",
    "creator",
    "announcement",
    "locked",
    "invite",
    "terminate",
];

/// Secondary dictionary 0.
pub static DICTIONARY_0_TOKENS: &[&str] = &[
    "read-self",
    "active",
    "fbns",
    "protocol",
    "reaction",
    "screen_width",
    "heartbeat",
    "deviceid",
    "2:47DEQpj8",
    "uploadfieldstat",
    "voip_settings",
    "priority",
    "longitude",
    "ig_professional",
    "replaced",
    "preaccept",
    "cover_photo",
    "uncompressed",
    "encopt",
    "ppic",
    "04",
    "passive",
    "status-revoke-drop",
    "keygen",
    "540",
    "offer",
    "rate",
    "opus",
    "latitude",
    "w:gp2",
    "ver",
    "4",
    "business_profile",
    "medium",
    "sender",
    "prev_v_id",
    "email",
    "website",
    "invited",
    "sign_credential",
    "05",
    "transport",
    "peer_abtest_bucket",
    "America/Sao_Paulo",
    "appid",
    "refresh",
    "100",
    "06",
    "404",
    "101",
    "104",
    "107",
    "102",
    "109",
    "103",
    "member_add_mode",
    "105",
    "transaction-id",
    "110",
    "106",
    "outgoing",
    "108",
    "111",
    "tokens",
    "followers",
    "ig_handle",
    "self_pid",
    "tue",
    "dec",
    "thu",
    "joinable",
    "peer_pid",
    "mon",
    "features",
    "wed",
    "peer_device_presence",
    "pn",
    "delete",
    "07",
    "fri",
    "audio_duration",
    "connected",
    "delta",
    "rcat",
    "disable",
    "collection",
    "08",
    "480",
    "sat",
    "all",
    "accept",
    "critical_unblock_low",
    "group_update",
    "signed_credential",
    "blinded_credential",
    "eph_setting",
    "net",
    "09",
    "background_location",
    "refresh_id",
    "Asia/Kolkata",
    "privacy_mode_ts",
    "account_signature",
];

/// Secondary dictionary 1.
pub static DICTIONARY_1_TOKENS: &[&str] = &[
    "state",
    "all_admins",
    "link",
    "recording",
    "membership_approval_mode",
    "membership_approval_request",
    "eph_setting_update",
    "not-authorized",
    "parent",
    "linked_groups",
    "disappearing_mode_update",
    "membership",
    "announcement_groups",
    "revoke",
    "request_approval",
    "creator_country_code",
    "created_by",
    "allow_non_admin_sub_group_creation",
    "group_join",
    "reported",
    "verification",
    "suspended",
    "unlink",
    "missing_participant_identification",
    "addressing",
    "hidden",
    "invite_link",
    "invite_code",
    "growth_locked",
    "no_frequently_forwarded",
];

/// Secondary dictionary 2.
pub static DICTIONARY_2_TOKENS: &[&str] = &[
    "sender_key_distribution",
    "device_identity",
    "account_info",
    "history_sync",
    "app_state_sync",
    "peer_data_operation",
    "unified_session",
    "retry_count",
    "e2e_keys",
    "key_bundle",
    "identity_change",
    "prekey_low",
    "prekey_count",
    "signed_prekey_rotate",
    "session_reset",
];

/// Secondary dictionary 3.
pub static DICTIONARY_3_TOKENS: &[&str] = &[
    "newsletter_view",
    "reaction_codes",
    "subscribers",
    "verification_state",
    "picture_id",
    "mute_setting",
    "thread_metadata",
    "admin_count",
    "viewer_metadata",
    "message_count",
    "server_id",
    "live_updates",
];

/// Secondary dictionaries in tag order (`DICTIONARY_0` through `DICTIONARY_3`).
pub static DOUBLE_BYTE_TOKENS: [&[&str]; 4] = [
    DICTIONARY_0_TOKENS,
    DICTIONARY_1_TOKENS,
    DICTIONARY_2_TOKENS,
    DICTIONARY_3_TOKENS,
];

/// Location of a string inside the dictionaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// Index into [`SINGLE_BYTE_TOKENS`].
    Single(u8),
    /// Dictionary number and index into [`DOUBLE_BYTE_TOKENS`].
    Double(u8, u8),
}

fn reverse_index() -> &'static HashMap<&'static str, Token> {
    static INDEX: OnceLock<HashMap<&'static str, Token>> = OnceLock::new();
    INDEX.get_or_init(|| {
        let mut index = HashMap::new();
        for (dict, tokens) in DOUBLE_BYTE_TOKENS.iter().enumerate() {
            for (i, token) in tokens.iter().enumerate() {
                index.insert(*token, Token::Double(dict as u8, i as u8));
            }
        }
        // Primary entries win over secondary duplicates. Index 0 is never emitted.
        for (i, token) in SINGLE_BYTE_TOKENS.iter().enumerate().skip(1) {
            index.insert(*token, Token::Single(i as u8));
        }
        index
    })
}

/// Looks up the compact encoding of `value`, if any.
pub fn lookup(value: &str) -> Option<Token> {
    reverse_index().get(value).copied()
}

/// Resolves a primary dictionary index.
pub fn single_byte(index: u8) -> Option<&'static str> {
    SINGLE_BYTE_TOKENS.get(index as usize).copied()
}

/// Resolves a secondary dictionary index.
pub fn double_byte(dict: u8, index: u8) -> Option<&'static str> {
    DOUBLE_BYTE_TOKENS
        .get(dict as usize)
        .and_then(|tokens| tokens.get(index as usize))
        .copied()
}
