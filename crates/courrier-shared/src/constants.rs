/// URI scheme used by shareable deep links.
pub const DEEP_LINK_SCHEME: &str = "courrier://";

/// Display name used when a peer's identity carries none.
pub const DEFAULT_DISPLAY_NAME: &str = "anon#1337";

/// Title given to a multi-member conversation before its name metadata
/// arrives. A later `created` for the same group may replace it, the other
/// way around never happens.
pub const UNKNOWN_CONVERSATION_TITLE: &str = "Unknown";
