use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = raid_common::id::prefixed_ulid("gw");
/// assert!(id.starts_with("gw_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Well-known ID prefixes.
pub mod prefix {
    /// Gateway connection (one per WebSocket).
    pub const GATEWAY_SESSION: &str = "gw";
    pub const ROOM: &str = "room";
    pub const CHANNEL: &str = "ch";
    pub const USER: &str = "usr";
}
