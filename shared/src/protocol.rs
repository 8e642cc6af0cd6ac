/// API path prefix
pub const API_PREFIX: &str = "/v1";

/// Canonical token for a hop that never answered
pub const UNRESPONSIVE_HOP: &str = "*";

/// Hop indices printed by traceroute start at 1
pub const FIRST_HOP_INDEX: u32 = 1;
