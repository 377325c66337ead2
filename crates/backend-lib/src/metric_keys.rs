// ==============
// crates/backend-lib/src/metric_keys.rs

//! Central place for Prometheus metric keys
pub const RELAY_CONNECTION: &str = "relay.connection";
pub const RELAY_ACTIVE: &str = "relay.active";
pub const RELAY_JOIN: &str = "relay.join";
pub const RELAY_BROADCAST: &str = "relay.broadcast";
pub const SIGNAL_FORWARDED: &str = "relay.signal.forwarded";
pub const MEETING_CREATED: &str = "meeting.created";
pub const MEETING_STARTED: &str = "meeting.started";
pub const MEETING_ENDED: &str = "meeting.ended";
pub const PARTICIPANT_JOINED: &str = "participant.joined";
pub const PARTICIPANT_LEFT: &str = "participant.left";
pub const TOKEN_ISSUED: &str = "token.issued";
pub const TOKEN_REVOKED: &str = "token.revoked";
pub const REVOCATIONS_PURGED: &str = "token.revocations.purged";
