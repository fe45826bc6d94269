//! WebSocket close codes and their human-readable reasons.

/// Normal closure
pub const NORMAL: u16 = 1000;
/// Endpoint going away
pub const GOING_AWAY: u16 = 1001;
/// Connection dropped without a close frame
pub const ABNORMAL: u16 = 1006;

/// Map a close code to the reason shown to the user.
pub fn reason(code: u16) -> String {
    let text = match code {
        1000 => "Normal closure",
        1001 => "Going away",
        1002 => "Protocol error",
        1003 => "Unsupported data",
        1004 => "Reserved",
        1005 => "No status",
        1006 => "Abnormal closure – connection lost",
        1007 => "Invalid data",
        1008 => "Policy violation",
        1009 => "Message too big",
        1010 => "Missing extension",
        1011 => "Internal error",
        1012 => "Service restart",
        1013 => "Try again later",
        1014 => "Bad gateway",
        1015 => "TLS handshake",
        other => return format!("Unknown error ({})", other),
    };
    text.to_string()
}

/// Whether a close code counts as "abnormal or unknown" for failure
/// classification. A missing code is unknown.
pub fn is_abnormal_or_unknown(code: Option<u16>) -> bool {
    match code {
        None => true,
        Some(ABNORMAL) => true,
        Some(code) => !(1000..=1015).contains(&code),
    }
}
