use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Current UTC time as an RFC 3339 string.
pub fn now_rfc3339() -> String {
    format_rfc3339(OffsetDateTime::now_utc())
}

pub fn format_rfc3339(t: OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap_or_default()
}

pub fn parse_rfc3339(s: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339).ok()
}

/// Milliseconds between two RFC 3339 stamps. `None` if either fails to parse
/// or `end` precedes `start`.
pub fn elapsed_ms(start: &str, end: &str) -> Option<u64> {
    let start = parse_rfc3339(start)?;
    let end = parse_rfc3339(end)?;
    let ms = (end - start).whole_milliseconds();
    u64::try_from(ms).ok()
}
