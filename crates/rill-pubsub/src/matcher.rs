//! Channel, resource and recipient matching rules.

use rill_core::Uri;

use crate::subscription::Recipient;

/// Segment-wise pattern match: `*` matches exactly one segment, a single
/// trailing `**` matches any tail (including the empty one). The pattern's
/// host may also be `*`.
pub fn uri_matches(pattern: &Uri, value: &Uri) -> bool {
    if pattern.scheme() != value.scheme() {
        return false;
    }
    if pattern.host() != "*" && pattern.host() != value.host() {
        return false;
    }
    segments_match(pattern.segments(), value.segments())
}

fn segments_match(pattern: &[String], value: &[String]) -> bool {
    match pattern.first().map(String::as_str) {
        None => value.is_empty(),
        Some("**") if pattern.len() == 1 => true,
        Some("*") => !value.is_empty() && segments_match(&pattern[1..], &value[1..]),
        Some(literal) => {
            value.first().is_some_and(|v| v == literal) && segments_match(&pattern[1..], &value[1..])
        }
    }
}

/// Does any channel pattern of a subscription match the event channel?
pub fn any_channel_matches(patterns: &[Uri], channel: &Uri) -> bool {
    patterns.iter().any(|p| uri_matches(p, channel))
}

/// Filter event recipients against the subscription's recipient list.
///
/// Returns `None` when the subscription does not apply: the event names
/// recipients and none of them is equal to or a descendant of a
/// subscription recipient. An event without recipients applies everywhere
/// and keeps its empty list.
pub fn filter_recipients(event_recipients: &[Uri], subscription: &[Recipient]) -> Option<Vec<Uri>> {
    if event_recipients.is_empty() {
        return Some(Vec::new());
    }
    let matched: Vec<Uri> = event_recipients
        .iter()
        .filter(|er| subscription.iter().any(|sr| er.is_descendant_of(&sr.uri)))
        .cloned()
        .collect();
    if matched.is_empty() { None } else { Some(matched) }
}
