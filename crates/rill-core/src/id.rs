//! Opaque id generation for requests, events, set locations and access keys.

use uuid::Uuid;

pub fn request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn event_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Opaque location id for a subscription set.
pub fn location_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn access_key() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Host instance guid used as the authority of `local://` addresses.
pub fn host_guid() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_url_safe() {
        let a = request_id();
        let b = request_id();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a.len(), 32);
    }
}
