//! Legacy pair-key derivation.
//!
//! Two-party messaging that predates the Conversation entity stores messages
//! under a deterministic string key instead of a conversation row. The key
//! must come out identical no matter which side derived it, otherwise the two
//! directions of a thread split apart.

use std::str::FromStr;

use crate::models::{ProfileRef, Role};

/// Derives the canonical key for a two-party thread:
/// `"{Role1}:{id1}|{Role2}:{id2}"`.
///
/// Same-role pairs sort the two profile IDs lexicographically so either
/// direction yields the same key. Cross-role pairs are ordered by the fixed
/// role order Admin, HR, Employee.
pub fn derive_pair_key(a: ProfileRef, b: ProfileRef) -> String {
    let (first, second) = if a.role() == b.role() {
        let (ida, idb) = (a.id().to_string(), b.id().to_string());
        if ida <= idb {
            (a, b)
        } else {
            (b, a)
        }
    } else if a.role().rank() <= b.role().rank() {
        (a, b)
    } else {
        (b, a)
    };

    format!(
        "{}:{}|{}:{}",
        first.role(),
        first.id(),
        second.role(),
        second.id()
    )
}

/// Parses a stored pair key back into its two participant refs. Tolerates
/// lowercase role tags from historical rows. Returns `None` for anything that
/// is not a pair key (UUID conversation keys included).
pub fn parse_pair_key(key: &str) -> Option<(ProfileRef, ProfileRef)> {
    let (left, right) = key.split_once('|')?;
    Some((parse_member(left)?, parse_member(right)?))
}

fn parse_member(s: &str) -> Option<ProfileRef> {
    let (role, id) = s.split_once(':')?;
    let role = Role::from_str(role).ok()?;
    let id = id.parse().ok()?;
    Some(ProfileRef::new(role, id))
}

/// Re-derives the canonical form of a historical key. Returns `None` when the
/// input is not a parseable pair key; returns the input unchanged (as a new
/// string) when it is already canonical.
pub fn normalize_pair_key(key: &str) -> Option<String> {
    let (a, b) = parse_pair_key(key)?;
    Some(derive_pair_key(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn same_role_key_is_order_independent() {
        let e1 = ProfileRef::Employee(Uuid::new_v4());
        let e2 = ProfileRef::Employee(Uuid::new_v4());
        assert_eq!(derive_pair_key(e1, e2), derive_pair_key(e2, e1));
    }

    #[test]
    fn same_role_key_sorts_ids_lexicographically() {
        let low: Uuid = "11111111-1111-1111-1111-111111111111".parse().unwrap();
        let high: Uuid = "99999999-9999-9999-9999-999999999999".parse().unwrap();
        let key = derive_pair_key(ProfileRef::Employee(high), ProfileRef::Employee(low));
        assert_eq!(key, format!("Employee:{}|Employee:{}", low, high));
    }

    #[test]
    fn cross_role_key_uses_fixed_role_order() {
        let admin = ProfileRef::Admin(Uuid::new_v4());
        let hr = ProfileRef::Hr(Uuid::new_v4());
        let employee = ProfileRef::Employee(Uuid::new_v4());

        let key = derive_pair_key(hr, admin);
        assert!(key.starts_with("Admin:"), "admin sorts first: {}", key);
        assert_eq!(key, derive_pair_key(admin, hr));

        let key = derive_pair_key(employee, hr);
        assert!(key.starts_with("HR:"), "hr sorts before employee: {}", key);
    }

    #[test]
    fn normalization_canonicalizes_swapped_legacy_keys() {
        let low: Uuid = "11111111-1111-1111-1111-111111111111".parse().unwrap();
        let high: Uuid = "99999999-9999-9999-9999-999999999999".parse().unwrap();
        let legacy = format!("employee:{}|employee:{}", high, low);
        assert_eq!(
            normalize_pair_key(&legacy).unwrap(),
            format!("Employee:{}|Employee:{}", low, high)
        );
    }

    #[test]
    fn normalization_rejects_non_pair_keys() {
        assert!(normalize_pair_key(&Uuid::new_v4().to_string()).is_none());
        assert!(normalize_pair_key("Manager:nope|Admin:nope").is_none());
        assert!(normalize_pair_key("").is_none());
    }
}
