//! Cross-role communication policy.

use crate::error::{AppError, AppResult};
use crate::models::Role;

/// Whether `sender` may open a direct real-time send to `receiver`. The
/// matrix is directional: an admin can message an employee while the reverse
/// goes through the approval workflow instead.
pub fn can_message(sender: Role, receiver: Role) -> bool {
    match (sender, receiver) {
        (Role::Admin, _) => true,
        (Role::Hr, _) => true,
        (Role::Employee, Role::Hr) => true,
        (Role::Employee, Role::Employee) => true,
        (Role::Employee, Role::Admin) => false,
    }
}

/// How a send from `sender` to `receiver` is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Persist and deliver immediately.
    Allowed,
    /// Persist with `requires_approval = true`; deliver in real time but keep
    /// it out of inbox counts until an admin approves it.
    RequiresApproval,
    /// Reject the whole send.
    Denied,
}

pub fn delivery_policy(sender: Role, receiver: Role) -> DeliveryPolicy {
    if can_message(sender, receiver) {
        DeliveryPolicy::Allowed
    } else if sender == Role::Employee && receiver == Role::Admin {
        DeliveryPolicy::RequiresApproval
    } else {
        DeliveryPolicy::Denied
    }
}

/// Evaluates the policy against every recipient of a multi-party send. Any
/// denied pair rejects the whole send; any approval-gated pair marks the
/// message as requiring approval. Returns whether approval is required.
pub fn check_recipients(sender: Role, receivers: &[Role]) -> AppResult<bool> {
    let mut requires_approval = false;
    for &receiver in receivers {
        match delivery_policy(sender, receiver) {
            DeliveryPolicy::Allowed => {}
            DeliveryPolicy::RequiresApproval => requires_approval = true,
            DeliveryPolicy::Denied => {
                return Err(AppError::MessagingNotAllowed { sender, receiver });
            }
        }
    }
    Ok(requires_approval)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_is_directional() {
        assert!(can_message(Role::Admin, Role::Employee));
        assert!(!can_message(Role::Employee, Role::Admin));
    }

    #[test]
    fn admin_and_hr_reach_everyone() {
        for receiver in [Role::Admin, Role::Hr, Role::Employee] {
            assert!(can_message(Role::Admin, receiver));
            assert!(can_message(Role::Hr, receiver));
        }
    }

    #[test]
    fn employee_reaches_peers_and_hr() {
        assert!(can_message(Role::Employee, Role::Employee));
        assert!(can_message(Role::Employee, Role::Hr));
    }

    #[test]
    fn employee_to_admin_goes_through_approval() {
        assert_eq!(
            delivery_policy(Role::Employee, Role::Admin),
            DeliveryPolicy::RequiresApproval
        );
        assert_eq!(
            delivery_policy(Role::Admin, Role::Employee),
            DeliveryPolicy::Allowed
        );
    }

    #[test]
    fn multi_party_send_flags_approval_when_an_admin_is_present() {
        let requires = check_recipients(Role::Employee, &[Role::Hr, Role::Admin]).unwrap();
        assert!(requires);

        let requires = check_recipients(Role::Employee, &[Role::Hr, Role::Employee]).unwrap();
        assert!(!requires);
    }
}
