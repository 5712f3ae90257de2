use crate::error::SwiftCauseError;
use crate::session::{Role, Session};
use serde::{Deserialize, Serialize};

/// Things a session can act on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Dashboard,
    Campaigns,
    Donations,
    GiftAid,
    Kiosks,
    Users,
    Organization,
    Billing,
    KioskCheckout,
}

impl Resource {
    pub fn name(self) -> &'static str {
        match self {
            Self::Dashboard => "dashboard",
            Self::Campaigns => "campaigns",
            Self::Donations => "donations",
            Self::GiftAid => "gift_aid",
            Self::Kiosks => "kiosks",
            Self::Users => "users",
            Self::Organization => "organization",
            Self::Billing => "billing",
            Self::KioskCheckout => "kiosk_checkout",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    View,
    Create,
    Update,
    Delete,
    Donate,
}

impl Action {
    pub fn name(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Donate => "donate",
        }
    }
}

const NONE: &[Action] = &[];
const VIEW: &[Action] = &[Action::View];
const VIEW_UPDATE: &[Action] = &[Action::View, Action::Update];
const MANAGE: &[Action] = &[Action::View, Action::Create, Action::Update, Action::Delete];
const DONATE: &[Action] = &[Action::View, Action::Donate];

/// Role-membership authorization.
///
/// Every permission question in the engine goes through `allowed_actions`, so the
/// table below is the whole policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessPolicy;

impl AccessPolicy {
    pub fn allowed_actions(role: Role, resource: Resource) -> &'static [Action] {
        use Resource::*;

        match role {
            Role::SuperAdmin => match resource {
                KioskCheckout => DONATE,
                _ => MANAGE,
            },
            Role::Admin => match resource {
                KioskCheckout => DONATE,
                Dashboard => VIEW,
                _ => MANAGE,
            },
            Role::Manager => match resource {
                Dashboard | Donations | GiftAid | Users => VIEW,
                Campaigns | Kiosks => MANAGE,
                Organization | Billing | KioskCheckout => NONE,
            },
            Role::Operator => match resource {
                Dashboard | Campaigns | Donations => VIEW,
                Kiosks => VIEW_UPDATE,
                _ => NONE,
            },
            Role::Viewer => match resource {
                Dashboard | Campaigns | Donations => VIEW,
                _ => NONE,
            },
            Role::Kiosk => match resource {
                Campaigns => VIEW,
                KioskCheckout => DONATE,
                _ => NONE,
            },
        }
    }

    pub fn is_allowed(role: Role, resource: Resource, action: Action) -> bool {
        Self::allowed_actions(role, resource).contains(&action)
    }

    pub fn authorize(
        session: &Session,
        resource: Resource,
        action: Action,
    ) -> Result<(), SwiftCauseError> {
        if Self::is_allowed(session.role, resource, action) {
            return Ok(());
        }
        Err(SwiftCauseError::Forbidden(format!(
            "role '{}' may not {} {}",
            session.role.as_str(),
            action.name(),
            resource.name()
        )))
    }

    /// Kiosks with an assignment list may only collect for the listed campaigns.
    pub fn authorize_campaign(session: &Session, campaign_id: &str) -> Result<(), SwiftCauseError> {
        if !session.is_kiosk() || session.assigned_campaigns.is_empty() {
            return Ok(());
        }
        if session.assigned_campaigns.iter().any(|id| id == campaign_id) {
            return Ok(());
        }
        Err(SwiftCauseError::Forbidden(format!(
            "kiosk '{}' is not assigned to campaign '{}'",
            session.principal_id, campaign_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kiosk_can_only_donate_and_view_campaigns() {
        assert!(AccessPolicy::is_allowed(Role::Kiosk, Resource::KioskCheckout, Action::Donate));
        assert!(AccessPolicy::is_allowed(Role::Kiosk, Resource::Campaigns, Action::View));
        assert!(!AccessPolicy::is_allowed(Role::Kiosk, Resource::Donations, Action::View));
        assert!(!AccessPolicy::is_allowed(Role::Kiosk, Resource::Campaigns, Action::Update));
    }

    #[test]
    fn billing_is_admin_only() {
        assert!(AccessPolicy::is_allowed(Role::Admin, Resource::Billing, Action::Update));
        assert!(AccessPolicy::is_allowed(Role::SuperAdmin, Resource::Billing, Action::Update));
        for role in [Role::Manager, Role::Operator, Role::Viewer, Role::Kiosk] {
            assert!(!AccessPolicy::is_allowed(role, Resource::Billing, Action::View));
        }
    }

    #[test]
    fn viewer_denial_names_role_action_and_resource() {
        let session = Session::admin("u-1", Role::Viewer, None);
        let err = AccessPolicy::authorize(&session, Resource::Campaigns, Action::Delete).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Forbidden: role 'viewer' may not delete campaigns"
        );
    }

    #[test]
    fn kiosk_assignment_restricts_campaigns() {
        let session = Session::kiosk("k-1", None, vec!["camp-a".to_string()]);
        assert!(AccessPolicy::authorize_campaign(&session, "camp-a").is_ok());
        assert!(AccessPolicy::authorize_campaign(&session, "camp-b").is_err());

        let unassigned = Session::kiosk("k-2", None, vec![]);
        assert!(AccessPolicy::authorize_campaign(&unassigned, "camp-b").is_ok());
    }
}
