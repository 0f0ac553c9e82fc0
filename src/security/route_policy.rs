// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Route Authorization Policy
//!
//! Pure decision functions mapping `(role, route)` to allow / redirect /
//! not-found. Refusals are always redirects to a place the caller may
//! enter, never errors, and every redirect target is itself allowed for the
//! same caller.

use crate::types::Role;

use super::session::LOGIN_PATH;

/// Where the console starts when no destination is requested.
pub const ROOT_PATH: &str = "/";

/// Decision for one navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Allow,
    Redirect {
        to: String,
        /// Original destination to come back to after signing in.
        return_to: Option<String>,
    },
    /// No such route. Authenticated users get the not-found view inside the
    /// application shell; anonymous users get it standalone.
    NotFound { within_shell: bool },
}

/// Access rule for one route prefix.
#[derive(Debug, Clone, Copy)]
pub struct RouteRule {
    pub path: &'static str,
    pub public: bool,
    pub required: Option<&'static [Role]>,
    pub denied: Option<&'static [Role]>,
}

impl RouteRule {
    const fn public(path: &'static str) -> Self {
        Self {
            path,
            public: true,
            required: None,
            denied: None,
        }
    }

    const fn authenticated(path: &'static str) -> Self {
        Self {
            path,
            public: false,
            required: None,
            denied: None,
        }
    }

    const fn only(path: &'static str, roles: &'static [Role]) -> Self {
        Self {
            path,
            public: false,
            required: Some(roles),
            denied: None,
        }
    }

    const fn except(path: &'static str, roles: &'static [Role]) -> Self {
        Self {
            path,
            public: false,
            required: None,
            denied: Some(roles),
        }
    }

    /// Exact match, or a sub-path of this rule (`/patients/42`).
    fn matches(&self, path: &str) -> bool {
        path == self.path
            || path
                .strip_prefix(self.path)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// Every known route.
pub static ROUTES: &[RouteRule] = &[
    // Signed-in users have no business on the login screen.
    RouteRule {
        path: LOGIN_PATH,
        public: true,
        required: None,
        denied: Some(&Role::ALL),
    },
    RouteRule::public("/verify-email"),
    RouteRule::public("/forgot-password"),
    RouteRule::public("/reset-password"),
    RouteRule::except("/dashboard", &[Role::SuperAdmin]),
    RouteRule::only("/super-admin/dashboard", &[Role::SuperAdmin]),
    RouteRule::only("/users", &[Role::SuperAdmin, Role::Admin]),
    RouteRule::only("/clinic-reports", &[Role::SuperAdmin, Role::Admin]),
    RouteRule::only("/doctors", &[Role::Clinic, Role::Admin]),
    RouteRule::only("/patients", &[Role::Clinic, Role::Doctor]),
    RouteRule::only("/request-assessment", &[Role::Clinic]),
    RouteRule::only("/contract", &[Role::Clinic, Role::Admin]),
    RouteRule::authenticated("/settings"),
    RouteRule::authenticated("/profile"),
];

/// Home view of each role. Single source of truth for every redirect that
/// lands a user "at home".
pub fn role_home(role: Role) -> &'static str {
    match role {
        Role::SuperAdmin => "/super-admin/dashboard",
        Role::Admin | Role::Clinic | Role::Doctor => "/dashboard",
    }
}

/// Landing for `/`: the role home, or the login screen.
pub fn default_landing(role: Option<Role>) -> &'static str {
    role.map(role_home).unwrap_or(LOGIN_PATH)
}

/// Decide one navigation against an explicit rule.
pub fn authorize(
    role: Option<Role>,
    path: &str,
    public: bool,
    required: Option<&[Role]>,
    denied: Option<&[Role]>,
) -> RouteDecision {
    let Some(role) = role else {
        return if public {
            RouteDecision::Allow
        } else {
            RouteDecision::Redirect {
                to: LOGIN_PATH.to_string(),
                return_to: Some(path.to_string()),
            }
        };
    };

    let home = || RouteDecision::Redirect {
        to: role_home(role).to_string(),
        return_to: None,
    };

    if denied.is_some_and(|roles| roles.contains(&role)) {
        return home();
    }
    if required.is_some_and(|roles| !roles.contains(&role)) {
        return home();
    }
    RouteDecision::Allow
}

/// Find the rule covering `path`. Longest prefix wins.
pub fn find_route(path: &str) -> Option<&'static RouteRule> {
    ROUTES
        .iter()
        .filter(|rule| rule.matches(path))
        .max_by_key(|rule| rule.path.len())
}

/// Decide a navigation against the route table.
pub fn decide(role: Option<Role>, path: &str) -> RouteDecision {
    let path = normalize(path);

    if path == ROOT_PATH {
        return RouteDecision::Redirect {
            to: default_landing(role).to_string(),
            return_to: None,
        };
    }

    match find_route(&path) {
        Some(rule) => authorize(role, &path, rule.public, rule.required, rule.denied),
        None => RouteDecision::NotFound {
            within_shell: role.is_some(),
        },
    }
}

/// Strip query, fragment and trailing slashes; ensure a leading slash.
fn normalize(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default().trim();
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        ROOT_PATH.to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}
