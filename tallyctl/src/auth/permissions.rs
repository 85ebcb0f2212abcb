//! Hierarchical wildcard permissions.
//!
//! Permissions are dotted strings such as `web.user.items.read`. Users are assigned a single
//! role, which names a [`PermissionGroup`]; groups list permissions and inherit other groups.
//! At login (or cache repopulation) the role is expanded once into an ordered
//! [`EffectivePermissions`] list which is stored with the session, so requests never walk the
//! group graph.
//!
//! # Matching grammar
//!
//! [`check`] makes one pass over the effective list:
//!
//! - an exact match grants immediately
//! - `*` grants everything, unless a specific deny applies
//! - `prefix.*` grants `prefix` and everything below it, unless a specific deny applies
//! - a literal ending in `.read` denies the `.write` sibling, and vice versa
//!
//! Deny-inference means granting read access through an explicit literal never implies write
//! access to the same resource, even when a wildcard elsewhere in the list would cover it.
//!
//! # Group graph
//!
//! [`PermissionGroups::new`] validates the inheritance graph once at startup: every inherited
//! group must exist and the graph must be acyclic. Expansion relies on this and recurses without
//! a visited set.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// One named group from the permission configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PermissionGroup {
    pub permissions: Vec<String>,
    pub inherit: Vec<String>,
}

impl PermissionGroup {
    pub fn new<P, I>(permissions: P, inherit: I) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            permissions: permissions.into_iter().map(Into::into).collect(),
            inherit: inherit.into_iter().map(Into::into).collect(),
        }
    }
}

/// Errors detected while loading the group graph. All of them are fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PermissionConfigError {
    #[error("permission group '{group}' inherits from undefined group '{parent}'")]
    UnknownParent { group: String, parent: String },

    #[error("cyclic inheritance between permission groups: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("{role} group '{group}' is not defined")]
    UnknownGroup { role: &'static str, group: String },
}

/// Flattened, order-preserving permission list produced by [`PermissionGroups::expand`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EffectivePermissions(Vec<String>);

impl EffectivePermissions {
    pub fn new(permissions: Vec<String>) -> Self {
        Self(permissions)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn check(&self, required: &str) -> PermissionCheck {
        check(&self.0, required)
    }
}

impl From<Vec<String>> for EffectivePermissions {
    fn from(permissions: Vec<String>) -> Self {
        Self(permissions)
    }
}

/// Result of evaluating one required permission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionCheck {
    pub granted: bool,
    /// The entry that decided the outcome: the exact or wildcard grant, or the `.read`/`.write`
    /// literal that inferred a deny. `None` when nothing matched.
    pub matched_rule: Option<String>,
}

impl PermissionCheck {
    fn granted(rule: &str) -> Self {
        Self {
            granted: true,
            matched_rule: Some(rule.to_string()),
        }
    }

    fn denied(rule: Option<&str>) -> Self {
        Self {
            granted: false,
            matched_rule: rule.map(str::to_string),
        }
    }
}

/// Evaluate `required` against an effective permission list.
pub fn check<S: AsRef<str>>(effective: &[S], required: &str) -> PermissionCheck {
    let mut general_grant: Option<&str> = None;
    // deny target -> literal that inferred it
    let mut specific_denies: HashMap<String, &str> = HashMap::new();

    for entry in effective.iter().map(AsRef::as_ref) {
        if entry == required {
            return PermissionCheck::granted(entry);
        }

        if entry == "*" {
            general_grant.get_or_insert(entry);
            continue;
        }

        if let Some(prefix) = entry.strip_suffix(".*")
            && covers(prefix, required)
        {
            general_grant.get_or_insert(entry);
        }

        if let Some(resource) = entry.strip_suffix(".read") {
            specific_denies.entry(format!("{resource}.write")).or_insert(entry);
        }
        if let Some(resource) = entry.strip_suffix(".write") {
            specific_denies.entry(format!("{resource}.read")).or_insert(entry);
        }
    }

    if let Some(source) = specific_denies.get(required) {
        return PermissionCheck::denied(Some(source));
    }

    match general_grant {
        Some(rule) => PermissionCheck::granted(rule),
        None => PermissionCheck::denied(None),
    }
}

/// A wildcard prefix covers itself and anything below it on a segment boundary, so `web.user.*`
/// covers `web.user.items.read` but not `web.username`.
fn covers(prefix: &str, required: &str) -> bool {
    match required.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('.'),
        None => false,
    }
}

/// The validated, immutable group graph.
#[derive(Debug, Clone)]
pub struct PermissionGroups {
    groups: HashMap<String, PermissionGroup>,
    default_group: String,
}

impl PermissionGroups {
    /// Validate and build the group graph.
    ///
    /// Fails if any `inherit` entry names an undefined group, if `default_group` is undefined,
    /// or if inheritance contains a cycle.
    pub fn new(groups: BTreeMap<String, PermissionGroup>, default_group: impl Into<String>) -> Result<Self, PermissionConfigError> {
        let default_group = default_group.into();

        for (name, group) in &groups {
            if let Some(parent) = group.inherit.iter().find(|parent| !groups.contains_key(parent.as_str())) {
                return Err(PermissionConfigError::UnknownParent {
                    group: name.clone(),
                    parent: parent.clone(),
                });
            }
        }

        if !groups.contains_key(&default_group) {
            return Err(PermissionConfigError::UnknownGroup {
                role: "default",
                group: default_group,
            });
        }

        detect_cycles(&groups)?;

        Ok(Self {
            groups: groups.into_iter().collect(),
            default_group,
        })
    }

    /// Group assigned to newly created users.
    pub fn default_group(&self) -> &str {
        &self.default_group
    }

    pub fn contains(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    /// Expand `role` into its effective permission list, starting from `base`.
    ///
    /// The group's own permissions come first, followed by each inherited group's expansion in
    /// declaration order. An unknown role contributes nothing.
    pub fn expand(&self, base: &[String], role: &str) -> EffectivePermissions {
        let mut effective = base.to_vec();
        if self.groups.contains_key(role) {
            self.append_group(role, &mut effective);
        } else {
            warn!("Role '{}' does not name a permission group, granting no permissions", role);
        }
        EffectivePermissions(effective)
    }

    fn append_group(&self, name: &str, out: &mut Vec<String>) {
        let Some(group) = self.groups.get(name) else {
            return;
        };
        out.extend(group.permissions.iter().cloned());
        for parent in &group.inherit {
            self.append_group(parent, out);
        }
    }
}

/// Kahn's algorithm over the inheritance edges. Any group left with unresolved parents after the
/// queue drains is on, or downstream of, a cycle.
fn detect_cycles(groups: &BTreeMap<String, PermissionGroup>) -> Result<(), PermissionConfigError> {
    let mut pending_parents: HashMap<&str, usize> = HashMap::new();
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();

    for (name, group) in groups {
        pending_parents.insert(name.as_str(), group.inherit.len());
        for parent in &group.inherit {
            children.entry(parent.as_str()).or_default().push(name.as_str());
        }
    }

    let mut ready: VecDeque<&str> = pending_parents
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut resolved: HashSet<&str> = HashSet::new();

    while let Some(name) = ready.pop_front() {
        resolved.insert(name);
        for child in children.get(name).into_iter().flatten() {
            if let Some(count) = pending_parents.get_mut(child) {
                *count -= 1;
                if *count == 0 {
                    ready.push_back(child);
                }
            }
        }
    }

    if resolved.len() == groups.len() {
        return Ok(());
    }

    let unresolved = groups.keys().filter(|name| !resolved.contains(name.as_str())).cloned().collect();
    Err(PermissionConfigError::Cycle(unresolved))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The stock configuration: app <- user <- admin, and a standalone root.
    fn stock_groups() -> PermissionGroups {
        let mut groups = BTreeMap::new();
        groups.insert("app".to_string(), PermissionGroup::new(["app.web.login", "app.web.logout"], Vec::<String>::new()));
        groups.insert(
            "user".to_string(),
            PermissionGroup::new(["group.user", "web.user.*", "app.user.settings.*"], ["app"]),
        );
        groups.insert("admin".to_string(), PermissionGroup::new(["web.admin.*"], ["user"]));
        groups.insert("root".to_string(), PermissionGroup::new(["*"], Vec::<String>::new()));
        PermissionGroups::new(groups, "user").unwrap()
    }

    fn perms(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_expand_appends_inherited_groups_after_own_permissions() {
        let groups = stock_groups();
        let effective = groups.expand(&[], "admin");
        assert_eq!(
            effective.as_slice(),
            perms(&[
                "web.admin.*",
                "group.user",
                "web.user.*",
                "app.user.settings.*",
                "app.web.login",
                "app.web.logout"
            ])
        );
    }

    #[test]
    fn test_expand_keeps_base_overrides_first() {
        let groups = stock_groups();
        let effective = groups.expand(&perms(&["app.user.settings.read"]), "user");
        assert_eq!(effective.as_slice()[0], "app.user.settings.read");
        assert!(!effective.check("app.user.settings.write").granted);
    }

    #[test]
    fn test_expand_excludes_unreachable_groups() {
        let groups = stock_groups();
        let effective = groups.expand(&[], "user");
        assert!(!effective.iter().any(|p| p == "web.admin.*" || p == "*"));
        assert!(effective.iter().any(|p| p == "app.web.login"));
    }

    #[test]
    fn test_expand_declaration_order_and_diamonds() {
        let mut groups = BTreeMap::new();
        groups.insert("base".to_string(), PermissionGroup::new(["base.read"], Vec::<String>::new()));
        groups.insert("left".to_string(), PermissionGroup::new(["left.*"], ["base"]));
        groups.insert("right".to_string(), PermissionGroup::new(["right.*"], ["base"]));
        groups.insert("top".to_string(), PermissionGroup::new(["top.*"], ["right", "left"]));
        let groups = PermissionGroups::new(groups, "base").unwrap();

        let effective = groups.expand(&[], "top");
        assert_eq!(effective.as_slice(), perms(&["top.*", "right.*", "base.read", "left.*", "base.read"]));
    }

    #[test]
    fn test_expand_unknown_role_is_empty() {
        let groups = stock_groups();
        assert!(groups.expand(&[], "ghost").is_empty());
    }

    #[test]
    fn test_exact_match_grants() {
        let result = check(&perms(&["app.web.login"]), "app.web.login");
        assert_eq!(result, PermissionCheck::granted("app.web.login"));
    }

    #[test]
    fn test_root_wildcard_grants_anything() {
        let result = check(&perms(&["*"]), "anything.at.all");
        assert!(result.granted);
        assert_eq!(result.matched_rule.as_deref(), Some("*"));
    }

    #[test]
    fn test_prefix_wildcard_grants_both_siblings_without_literals() {
        let effective = perms(&["web.user.*"]);
        assert!(check(&effective, "web.user.items.read").granted);
        assert!(check(&effective, "web.user.items.write").granted);
        assert!(check(&effective, "web.user").granted);
        assert!(!check(&effective, "web.username.read").granted);
    }

    #[test]
    fn test_read_literal_denies_write_sibling() {
        let result = check(&perms(&["app.user.settings.read"]), "app.user.settings.write");
        assert!(!result.granted);
        assert_eq!(result.matched_rule.as_deref(), Some("app.user.settings.read"));
    }

    #[test]
    fn test_deny_inference_overrides_wildcards_in_any_position() {
        let before = perms(&["app.user.settings.*", "app.user.settings.read"]);
        let after = perms(&["app.user.settings.read", "app.user.settings.*"]);
        let root = perms(&["*", "app.user.settings.read"]);

        for effective in [before, after, root] {
            assert!(!check(&effective, "app.user.settings.write").granted, "{effective:?}");
            assert!(check(&effective, "app.user.settings.read").granted, "{effective:?}");
        }
    }

    #[test]
    fn test_write_literal_denies_read_sibling() {
        let effective = perms(&["*", "web.admin.items.write"]);
        assert!(!check(&effective, "web.admin.items.read").granted);
        assert!(check(&effective, "web.admin.items.write").granted);
    }

    #[test]
    fn test_explicit_sibling_literal_beats_inferred_deny() {
        let effective = perms(&["web.items.read", "web.items.write"]);
        assert!(check(&effective, "web.items.read").granted);
        assert!(check(&effective, "web.items.write").granted);
    }

    #[test]
    fn test_permissions_without_read_write_suffix_are_unaffected() {
        let effective = perms(&["web.items.read", "web.*"]);
        assert!(check(&effective, "web.items.delete").granted);
    }

    #[test]
    fn test_nothing_matches_is_not_granted() {
        assert_eq!(check(&perms(&["group.user"]), "web.admin.items.write"), PermissionCheck::denied(None));
        assert!(!check::<String>(&[], "web.user.read").granted);
    }

    #[test]
    fn test_role_scenarios() {
        let groups = stock_groups();
        let user = groups.expand(&[], "user");
        let admin = groups.expand(&[], "admin");

        let granted = user.check("web.user.store.read");
        assert!(granted.granted);
        assert_eq!(granted.matched_rule.as_deref(), Some("web.user.*"));

        assert!(!user.check("web.admin.items.write").granted);
        assert!(admin.check("web.admin.items.write").granted);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut groups = BTreeMap::new();
        groups.insert("a".to_string(), PermissionGroup::new(["a.*"], ["b"]));
        groups.insert("b".to_string(), PermissionGroup::new(["b.*"], ["c"]));
        groups.insert("c".to_string(), PermissionGroup::new(["c.*"], ["a"]));
        groups.insert("free".to_string(), PermissionGroup::default());

        let err = PermissionGroups::new(groups, "free").unwrap_err();
        assert_eq!(
            err,
            PermissionConfigError::Cycle(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn test_self_inheritance_is_a_cycle() {
        let mut groups = BTreeMap::new();
        groups.insert("loop".to_string(), PermissionGroup::new(["x"], ["loop"]));
        assert!(matches!(
            PermissionGroups::new(groups, "loop"),
            Err(PermissionConfigError::Cycle(_))
        ));
    }

    #[test]
    fn test_unknown_parent_and_default_group_are_rejected() {
        let mut groups = BTreeMap::new();
        groups.insert("user".to_string(), PermissionGroup::new(["x"], ["missing"]));
        assert_eq!(
            PermissionGroups::new(groups, "user").unwrap_err(),
            PermissionConfigError::UnknownParent {
                group: "user".to_string(),
                parent: "missing".to_string()
            }
        );

        let mut groups = BTreeMap::new();
        groups.insert("user".to_string(), PermissionGroup::default());
        assert!(matches!(
            PermissionGroups::new(groups, "nobody"),
            Err(PermissionConfigError::UnknownGroup { .. })
        ));
    }
}
