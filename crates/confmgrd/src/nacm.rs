//! NETCONF access control (RFC 8341 subset).
//!
//! The ruleset is rebuilt from its source (the running datastore or an
//! external file) whenever the configuration changes, and is read-only
//! during evaluation. Rule-lists are scanned in order for the first rule
//! matching the request's module, rpc/path, and operation; without a match
//! the applicable default answers.

use std::fmt;

use tracing::debug;

use confmgr_common::netconf::{ErrorType, RpcError};
use confmgr_types::{DataPath, XmlNode};

/// Namespace of ietf-netconf-acm.
pub const NACM_NS: &str = "urn:ietf:params:xml:ns:yang:ietf-netconf-acm";

const ACCESS_CREATE: u8 = 0x01;
const ACCESS_READ: u8 = 0x02;
const ACCESS_UPDATE: u8 = 0x04;
const ACCESS_DELETE: u8 = 0x08;
const ACCESS_EXEC: u8 = 0x10;
const ACCESS_ALL: u8 = 0x1f;

/// The requested kind of access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOp {
    Create,
    Read,
    Update,
    Delete,
    Exec,
}

impl AccessOp {
    fn mask(&self) -> u8 {
        match self {
            AccessOp::Create => ACCESS_CREATE,
            AccessOp::Read => ACCESS_READ,
            AccessOp::Update => ACCESS_UPDATE,
            AccessOp::Delete => ACCESS_DELETE,
            AccessOp::Exec => ACCESS_EXEC,
        }
    }

    /// True for create/update/delete.
    pub fn is_write(&self) -> bool {
        matches!(self, AccessOp::Create | AccessOp::Update | AccessOp::Delete)
    }
}

impl fmt::Display for AccessOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessOp::Create => "create",
            AccessOp::Read => "read",
            AccessOp::Update => "update",
            AccessOp::Delete => "delete",
            AccessOp::Exec => "exec",
        };
        f.write_str(s)
    }
}

/// Access decision with its origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Access granted.
    Permit,
    /// Denied by a matching rule ("access denied").
    DenyRule,
    /// Denied by the applicable default ("default deny").
    DenyDefault,
}

impl Decision {
    /// True when access is granted.
    pub fn is_permit(&self) -> bool {
        matches!(self, Decision::Permit)
    }

    /// The protocol error for this denial; `op` selects the error layer:
    /// protocol for RPC authorization, application for data access.
    pub fn to_rpc_error(&self, op: AccessOp) -> RpcError {
        let error_type = if matches!(op, AccessOp::Exec) {
            ErrorType::Protocol
        } else {
            ErrorType::Application
        };
        let message = match self {
            Decision::DenyDefault => "default deny",
            _ => "access denied",
        };
        RpcError::access_denied(error_type, message)
    }
}

/// One access request.
#[derive(Debug, Clone)]
pub struct NacmRequest<'a> {
    /// Requesting user.
    pub user: &'a str,
    /// Requested operation.
    pub op: AccessOp,
    /// RPC name for exec requests.
    pub rpc_name: Option<&'a str>,
    /// Module name of the touched data, if known.
    pub module: Option<&'a str>,
    /// Path of the touched data node.
    pub path: Option<&'a DataPath>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleAction {
    Permit,
    Deny,
}

#[derive(Debug, Clone)]
struct Rule {
    name: String,
    module: Option<String>,
    rpc_name: Option<String>,
    path: Option<DataPath>,
    access: u8,
    action: RuleAction,
}

impl Rule {
    fn matches(&self, req: &NacmRequest<'_>) -> bool {
        if self.access & req.op.mask() == 0 {
            return false;
        }
        if let Some(module) = &self.module {
            if module != "*" && Some(module.as_str()) != req.module {
                return false;
            }
        }
        if let Some(rpc) = &self.rpc_name {
            if rpc != "*" && Some(rpc.as_str()) != req.rpc_name {
                return false;
            }
        }
        if let Some(path) = &self.path {
            match req.path {
                Some(req_path) => {
                    if !path.contains(req_path) && !req_path.contains(path) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
struct RuleList {
    name: String,
    groups: Vec<String>,
    rules: Vec<Rule>,
}

#[derive(Debug, Clone)]
struct Group {
    name: String,
    users: Vec<String>,
}

/// The evaluated NACM configuration.
#[derive(Debug, Clone, Default)]
pub struct NacmConfig {
    enabled: bool,
    read_default_deny: bool,
    write_default_deny: bool,
    exec_default_deny: bool,
    groups: Vec<Group>,
    rule_lists: Vec<RuleList>,
}

impl NacmConfig {
    /// Parses the `<nacm>` element of ietf-netconf-acm.
    ///
    /// Unknown children are ignored; absent defaults follow RFC 8341
    /// (read permit, write deny, exec permit).
    pub fn from_tree(nacm: &XmlNode) -> Self {
        let mut config = Self {
            enabled: nacm.find_body("enable-nacm") != Some("false"),
            read_default_deny: nacm.find_body("read-default") == Some("deny"),
            write_default_deny: nacm.find_body("write-default") != Some("permit"),
            exec_default_deny: nacm.find_body("exec-default") == Some("deny"),
            groups: Vec::new(),
            rule_lists: Vec::new(),
        };
        if let Some(groups) = nacm.find("groups") {
            for group in groups.find_all("group") {
                config.groups.push(Group {
                    name: group.find_body("name").unwrap_or_default().to_string(),
                    users: group
                        .find_all("user-name")
                        .filter_map(|u| u.body())
                        .map(str::to_string)
                        .collect(),
                });
            }
        }
        for rule_list in nacm.find_all("rule-list") {
            config.rule_lists.push(RuleList {
                name: rule_list.find_body("name").unwrap_or_default().to_string(),
                groups: rule_list
                    .find_all("group")
                    .filter_map(|g| g.body())
                    .map(str::to_string)
                    .collect(),
                rules: rule_list.find_all("rule").map(parse_rule).collect(),
            });
        }
        config
    }

    /// True when NACM is enforcing.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Groups the user belongs to.
    pub fn groups_for(&self, user: &str) -> Vec<&str> {
        self.groups
            .iter()
            .filter(|g| g.users.iter().any(|u| u == user))
            .map(|g| g.name.as_str())
            .collect()
    }

    /// Evaluates one request.
    pub fn authorize(&self, req: &NacmRequest<'_>) -> Decision {
        if !self.enabled {
            return Decision::Permit;
        }
        let groups = self.groups_for(req.user);
        for rule_list in &self.rule_lists {
            let applies = rule_list
                .groups
                .iter()
                .any(|g| g == "*" || groups.contains(&g.as_str()));
            if !applies {
                continue;
            }
            for rule in &rule_list.rules {
                if rule.matches(req) {
                    debug!(
                        user = req.user,
                        op = %req.op,
                        rule_list = rule_list.name.as_str(),
                        rule = rule.name.as_str(),
                        action = ?rule.action,
                        "nacm rule matched"
                    );
                    return match rule.action {
                        RuleAction::Permit => Decision::Permit,
                        RuleAction::Deny => Decision::DenyRule,
                    };
                }
            }
        }
        let default_deny = match req.op {
            AccessOp::Read => self.read_default_deny,
            AccessOp::Exec => self.exec_default_deny,
            _ => self.write_default_deny,
        };
        if default_deny {
            Decision::DenyDefault
        } else {
            Decision::Permit
        }
    }
}

fn parse_rule(rule: &XmlNode) -> Rule {
    let access = match rule.find_body("access-operations") {
        None | Some("*") => ACCESS_ALL,
        Some(ops) => ops
            .split_whitespace()
            .map(|op| match op {
                "create" => ACCESS_CREATE,
                "read" => ACCESS_READ,
                "update" => ACCESS_UPDATE,
                "delete" => ACCESS_DELETE,
                "exec" => ACCESS_EXEC,
                _ => 0,
            })
            .fold(0, |acc, m| acc | m),
    };
    Rule {
        name: rule.find_body("name").unwrap_or_default().to_string(),
        module: rule.find_body("module-name").map(str::to_string),
        rpc_name: rule.find_body("rpc-name").map(str::to_string),
        path: rule
            .find_body("path")
            .and_then(|p| DataPath::parse(p).ok()),
        access,
        action: if rule.find_body("action") == Some("permit") {
            RuleAction::Permit
        } else {
            RuleAction::Deny
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confmgr_types::parse_xml;
    use pretty_assertions::assert_eq;

    fn ruleset(body: &str) -> NacmConfig {
        let xml = format!(r#"<nacm xmlns="{NACM_NS}">{body}</nacm>"#);
        NacmConfig::from_tree(&parse_xml(&xml).unwrap())
    }

    const GROUPS: &str = "<groups>\
        <group><name>admin</name><user-name>alice</user-name></group>\
        <group><name>ops</name><user-name>bob</user-name></group>\
        </groups>";

    #[test]
    fn test_disabled_permits_everything() {
        let config = ruleset("<enable-nacm>false</enable-nacm><write-default>deny</write-default>");
        let req = NacmRequest {
            user: "nobody",
            op: AccessOp::Delete,
            rpc_name: None,
            module: None,
            path: None,
        };
        assert!(config.authorize(&req).is_permit());
    }

    #[test]
    fn test_write_default_deny() {
        let config = ruleset("<enable-nacm>true</enable-nacm>");
        let req = NacmRequest {
            user: "bob",
            op: AccessOp::Update,
            rpc_name: None,
            module: Some("example"),
            path: None,
        };
        let decision = config.authorize(&req);
        assert_eq!(decision, Decision::DenyDefault);
        let err = decision.to_rpc_error(AccessOp::Update);
        assert_eq!(err.message(), Some("default deny"));
        assert_eq!(err.error_type(), ErrorType::Application);
    }

    #[test]
    fn test_read_default_permits() {
        let config = ruleset("<enable-nacm>true</enable-nacm>");
        let req = NacmRequest {
            user: "bob",
            op: AccessOp::Read,
            rpc_name: None,
            module: None,
            path: None,
        };
        assert!(config.authorize(&req).is_permit());
    }

    #[test]
    fn test_group_rule_permits_write() {
        let config = ruleset(&format!(
            "{GROUPS}\
             <rule-list><name>admin-rules</name><group>admin</group>\
             <rule><name>all</name><module-name>*</module-name>\
             <access-operations>*</access-operations><action>permit</action></rule>\
             </rule-list>"
        ));
        let alice = NacmRequest {
            user: "alice",
            op: AccessOp::Update,
            rpc_name: None,
            module: Some("example"),
            path: None,
        };
        assert!(config.authorize(&alice).is_permit());
        // bob is not in admin; falls through to write-default deny.
        let bob = NacmRequest { user: "bob", ..alice };
        assert_eq!(config.authorize(&bob), Decision::DenyDefault);
    }

    #[test]
    fn test_deny_rule_message() {
        let config = ruleset(&format!(
            "{GROUPS}\
             <rule-list><name>lockdown</name><group>*</group>\
             <rule><name>no-commit</name><rpc-name>commit</rpc-name>\
             <access-operations>exec</access-operations><action>deny</action></rule>\
             </rule-list>"
        ));
        let req = NacmRequest {
            user: "alice",
            op: AccessOp::Exec,
            rpc_name: Some("commit"),
            module: None,
            path: None,
        };
        let decision = config.authorize(&req);
        assert_eq!(decision, Decision::DenyRule);
        let err = decision.to_rpc_error(AccessOp::Exec);
        assert_eq!(err.message(), Some("access denied"));
        assert_eq!(err.error_type(), ErrorType::Protocol);
    }

    #[test]
    fn test_rule_order_first_match_wins() {
        let config = ruleset(&format!(
            "{GROUPS}\
             <rule-list><name>mixed</name><group>admin</group>\
             <rule><name>deny-x</name><path>/x</path>\
             <access-operations>*</access-operations><action>deny</action></rule>\
             <rule><name>allow-all</name><module-name>*</module-name>\
             <access-operations>*</access-operations><action>permit</action></rule>\
             </rule-list>"
        ));
        let path = DataPath::parse("/x").unwrap();
        let denied = NacmRequest {
            user: "alice",
            op: AccessOp::Update,
            rpc_name: None,
            module: Some("example"),
            path: Some(&path),
        };
        assert_eq!(config.authorize(&denied), Decision::DenyRule);

        let other = DataPath::parse("/y").unwrap();
        let permitted = NacmRequest {
            user: "alice",
            op: AccessOp::Update,
            rpc_name: None,
            module: Some("example"),
            path: Some(&other),
        };
        assert!(config.authorize(&permitted).is_permit());
    }

    #[test]
    fn test_path_rule_covers_descendants() {
        let config = ruleset(&format!(
            "{GROUPS}\
             <rule-list><name>data</name><group>ops</group>\
             <rule><name>deny-servers</name><path>/servers</path>\
             <access-operations>update delete create</access-operations>\
             <action>deny</action></rule>\
             </rule-list>"
        ));
        let deep = DataPath::parse("/servers/server[name='a']/port").unwrap();
        let req = NacmRequest {
            user: "bob",
            op: AccessOp::Delete,
            rpc_name: None,
            module: None,
            path: Some(&deep),
        };
        assert_eq!(config.authorize(&req), Decision::DenyRule);
    }

    #[test]
    fn test_access_mask_filters() {
        let config = ruleset(&format!(
            "{GROUPS}\
             <rule-list><name>ro</name><group>ops</group>\
             <rule><name>read-only</name><module-name>*</module-name>\
             <access-operations>read</access-operations><action>permit</action></rule>\
             </rule-list>\
             <write-default>deny</write-default>"
        ));
        let read = NacmRequest {
            user: "bob",
            op: AccessOp::Read,
            rpc_name: None,
            module: Some("m"),
            path: None,
        };
        assert!(config.authorize(&read).is_permit());
        let write = NacmRequest { op: AccessOp::Update, ..read };
        assert_eq!(config.authorize(&write), Decision::DenyDefault);
    }
}
