//! Reusable schema and payload fixtures.

use confmgr_yang::{LeafType, Module, SchemaNode};
use confmgrd::BackendPlugin;

/// Namespace of the example module used across the test suite.
pub const EXAMPLE_NS: &str = "urn:ex";

/// A plugin whose only job is to contribute schema modules.
pub struct SchemaPlugin {
    name: String,
    modules: Vec<Module>,
}

impl SchemaPlugin {
    /// The example module: leaf `x`, a keyed `servers` list with a unique
    /// port constraint, and the NACM config subtree.
    pub fn example() -> Self {
        Self {
            name: "example-schema".to_string(),
            modules: vec![example_module(), nacm_module()],
        }
    }

    /// A plugin contributing arbitrary modules.
    pub fn with_modules(name: &str, modules: Vec<Module>) -> Self {
        Self {
            name: name.to_string(),
            modules,
        }
    }
}

#[async_trait::async_trait]
impl BackendPlugin for SchemaPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn modules(&self) -> Vec<Module> {
        self.modules.clone()
    }
}

/// The example data module.
pub fn example_module() -> Module {
    Module::new("example", EXAMPLE_NS, "ex")
        .with_node(SchemaNode::leaf("x", LeafType::int32()))
        .with_node(
            SchemaNode::container("servers").with_child(
                SchemaNode::list("server", ["name"])
                    .with_unique(["port"])
                    .with_max_elements(8)
                    .with_child(SchemaNode::leaf("name", LeafType::string()))
                    .with_child(SchemaNode::leaf("port", LeafType::uint16()).mandatory()),
            ),
        )
}

/// Enough of ietf-netconf-acm for the internal NACM mode to validate.
pub fn nacm_module() -> Module {
    Module::new(
        "ietf-netconf-acm",
        "urn:ietf:params:xml:ns:yang:ietf-netconf-acm",
        "nacm",
    )
    .with_node(
        SchemaNode::container("nacm")
            .with_child(SchemaNode::leaf("enable-nacm", LeafType::Boolean))
            .with_child(SchemaNode::leaf(
                "read-default",
                LeafType::enumeration(["permit", "deny"]),
            ))
            .with_child(SchemaNode::leaf(
                "write-default",
                LeafType::enumeration(["permit", "deny"]),
            ))
            .with_child(SchemaNode::leaf(
                "exec-default",
                LeafType::enumeration(["permit", "deny"]),
            ))
            .with_child(
                SchemaNode::container("groups").with_child(
                    SchemaNode::list("group", ["name"])
                        .with_child(SchemaNode::leaf("name", LeafType::string()))
                        .with_child(SchemaNode::leaf_list("user-name", LeafType::string())),
                ),
            )
            .with_child(
                SchemaNode::list("rule-list", ["name"])
                    .with_child(SchemaNode::leaf("name", LeafType::string()))
                    .with_child(SchemaNode::leaf_list("group", LeafType::string()))
                    .with_child(
                        SchemaNode::list("rule", ["name"])
                            .with_child(SchemaNode::leaf("name", LeafType::string()))
                            .with_child(SchemaNode::leaf("module-name", LeafType::string()))
                            .with_child(SchemaNode::leaf("rpc-name", LeafType::string()))
                            .with_child(SchemaNode::leaf("path", LeafType::string()))
                            .with_child(SchemaNode::leaf(
                                "access-operations",
                                LeafType::string(),
                            ))
                            .with_child(SchemaNode::leaf(
                                "action",
                                LeafType::enumeration(["permit", "deny"]),
                            )),
                    ),
            ),
    )
}

/// `edit-config` payload setting `/x` in the candidate.
pub fn edit_x(value: &str) -> String {
    format!(
        "<edit-config><target><candidate/></target>\
         <config><x xmlns=\"{EXAMPLE_NS}\">{value}</x></config></edit-config>"
    )
}

/// `edit-config` payload adding one server entry to the candidate.
pub fn edit_server(name: &str, port: &str) -> String {
    format!(
        "<edit-config><target><candidate/></target>\
         <config><servers xmlns=\"{EXAMPLE_NS}\">\
         <server><name>{name}</name><port>{port}</port></server>\
         </servers></config></edit-config>"
    )
}
