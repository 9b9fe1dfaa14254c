//! NETCONF error construction according to RFC 6241 Appendix A.
//!
//! Every error is built as an in-memory [`XmlNode`] tree; the serialized
//! form is always the rendered tree, so the two shapes cannot diverge.
//! Per-tag constructors encode the fixed rules: `lock-denied` is always a
//! protocol error carrying the holder's session-id, `malformed-message` is
//! always an rpc error, `data-exists` is always an application error. The
//! RFC 7950 list errors (`data-not-unique`, `too-many-elements`,
//! `too-few-elements`) are `operation-failed` with the corresponding
//! `error-app-tag`.
//!
//! Free-form messages are stored raw in the tree; the renderer escapes all
//! character data, so user-supplied text can never break the envelope.

use std::fmt;

use confmgr_types::XmlNode;

/// NETCONF `error-type` (RFC 6241 §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    /// Secure transport layer.
    Transport,
    /// RPC layer.
    Rpc,
    /// Protocol operation layer.
    Protocol,
    /// Content layer.
    Application,
}

impl ErrorType {
    /// Returns the wire form of the error type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Transport => "transport",
            ErrorType::Rpc => "rpc",
            ErrorType::Protocol => "protocol",
            ErrorType::Application => "application",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// NETCONF `error-tag` values (RFC 6241 Appendix A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorTag {
    InUse,
    InvalidValue,
    TooBig,
    MissingAttribute,
    BadAttribute,
    UnknownAttribute,
    MissingElement,
    BadElement,
    UnknownElement,
    UnknownNamespace,
    AccessDenied,
    LockDenied,
    ResourceDenied,
    RollbackFailed,
    DataExists,
    DataMissing,
    OperationNotSupported,
    OperationFailed,
    MalformedMessage,
}

impl ErrorTag {
    /// Returns the wire form of the error tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorTag::InUse => "in-use",
            ErrorTag::InvalidValue => "invalid-value",
            ErrorTag::TooBig => "too-big",
            ErrorTag::MissingAttribute => "missing-attribute",
            ErrorTag::BadAttribute => "bad-attribute",
            ErrorTag::UnknownAttribute => "unknown-attribute",
            ErrorTag::MissingElement => "missing-element",
            ErrorTag::BadElement => "bad-element",
            ErrorTag::UnknownElement => "unknown-element",
            ErrorTag::UnknownNamespace => "unknown-namespace",
            ErrorTag::AccessDenied => "access-denied",
            ErrorTag::LockDenied => "lock-denied",
            ErrorTag::ResourceDenied => "resource-denied",
            ErrorTag::RollbackFailed => "rollback-failed",
            ErrorTag::DataExists => "data-exists",
            ErrorTag::DataMissing => "data-missing",
            ErrorTag::OperationNotSupported => "operation-not-supported",
            ErrorTag::OperationFailed => "operation-failed",
            ErrorTag::MalformedMessage => "malformed-message",
        }
    }
}

impl fmt::Display for ErrorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single NETCONF `<rpc-error>`.
///
/// Severity is always `error`; RFC 6241 defines no other value for the
/// errors a server originates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    error_type: ErrorType,
    tag: ErrorTag,
    app_tag: Option<String>,
    path: Option<String>,
    info: Vec<XmlNode>,
    message: Option<String>,
}

impl RpcError {
    fn new(error_type: ErrorType, tag: ErrorTag) -> Self {
        Self {
            error_type,
            tag,
            app_tag: None,
            path: None,
            info: Vec::new(),
            message: None,
        }
    }

    /// The request requires a resource already in use.
    pub fn in_use(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self::new(error_type, ErrorTag::InUse).with_message(message)
    }

    /// The request specifies an unacceptable value.
    pub fn invalid_value(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self::new(error_type, ErrorTag::InvalidValue).with_message(message)
    }

    /// Request or response too large for the implementation.
    pub fn too_big(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self::new(error_type, ErrorTag::TooBig).with_message(message)
    }

    /// An expected attribute is missing.
    pub fn missing_attribute(
        error_type: ErrorType,
        bad_attribute: &str,
        bad_element: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::new(error_type, ErrorTag::MissingAttribute)
            .with_attribute_info(bad_attribute, bad_element)
            .with_message(message)
    }

    /// An attribute value is not correct.
    pub fn bad_attribute(
        error_type: ErrorType,
        bad_attribute: &str,
        bad_element: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::new(error_type, ErrorTag::BadAttribute)
            .with_attribute_info(bad_attribute, bad_element)
            .with_message(message)
    }

    /// An unexpected attribute is present.
    pub fn unknown_attribute(
        error_type: ErrorType,
        bad_attribute: &str,
        bad_element: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::new(error_type, ErrorTag::UnknownAttribute)
            .with_attribute_info(bad_attribute, bad_element)
            .with_message(message)
    }

    /// An expected element is missing.
    pub fn missing_element(
        error_type: ErrorType,
        element: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::new(error_type, ErrorTag::MissingElement)
            .with_info(XmlNode::new("bad-element").with_body(element))
            .with_message(message)
    }

    /// An element value is not correct.
    pub fn bad_element(error_type: ErrorType, element: &str, message: impl Into<String>) -> Self {
        Self::new(error_type, ErrorTag::BadElement)
            .with_info(XmlNode::new("bad-element").with_body(element))
            .with_message(message)
    }

    /// An unexpected element is present.
    pub fn unknown_element(
        error_type: ErrorType,
        element: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::new(error_type, ErrorTag::UnknownElement)
            .with_info(XmlNode::new("bad-element").with_body(element))
            .with_message(message)
    }

    /// An unexpected namespace is present.
    pub fn unknown_namespace(
        error_type: ErrorType,
        namespace: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::new(error_type, ErrorTag::UnknownNamespace)
            .with_info(XmlNode::new("bad-namespace").with_body(namespace))
            .with_message(message)
    }

    /// Authorization failed for the operation or data.
    pub fn access_denied(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self::new(error_type, ErrorTag::AccessDenied).with_message(message)
    }

    /// The lock is held by another session. Always a protocol error; the
    /// holder's session-id travels in `error-info`.
    pub fn lock_denied(holder_session_id: u32, message: impl Into<String>) -> Self {
        Self::new(ErrorType::Protocol, ErrorTag::LockDenied)
            .with_info(XmlNode::new("session-id").with_body(holder_session_id.to_string()))
            .with_message(message)
    }

    /// Insufficient resources to complete the request.
    pub fn resource_denied(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self::new(error_type, ErrorTag::ResourceDenied).with_message(message)
    }

    /// A rollback was requested but could not be completed.
    pub fn rollback_failed(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self::new(error_type, ErrorTag::RollbackFailed).with_message(message)
    }

    /// A `create` operation hit existing data. Always an application error.
    pub fn data_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Application, ErrorTag::DataExists).with_message(message)
    }

    /// A `delete` operation hit missing data. Always an application error.
    ///
    /// When `missing_choice` is set the error carries the RFC 7950 §15.6
    /// `missing-choice` app-tag and `error-info`.
    pub fn data_missing(missing_choice: Option<&str>, message: impl Into<String>) -> Self {
        let mut err =
            Self::new(ErrorType::Application, ErrorTag::DataMissing).with_message(message);
        if let Some(choice) = missing_choice {
            err = err
                .with_app_tag("missing-choice")
                .with_info(XmlNode::new("missing-choice").with_body(choice));
        }
        err
    }

    /// The requested operation is not implemented.
    pub fn operation_not_supported(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self::new(error_type, ErrorTag::OperationNotSupported).with_message(message)
    }

    /// The operation failed for a reason not covered by another tag.
    pub fn operation_failed(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self::new(error_type, ErrorTag::OperationFailed).with_message(message)
    }

    /// The message could not be parsed. Always an rpc error.
    pub fn malformed_message(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Rpc, ErrorTag::MalformedMessage).with_message(message)
    }

    /// A `unique` constraint would be invalidated (RFC 7950 §15.1).
    ///
    /// `non_unique` enumerates the offending sibling paths, one
    /// `<non-unique>` element each.
    pub fn data_not_unique<I, S>(non_unique: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut err = Self::new(ErrorType::Protocol, ErrorTag::OperationFailed)
            .with_app_tag("data-not-unique");
        for path in non_unique {
            err.info
                .push(XmlNode::new("non-unique").with_body(path.into()));
        }
        err
    }

    /// A list would have too many or too few entries (RFC 7950 §15.2/15.3).
    pub fn minmax_elements(list_path: &str, too_many: bool) -> Self {
        Self::new(ErrorType::Protocol, ErrorTag::OperationFailed)
            .with_app_tag(if too_many {
                "too-many-elements"
            } else {
                "too-few-elements"
            })
            .with_path(list_path)
    }

    /// Sets the error message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        let message = message.into();
        if !message.is_empty() {
            self.message = Some(message);
        }
        self
    }

    /// Sets the `error-app-tag`.
    pub fn with_app_tag(mut self, app_tag: impl Into<String>) -> Self {
        self.app_tag = Some(app_tag.into());
        self
    }

    /// Sets the `error-path`.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Appends an `error-info` child element.
    pub fn with_info(mut self, info: XmlNode) -> Self {
        self.info.push(info);
        self
    }

    fn with_attribute_info(self, bad_attribute: &str, bad_element: &str) -> Self {
        self.with_info(XmlNode::new("bad-attribute").with_body(bad_attribute))
            .with_info(XmlNode::new("bad-element").with_body(bad_element))
    }

    /// The error type.
    pub fn error_type(&self) -> ErrorType {
        self.error_type
    }

    /// The error tag.
    pub fn tag(&self) -> ErrorTag {
        self.tag
    }

    /// The `error-app-tag`, if set.
    pub fn app_tag(&self) -> Option<&str> {
        self.app_tag.as_deref()
    }

    /// The `error-path`, if set.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// The `error-info` children.
    pub fn info(&self) -> &[XmlNode] {
        &self.info
    }

    /// The error message, if set.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Builds the canonical `<rpc-error>` tree.
    ///
    /// Element order follows the canonical envelope: type, tag, severity,
    /// app-tag, path, info, message.
    pub fn to_error_xml(&self) -> XmlNode {
        let mut err = XmlNode::new("rpc-error")
            .with_child(XmlNode::new("error-type").with_body(self.error_type.as_str()))
            .with_child(XmlNode::new("error-tag").with_body(self.tag.as_str()))
            .with_child(XmlNode::new("error-severity").with_body("error"));
        if let Some(app_tag) = &self.app_tag {
            err.push(XmlNode::new("error-app-tag").with_body(app_tag.clone()));
        }
        if let Some(path) = &self.path {
            err.push(XmlNode::new("error-path").with_body(path.clone()));
        }
        if !self.info.is_empty() {
            let mut info = XmlNode::new("error-info");
            for child in &self.info {
                info.push(child.clone());
            }
            err.push(info);
        }
        if let Some(message) = &self.message {
            err.push(XmlNode::new("error-message").with_body(message.clone()));
        }
        err
    }

    /// Builds a complete `<rpc-reply>` carrying this error.
    pub fn to_reply_xml(&self) -> XmlNode {
        XmlNode::new("rpc-reply").with_child(self.to_error_xml())
    }

    /// Serialized reply; always the rendered tree form.
    pub fn to_message_string(&self) -> String {
        self.to_reply_xml().render()
    }

    /// One-line summary for logs: type, tag, message, then info.
    pub fn log_summary(&self) -> String {
        let mut out = format!("{} {}", self.error_type, self.tag);
        if let Some(message) = &self.message {
            out.push(' ');
            out.push_str(message);
        }
        for info in &self.info {
            out.push(' ');
            out.push_str(&info.render());
        }
        out
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.log_summary())
    }
}

impl std::error::Error for RpcError {}

/// Builds an `<rpc-reply><ok/></rpc-reply>` tree.
pub fn ok_reply() -> XmlNode {
    XmlNode::new("rpc-reply").with_child(XmlNode::new("ok"))
}

/// Builds an `<rpc-reply><data>…</data></rpc-reply>` tree.
pub fn data_reply<I: IntoIterator<Item = XmlNode>>(children: I) -> XmlNode {
    let mut data = XmlNode::new("data");
    for child in children {
        data.push(child);
    }
    XmlNode::new("rpc-reply").with_child(data)
}

/// Builds a reply carrying several errors in order.
pub fn error_reply<'a, I: IntoIterator<Item = &'a RpcError>>(errors: I) -> XmlNode {
    let mut reply = XmlNode::new("rpc-reply");
    for err in errors {
        reply.push(err.to_error_xml());
    }
    reply
}

/// Outcome of [`try_merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Merge applied cleanly.
    Ok,
    /// Merge conflicted; the accumulator now carries an
    /// `operation-failed` error instead of data.
    Failed,
    /// Caller error: the trees are not mergeable at all.
    Fatal,
}

/// Merges `x` into the accumulated reply tree.
///
/// On the first call (`acc` empty) the tree is copied in. A conflict --
/// the same leaf present on both sides with different bodies -- trims the
/// accumulator and installs an `operation-failed` reply naming the
/// conflicting node. Roots with different names cannot be merged.
pub fn try_merge(acc: &mut Option<XmlNode>, x: &XmlNode) -> MergeOutcome {
    let Some(target) = acc else {
        *acc = Some(x.clone());
        return MergeOutcome::Ok;
    };
    if target.name() != x.name() || target.namespace() != x.namespace() {
        return MergeOutcome::Fatal;
    }
    match merge_children(target, x) {
        Ok(()) => MergeOutcome::Ok,
        Err(conflict) => {
            let err = RpcError::operation_failed(
                ErrorType::Rpc,
                format!("merge conflict on {}", conflict),
            );
            *acc = Some(err.to_reply_xml());
            MergeOutcome::Failed
        }
    }
}

fn merge_children(target: &mut XmlNode, source: &XmlNode) -> Result<(), String> {
    for child in source.children() {
        let existing = target.children_mut().iter_mut().find(|c| {
            c.name() == child.name()
                && c.namespace() == child.namespace()
                && c.is_leaf() == child.is_leaf()
        });
        match existing {
            Some(slot) if !child.is_leaf() => merge_children(slot, child)?,
            Some(slot) => {
                if slot.body() != child.body() {
                    return Err(child.name().to_string());
                }
            }
            None => target.push(child.clone()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use confmgr_types::parse_xml;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_canonical_envelope_order() {
        let err = RpcError::invalid_value(ErrorType::Application, "out of range")
            .with_app_tag("range")
            .with_path("/x");
        let names: Vec<_> = err
            .to_error_xml()
            .children()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "error-type",
                "error-tag",
                "error-severity",
                "error-app-tag",
                "error-path",
                "error-message"
            ]
        );
    }

    #[test]
    fn test_serialized_form_is_rendered_tree() {
        let err = RpcError::operation_failed(ErrorType::Application, "boom");
        assert_eq!(err.to_message_string(), err.to_reply_xml().render());
        assert_eq!(
            err.to_message_string(),
            "<rpc-reply><rpc-error><error-type>application</error-type>\
             <error-tag>operation-failed</error-tag>\
             <error-severity>error</error-severity>\
             <error-message>boom</error-message></rpc-error></rpc-reply>"
        );
    }

    #[test]
    fn test_lock_denied_fixed_shape() {
        let err = RpcError::lock_denied(7, "lock held");
        assert_eq!(err.error_type(), ErrorType::Protocol);
        assert_eq!(err.tag(), ErrorTag::LockDenied);
        let xml = err.to_error_xml();
        let info = xml.find("error-info").unwrap();
        assert_eq!(info.find_body("session-id"), Some("7"));
    }

    #[test]
    fn test_malformed_message_is_rpc() {
        let err = RpcError::malformed_message("truncated");
        assert_eq!(err.error_type(), ErrorType::Rpc);
    }

    #[test]
    fn test_data_exists_is_application() {
        let err = RpcError::data_exists("already there");
        assert_eq!(err.error_type(), ErrorType::Application);
    }

    #[test]
    fn test_data_missing_choice() {
        let err = RpcError::data_missing(Some("transport"), "choice unsatisfied");
        assert_eq!(err.app_tag(), Some("missing-choice"));
        let xml = err.to_error_xml();
        assert_eq!(
            xml.find("error-info").unwrap().find_body("missing-choice"),
            Some("transport")
        );
    }

    #[test]
    fn test_data_not_unique_lists_siblings() {
        let err = RpcError::data_not_unique(vec![
            "/servers/server[name='a']/port",
            "/servers/server[name='b']/port",
        ]);
        assert_eq!(err.tag(), ErrorTag::OperationFailed);
        assert_eq!(err.app_tag(), Some("data-not-unique"));
        let xml = err.to_error_xml();
        let info = xml.find("error-info").unwrap();
        assert_eq!(info.find_all("non-unique").count(), 2);
    }

    #[test]
    fn test_minmax_elements() {
        let err = RpcError::minmax_elements("/servers/server", true);
        assert_eq!(err.app_tag(), Some("too-many-elements"));
        assert_eq!(err.path(), Some("/servers/server"));
        let few = RpcError::minmax_elements("/servers/server", false);
        assert_eq!(few.app_tag(), Some("too-few-elements"));
    }

    #[test]
    fn test_message_escaped_in_render() {
        let err = RpcError::operation_failed(ErrorType::Application, "a <b> & 'c'");
        let rendered = err.to_message_string();
        assert!(rendered.contains("a &lt;b&gt; &amp; &apos;c&apos;"));
        // The tree keeps the raw text.
        assert_eq!(err.message(), Some("a <b> & 'c'"));
    }

    #[test]
    fn test_every_tag_renders_valid_envelope() {
        let tags = [
            ErrorTag::InUse,
            ErrorTag::InvalidValue,
            ErrorTag::TooBig,
            ErrorTag::MissingAttribute,
            ErrorTag::BadAttribute,
            ErrorTag::UnknownAttribute,
            ErrorTag::MissingElement,
            ErrorTag::BadElement,
            ErrorTag::UnknownElement,
            ErrorTag::UnknownNamespace,
            ErrorTag::AccessDenied,
            ErrorTag::LockDenied,
            ErrorTag::ResourceDenied,
            ErrorTag::RollbackFailed,
            ErrorTag::DataExists,
            ErrorTag::DataMissing,
            ErrorTag::OperationNotSupported,
            ErrorTag::OperationFailed,
            ErrorTag::MalformedMessage,
        ];
        for tag in tags {
            let err = RpcError::new(ErrorType::Application, tag).with_message("m");
            let reparsed = parse_xml(&err.to_message_string()).unwrap();
            let rpc_error = reparsed.find("rpc-error").unwrap();
            assert_eq!(rpc_error.find_body("error-tag"), Some(tag.as_str()));
            assert_eq!(rpc_error.find_body("error-severity"), Some("error"));
        }
    }

    #[test]
    fn test_ok_and_data_replies() {
        assert_eq!(ok_reply().render(), "<rpc-reply><ok/></rpc-reply>");
        let reply = data_reply(vec![XmlNode::new("x")
            .with_namespace("urn:ex")
            .with_body("7")]);
        assert_eq!(
            reply.render(),
            r#"<rpc-reply><data><x xmlns="urn:ex">7</x></data></rpc-reply>"#
        );
    }

    #[test]
    fn test_try_merge_accumulates() {
        let a = parse_xml("<data><x>1</x></data>").unwrap();
        let b = parse_xml("<data><y>2</y></data>").unwrap();
        let mut acc = None;
        assert_eq!(try_merge(&mut acc, &a), MergeOutcome::Ok);
        assert_eq!(try_merge(&mut acc, &b), MergeOutcome::Ok);
        let merged = acc.unwrap();
        assert_eq!(merged.find_body("x"), Some("1"));
        assert_eq!(merged.find_body("y"), Some("2"));
    }

    #[test]
    fn test_try_merge_conflict_installs_error() {
        let a = parse_xml("<data><x>1</x></data>").unwrap();
        let b = parse_xml("<data><x>2</x></data>").unwrap();
        let mut acc = None;
        try_merge(&mut acc, &a);
        assert_eq!(try_merge(&mut acc, &b), MergeOutcome::Failed);
        let reply = acc.unwrap();
        let err = reply.find("rpc-error").unwrap();
        assert_eq!(err.find_body("error-tag"), Some("operation-failed"));
    }

    #[test]
    fn test_try_merge_mismatched_roots_fatal() {
        let a = parse_xml("<data/>").unwrap();
        let b = parse_xml("<other/>").unwrap();
        let mut acc = None;
        try_merge(&mut acc, &a);
        assert_eq!(try_merge(&mut acc, &b), MergeOutcome::Fatal);
    }
}
