//! End-to-end scenarios driven through the RPC dispatch path.

use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;

use confmgr_test::{
    error_field, first_error, fixtures, is_ok_reply, RecordingPlugin, TestBackend,
};
use confmgr_types::parse_xml;

/// Edit-then-commit round-trip: both RPCs reply `<ok/>` and the committed
/// value is visible in running.
#[tokio::test]
async fn test_edit_then_commit_roundtrip() {
    let mut t = TestBackend::new().await;

    let reply = t.rpc(&fixtures::edit_x("7")).await;
    assert!(is_ok_reply(&reply), "edit failed: {reply}");

    let reply = t.rpc("<commit/>").await;
    assert!(is_ok_reply(&reply), "commit failed: {reply}");

    let reply = t
        .rpc("<get-config><source><running/></source></get-config>")
        .await;
    let tree = parse_xml(&reply).unwrap();
    let data = tree.find("data").unwrap();
    let x = data.find("x").unwrap();
    assert_eq!(x.body(), Some("7"));
    assert_eq!(x.namespace(), Some(fixtures::EXAMPLE_NS));
}

/// After a commit, running and candidate read back identical.
#[tokio::test]
async fn test_commit_makes_candidate_and_running_equal() {
    let mut t = TestBackend::new().await;
    t.rpc(&fixtures::edit_x("42")).await;
    t.rpc(&fixtures::edit_server("a", "80")).await;
    t.rpc("<commit/>").await;
    assert_eq!(t.get_x("running").await, t.get_x("candidate").await);
}

/// `discard-changes` resets candidate to running.
#[tokio::test]
async fn test_discard_changes_resets_candidate() {
    let mut t = TestBackend::new().await;
    t.rpc(&fixtures::edit_x("1")).await;
    t.rpc("<commit/>").await;

    t.rpc(&fixtures::edit_x("2")).await;
    assert_eq!(t.get_x("candidate").await.as_deref(), Some("2"));

    let reply = t.rpc("<discard-changes/>").await;
    assert!(is_ok_reply(&reply));
    assert_eq!(t.get_x("candidate").await.as_deref(), Some("1"));
}

/// Lock conflict: the second session gets `lock-denied` carrying the
/// holder's session-id.
#[tokio::test]
async fn test_lock_conflict() {
    let mut t = TestBackend::new().await;
    let holder = t.session();
    let reply = t.rpc("<lock><target><running/></target></lock>").await;
    assert!(is_ok_reply(&reply));

    let other = t.open_session("admin");
    let reply = t
        .rpc_as(other, "<lock><target><running/></target></lock>")
        .await;
    assert_eq!(error_field(&reply, "error-tag").as_deref(), Some("lock-denied"));
    let err = first_error(&reply).unwrap();
    let info = err.find("error-info").unwrap();
    assert_eq!(info.find_body("session-id"), Some(holder.to_string().as_str()));
}

/// Locks die with their session.
#[tokio::test]
async fn test_lock_released_on_session_teardown() {
    let mut t = TestBackend::new().await;
    let holder = t.session();
    t.rpc("<lock><target><running/></target></lock>").await;
    t.backend_mut().teardown_session(holder).await;

    let other = t.open_session("admin");
    let reply = t
        .rpc_as(other, "<lock><target><running/></target></lock>")
        .await;
    assert!(is_ok_reply(&reply), "lock should be free again: {reply}");
}

/// An edit on a store locked by someone else is refused.
#[tokio::test]
async fn test_edit_conflicts_with_foreign_lock() {
    let mut t = TestBackend::new().await;
    t.rpc("<lock><target><candidate/></target></lock>").await;
    let other = t.open_session("admin");
    let reply = t.rpc_as(other, &fixtures::edit_x("9")).await;
    assert_eq!(error_field(&reply, "error-tag").as_deref(), Some("in-use"));
}

/// Malformed XML yields `malformed-message` of type rpc.
#[tokio::test]
async fn test_malformed_message() {
    let mut t = TestBackend::new().await;
    let sid = t.session();
    let reply = t
        .backend_mut()
        .handle_frame(sid, "<rpc message-id=\"1\"><edit-config><target><cand")
        .await
        .unwrap();
    assert_eq!(
        error_field(&reply, "error-tag").as_deref(),
        Some("malformed-message")
    );
    assert_eq!(error_field(&reply, "error-type").as_deref(), Some("rpc"));
}

/// Unique violation: commit is refused with `data-not-unique` and running
/// stays unchanged.
#[tokio::test]
async fn test_unique_violation_rejects_commit() {
    let mut t = TestBackend::new().await;
    t.rpc(&fixtures::edit_x("1")).await;
    t.rpc("<commit/>").await;

    t.rpc(&fixtures::edit_server("a", "80")).await;
    t.rpc(&fixtures::edit_server("b", "80")).await;
    let reply = t.rpc("<commit/>").await;
    assert_eq!(
        error_field(&reply, "error-tag").as_deref(),
        Some("operation-failed")
    );
    assert_eq!(
        error_field(&reply, "error-app-tag").as_deref(),
        Some("data-not-unique")
    );
    let err = first_error(&reply).unwrap();
    let info = err.find("error-info").unwrap();
    assert!(info.find("non-unique").is_some());

    // Running is untouched by the failed commit.
    let reply = t
        .rpc("<get-config><source><running/></source></get-config>")
        .await;
    let tree = parse_xml(&reply).unwrap();
    assert!(tree.find("data").unwrap().find("servers").is_none());
}

/// Validation errors surface through `validate` without changing anything.
#[tokio::test]
async fn test_validate_reports_type_error() {
    let mut t = TestBackend::new().await;
    t.rpc(&fixtures::edit_x("not-a-number")).await;
    let reply = t
        .rpc("<validate><source><candidate/></source></validate>")
        .await;
    assert_eq!(
        error_field(&reply, "error-tag").as_deref(),
        Some("invalid-value")
    );
}

/// NACM write-default deny: the edit is refused with "default deny" and no
/// datastore changes.
#[tokio::test]
async fn test_nacm_write_default_deny() {
    let mut t = TestBackend::with_nacm_internal().await;

    // Bootstrap the ruleset through the normal commit path.
    let nacm_edit = "<edit-config><target><candidate/></target><config>\
         <nacm xmlns=\"urn:ietf:params:xml:ns:yang:ietf-netconf-acm\">\
         <enable-nacm>true</enable-nacm>\
         <write-default>deny</write-default>\
         </nacm></config></edit-config>";
    assert!(is_ok_reply(&t.rpc(nacm_edit).await));
    assert!(is_ok_reply(&t.rpc("<commit/>").await));

    let before = t.get_x("candidate").await;
    let reply = t.rpc(&fixtures::edit_x("2")).await;
    assert_eq!(
        error_field(&reply, "error-tag").as_deref(),
        Some("access-denied")
    );
    assert_eq!(
        error_field(&reply, "error-message").as_deref(),
        Some("default deny")
    );
    assert_eq!(t.get_x("candidate").await, before, "denied edit must not mutate");
}

/// Unknown operations fall through to `operation-not-supported`.
#[tokio::test]
async fn test_unknown_operation() {
    let mut t = TestBackend::new().await;
    let reply = t.rpc("<frobnicate/>").await;
    assert_eq!(
        error_field(&reply, "error-tag").as_deref(),
        Some("operation-not-supported")
    );
}

/// Session ids are unique across a process run.
#[tokio::test]
async fn test_session_ids_never_reused() {
    let mut t = TestBackend::new().await;
    let first = t.open_session("admin");
    t.backend_mut().teardown_session(first).await;
    let second = t.open_session("admin");
    assert!(second > first);
}

/// kill-session drops the victim and releases its locks.
#[tokio::test]
async fn test_kill_session_releases_locks() {
    let mut t = TestBackend::new().await;
    let victim = t.open_session("admin");
    assert!(is_ok_reply(
        &t.rpc_as(victim, "<lock><target><candidate/></target></lock>")
            .await
    ));

    let reply = t
        .rpc(&format!("<kill-session><session-id>{victim}</session-id></kill-session>"))
        .await;
    assert!(is_ok_reply(&reply));
    assert!(t.backend_mut().sessions().get(victim).is_none());

    // The lock is free again.
    assert!(is_ok_reply(
        &t.rpc("<lock><target><candidate/></target></lock>").await
    ));
}

/// A session cannot kill itself.
#[tokio::test]
async fn test_kill_own_session_rejected() {
    let mut t = TestBackend::new().await;
    let sid = t.session();
    let reply = t
        .rpc(&format!("<kill-session><session-id>{sid}</session-id></kill-session>"))
        .await;
    assert_eq!(
        error_field(&reply, "error-tag").as_deref(),
        Some("invalid-value")
    );
}

/// Plugin callbacks run in order; a failing commit unwinds applied plugins
/// in reverse order and leaves running unchanged.
#[tokio::test]
async fn test_plugin_abort_order_and_rollback() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let plugins: Vec<Box<dyn confmgrd::BackendPlugin>> = vec![
        Box::new(RecordingPlugin::new("one", Arc::clone(&log))),
        Box::new(RecordingPlugin::new("two", Arc::clone(&log)).failing()),
    ];
    let mut t = TestBackend::with_plugins(plugins).await;

    t.rpc(&fixtures::edit_x("5")).await;
    let reply = t.rpc("<commit/>").await;
    assert_eq!(
        error_field(&reply, "error-tag").as_deref(),
        Some("operation-failed")
    );
    assert_eq!(t.get_x("running").await, None, "running must stay unchanged");

    let calls = log.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![
            "one:pre-commit",
            "two:pre-commit",
            "one:commit",
            "two:commit",
            "one:abort",
        ],
        "abort unwinds only plugins whose commit succeeded, in reverse"
    );
}

/// Plugin state data is merged into `get` replies.
#[tokio::test]
async fn test_get_merges_plugin_state_data() {
    struct StatePlugin;

    #[async_trait::async_trait]
    impl confmgrd::BackendPlugin for StatePlugin {
        fn name(&self) -> &str {
            "state"
        }

        async fn state_data(
            &mut self,
        ) -> confmgr_common::BackendResult<Option<confmgr_types::XmlNode>> {
            Ok(Some(
                confmgr_types::XmlNode::new("uptime")
                    .with_namespace(fixtures::EXAMPLE_NS)
                    .with_body("42"),
            ))
        }
    }

    let mut t = TestBackend::with_plugins(vec![Box::new(StatePlugin)]).await;
    t.rpc(&fixtures::edit_x("7")).await;
    t.rpc("<commit/>").await;

    let reply = t.rpc("<get/>").await;
    let tree = parse_xml(&reply).unwrap();
    let data = tree.find("data").unwrap();
    assert_eq!(data.find_body("x"), Some("7"));
    assert_eq!(data.find_body("uptime"), Some("42"));
}

/// The commit notification stream reports the changed paths.
#[tokio::test]
async fn test_commit_notification_published() {
    let mut t = TestBackend::new().await;
    let mut events = t.backend_mut().subscribe_commits();
    t.rpc(&fixtures::edit_x("3")).await;
    t.rpc("<commit/>").await;
    let event = events.try_recv().expect("one commit notification");
    assert_eq!(event.datastore, "running");
    assert_eq!(event.changed_paths, vec!["/x".to_string()]);
}

/// copy-config and delete-config manage whole stores.
#[tokio::test]
async fn test_copy_and_delete_config() {
    let mut t = TestBackend::new().await;
    t.rpc(&fixtures::edit_x("11")).await;
    let reply = t
        .rpc("<copy-config><source><candidate/></source><target><backup/></target></copy-config>")
        .await;
    assert!(is_ok_reply(&reply));
    assert_eq!(t.get_x("backup").await.as_deref(), Some("11"));

    let reply = t
        .rpc("<delete-config><target><backup/></target></delete-config>")
        .await;
    assert!(is_ok_reply(&reply));

    let reply = t
        .rpc("<delete-config><target><running/></target></delete-config>")
        .await;
    assert_eq!(
        error_field(&reply, "error-tag").as_deref(),
        Some("invalid-value")
    );
}

/// get with an xpath filter narrows the result.
#[tokio::test]
async fn test_get_with_xpath_filter() {
    let mut t = TestBackend::new().await;
    t.rpc(&fixtures::edit_x("7")).await;
    t.rpc(&fixtures::edit_server("a", "80")).await;
    t.rpc("<commit/>").await;

    let reply = t
        .rpc(r#"<get-config><source><running/></source><filter type="xpath" select="/servers"/></get-config>"#)
        .await;
    let tree = parse_xml(&reply).unwrap();
    let data = tree.find("data").unwrap();
    assert!(data.find("servers").is_some());
    assert!(data.find("x").is_none());
}

/// Every reply carries the request's message-id.
#[tokio::test]
async fn test_message_id_echoed() {
    let mut t = TestBackend::new().await;
    let sid = t.session();
    let reply = t
        .backend_mut()
        .handle_frame(sid, r#"<rpc message-id="abc-123"><discard-changes/></rpc>"#)
        .await
        .unwrap();
    let tree = parse_xml(&reply).unwrap();
    assert_eq!(tree.attr("message-id"), Some("abc-123"));
}
