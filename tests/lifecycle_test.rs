//! Lifecycle controller tests: start, stop, restart, crash isolation and
//! reconciliation against the store.

mod common;

use std::time::Duration;

use common::{wait_until, FakeApp, Fixture};
use futures_util::{SinkExt, StreamExt};
use scriptbox::runtime::{LifecycleEvent, LogSource};
use scriptbox::{Capability, ScriptDraft, ScriptPermissions, ScriptStatus};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

const KEEP_ALIVE: &str = r#"host.on("noop", function() end)"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_script_logs_then_finishes() {
    let mut fx = Fixture::new();
    let script = fx.add(r#"log.info("hello")"#, false, ScriptPermissions::default());

    fx.manager.start(&script.id).await.expect("start");
    assert_eq!(fx.manager.runtime_state(&script.id).status, ScriptStatus::Running);

    let event = fx
        .manager
        .wait_for_exit(Duration::from_secs(5))
        .await
        .expect("exit event");
    assert!(matches!(event, LifecycleEvent::Finished { .. }));

    let state = fx.manager.runtime_state(&script.id);
    assert_eq!(state.status, ScriptStatus::Stopped);
    assert!(state.stopped_at.is_some());
    assert!(!fx.manager.is_running(&script.id));
    assert_eq!(fx.script_lines(&script.id), vec!["hello"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_compile_error_marks_script_errored() {
    let mut fx = Fixture::new();
    let script = fx.add("local = 1", false, ScriptPermissions::default());

    fx.manager.start(&script.id).await.expect("start");
    let event = fx
        .manager
        .wait_for_exit(Duration::from_secs(5))
        .await
        .expect("exit event");
    let LifecycleEvent::Failed { error, .. } = event else {
        panic!("expected failure, got {event:?}");
    };
    assert_eq!(error.kind(), "CompileError");

    let state = fx.manager.runtime_state(&script.id);
    assert_eq!(state.status, ScriptStatus::Error);
    assert!(state
        .last_error
        .as_deref()
        .is_some_and(|e| e.starts_with("Compile error: line 1")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_runtime_error_only_stops_that_script() {
    let mut fx = Fixture::new();
    let healthy = fx.add(KEEP_ALIVE, false, ScriptPermissions::default());
    let broken = fx.add(r#"error("kaboom")"#, false, ScriptPermissions::default());

    fx.manager.start(&healthy.id).await.expect("start healthy");
    fx.manager.start(&broken.id).await.expect("start broken");

    let event = fx
        .manager
        .wait_for_exit(Duration::from_secs(5))
        .await
        .expect("exit event");
    assert_eq!(event.script_id(), broken.id);

    let state = fx.manager.runtime_state(&broken.id);
    assert_eq!(state.status, ScriptStatus::Error);
    assert!(state.last_error.as_deref().is_some_and(|e| e.contains("kaboom")));

    assert!(fx.manager.is_running(&healthy.id));
    assert_eq!(fx.manager.runtime_state(&healthy.id).status, ScriptStatus::Running);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_twice_leaves_one_host() {
    let mut fx = Fixture::new();
    let script = fx.add(KEEP_ALIVE, false, ScriptPermissions::default());

    fx.manager.start(&script.id).await.expect("first start");
    fx.manager.start(&script.id).await.expect("second start");

    assert_eq!(fx.manager.running_ids(), vec![script.id.clone()]);
    let host = fx.manager.host(&script.id).expect("host");
    assert_eq!(host.instance_id(), 2);
    assert_eq!(host.pending_requests(), 0);
    assert_eq!(fx.manager.runtime_state(&script.id).instance_id, 2);

    // The first instance never reports an exit that affects the second.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(fx.manager.poll().is_empty());
    assert!(fx.manager.is_running(&script.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_rejects_pending_requests() {
    let mut fx = Fixture::with_app(FakeApp {
        hang_confirm: true,
        ..FakeApp::default()
    });
    let script = fx.add(
        r#"
        local ok = host.modal.confirm("proceed?")
        log.info("unreachable")
    "#,
        false,
        ScriptPermissions::default(),
    );

    fx.manager.start(&script.id).await.expect("start");
    let waiting = wait_until(Duration::from_secs(5), || {
        fx.manager
            .host(&script.id)
            .is_some_and(|h| h.pending_requests() == 1)
    })
    .await;
    assert!(waiting, "confirm request never became pending");

    let report = fx.manager.stop(&script.id).expect("was running");
    assert_eq!(report.rejected_requests, 1);
    assert_eq!(report.closed_connections, 0);

    // Stopping again is a no-op.
    assert!(fx.manager.stop(&script.id).is_none());

    let state = fx.manager.runtime_state(&script.id);
    assert_eq!(state.status, ScriptStatus::Stopped);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(fx.manager.poll().is_empty());
    assert!(fx.script_lines(&script.id).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_interrupts_busy_loop() {
    let mut fx = Fixture::new();
    let script = fx.add("while true do end", false, ScriptPermissions::default());

    fx.manager.start(&script.id).await.expect("start");
    tokio::time::sleep(Duration::from_millis(50)).await;
    fx.manager.stop(&script.id).expect("was running");
    assert_eq!(fx.manager.runtime_state(&script.id).status, ScriptStatus::Stopped);

    // A stopped script restarts as a fresh instance.
    fx.manager.restart(&script.id).await.expect("restart");
    assert!(fx.manager.is_running(&script.id));
    assert_eq!(fx.manager.runtime_state(&script.id).instance_id, 2);
    fx.manager.stop(&script.id).expect("was running");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_trust_change_force_stops_running_script() {
    let mut fx = Fixture::new();
    let script = fx.add(KEEP_ALIVE, true, ScriptPermissions::default());
    fx.manager.start(&script.id).await.expect("start");

    let mut draft = ScriptDraft::from(&script);
    draft.trusted = Some(false);
    fx.manager.save_script(draft).expect("save");

    assert!(!fx.manager.is_running(&script.id));
    assert_eq!(fx.manager.runtime_state(&script.id).status, ScriptStatus::Stopped);
    let logged = fx
        .logs(&script.id)
        .iter()
        .any(|e| e.source == LogSource::Host && e.message.contains("permissions changed"));
    assert!(logged, "{:?}", fx.logs(&script.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unrelated_edit_keeps_script_running() {
    let mut fx = Fixture::new();
    let script = fx.add(KEEP_ALIVE, false, ScriptPermissions::default());
    fx.manager.start(&script.id).await.expect("start");

    let mut draft = ScriptDraft::from(&script);
    draft.description = Some("now with a description".to_string());
    fx.manager.save_script(draft).expect("save");

    assert!(fx.manager.is_running(&script.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disable_and_delete_reconcile() {
    let mut fx = Fixture::new();
    let disabled = fx.add(KEEP_ALIVE, false, ScriptPermissions::default());
    let deleted = fx.add(KEEP_ALIVE, false, ScriptPermissions::default());
    fx.manager.start(&disabled.id).await.expect("start");
    fx.manager.start(&deleted.id).await.expect("start");

    let mut draft = ScriptDraft::from(&disabled);
    draft.enabled = Some(false);
    fx.manager.save_script(draft).expect("disable");
    assert!(!fx.manager.is_running(&disabled.id));
    assert!(fx.manager.start(&disabled.id).await.is_err());

    assert!(fx.manager.delete_script(&deleted.id).expect("delete"));
    assert!(!fx.manager.is_running(&deleted.id));
    assert!(fx.logs(&deleted.id).is_empty());
    assert_eq!(fx.manager.runtime_state(&deleted.id).status, ScriptStatus::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_auto_start_and_shutdown() {
    let mut fx = Fixture::new();
    let auto = fx
        .manager
        .save_script(ScriptDraft {
            source: Some(KEEP_ALIVE.to_string()),
            auto_start: Some(true),
            ..ScriptDraft::default()
        })
        .expect("save");
    fx.add(KEEP_ALIVE, false, ScriptPermissions::default());

    let started = fx.manager.auto_start().await.expect("auto start");
    assert_eq!(started, vec![auto.id.clone()]);
    assert_eq!(fx.manager.running_ids(), vec![auto.id.clone()]);

    fx.manager.shutdown();
    assert!(fx.manager.running_ids().is_empty());
    assert_eq!(fx.manager.runtime_state(&auto.id).status, ScriptStatus::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_window_snapshot_delivered_on_start_and_change() {
    let mut fx = Fixture::with_app(FakeApp::with_accounts(vec![json!({"id": "a"}), json!({"id": "b"})]));
    let script = fx.add(
        r#"
        host.on("window.updated", function(snapshot)
            log.info("accounts " .. #snapshot.accounts)
        end)
    "#,
        false,
        ScriptPermissions::default(),
    );
    let blind = fx.add(
        KEEP_ALIVE,
        false,
        ScriptPermissions::default().with(Capability::WindowRead, false),
    );

    fx.manager.start(&script.id).await.expect("start");
    fx.manager.start(&blind.id).await.expect("start blind");
    fx.wait_for_line(&script.id, "accounts 2").await;

    fx.app
        .snapshot
        .lock()
        .expect("snapshot mutex poisoned")
        .accounts
        .push(json!({"id": "c"}));
    let delivered = fx.manager.notify_window_changed().await.expect("notify");
    assert_eq!(delivered, 1);
    fx.wait_for_line(&script.id, "accounts 3").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ui_event_roundtrip() {
    let mut fx = Fixture::new();
    let script = fx.add(
        r#"
        host.ui.on_event(function(id, value)
            log.info("clicked " .. id)
        end)
        host.ui.set({
            { id = "go", type = "button", label = "Go" },
        })
    "#,
        false,
        ScriptPermissions::default(),
    );

    fx.manager.start(&script.id).await.expect("start");
    let declared = wait_until(Duration::from_secs(5), || {
        fx.manager.runtime_state(&script.id).ui.len() == 1
    })
    .await;
    assert!(declared, "ui.set never landed");

    assert!(fx.manager.ui_event(&script.id, "missing", None).is_err());
    fx.manager.ui_event(&script.id, "go", None).expect("ui event");
    fx.wait_for_line(&script.id, "clicked go").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_clear_logs() {
    let mut fx = Fixture::new();
    let script = fx.add(r#"log.warn("noise")"#, false, ScriptPermissions::default());
    fx.manager.start(&script.id).await.expect("start");
    fx.manager
        .wait_for_exit(Duration::from_secs(5))
        .await
        .expect("exit");
    assert!(!fx.logs(&script.id).is_empty());

    fx.manager.clear_logs(&script.id);
    assert!(fx.logs(&script.id).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_log_burst_keeps_newest_lines() {
    let mut fx = Fixture::new();
    let script = fx.add(
        "for i = 1, 2000 do log.info(tostring(i)) end",
        false,
        ScriptPermissions::default(),
    );

    fx.manager.start(&script.id).await.expect("start");
    let event = fx
        .manager
        .wait_for_exit(Duration::from_secs(10))
        .await
        .expect("exit event");
    assert!(matches!(event, LifecycleEvent::Finished { .. }), "{event:?}");

    let numbers: Vec<u32> = fx
        .script_lines(&script.id)
        .iter()
        .map(|l| l.parse().expect("numeric line"))
        .collect();
    assert!(numbers.len() >= 400, "kept only {} lines", numbers.len());
    assert_eq!(numbers.last(), Some(&2000));
    // Oldest lines are evicted, never lines in the middle.
    assert!(numbers.windows(2).all(|w| w[1] == w[0] + 1), "gap in {numbers:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_websocket_events_and_force_stop_closes_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let (frames_tx, mut frames) = tokio::sync::mpsc::unbounded_channel();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(stream)
            .await
            .expect("handshake");
        ws.send(Message::Text("welcome".to_string()))
            .await
            .expect("send welcome");
        while let Some(Ok(frame)) = ws.next().await {
            let closing = matches!(frame, Message::Close(_));
            let _ = frames_tx.send(frame);
            if closing {
                break;
            }
        }
    });

    let mut fx = Fixture::new();
    let source = format!(
        r#"
        host.on("ws.open", function(e) log.info("open " .. e.id) end)
        host.on("ws.message", function(e)
            log.info("message " .. e.data)
            host.ws.send(e.id, "ack")
        end)
        local res, err = host.ws.connect("ws://127.0.0.1:{port}/", {{ id = "feed", allowPrivateNetwork = true }})
        if not res then log.error(err) end
    "#
    );
    let script = fx.add(
        &source,
        true,
        ScriptPermissions::default().with(Capability::WebSocket, true),
    );

    fx.manager.start(&script.id).await.expect("start");
    fx.wait_for_line(&script.id, "open feed").await;
    fx.wait_for_line(&script.id, "message welcome").await;

    let ack = tokio::time::timeout(Duration::from_secs(5), frames.recv())
        .await
        .expect("ack in time")
        .expect("server running");
    assert_eq!(ack, Message::Text("ack".to_string()));
    assert_eq!(
        fx.manager.host(&script.id).expect("host").open_connections(),
        1
    );

    let mut draft = ScriptDraft::from(&script);
    draft.trusted = Some(false);
    fx.manager.save_script(draft).expect("save");
    assert!(!fx.manager.is_running(&script.id));
    let reported = fx.logs(&script.id).iter().any(|e| {
        e.source == LogSource::Host
            && e.message.contains("permissions changed")
            && e.message.contains("1 connection(s) closed")
    });
    assert!(reported, "{:?}", fx.logs(&script.id));

    let close = tokio::time::timeout(Duration::from_secs(5), frames.recv())
        .await
        .expect("close in time")
        .expect("server running");
    let Message::Close(Some(frame)) = close else {
        panic!("expected close frame, got {close:?}");
    };
    assert_eq!(frame.code, CloseCode::Normal);
    assert_eq!(frame.reason.to_string(), "script stopped");
    server.await.expect("server task");
}
