mod common;

use backplane::sse::{
    ControlToken, PropStore, ServerPushEvent, StreamCallback, StreamEntry, StreamReducer,
};
use backplane::BackendKind;
use common::http_client::{open_post_json, post_json};
use common::test_app::{progress_id, start, start_with_streams, ticker_id};
use serde_json::{json, Value};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

const STREAM: &str = "/_backplane-update-component-sse";

/// Join the data of every event, as the browser does before reducing.
fn concatenated(body: &str) -> String {
    ServerPushEvent::parse_stream(body)
        .into_iter()
        .map(|ev| ev.data)
        .collect()
}

#[test]
fn test_stream_reduces_to_final_props() {
    for kind in BackendKind::ALL {
        let handle = start(kind, |_| {});
        let resp = post_json(
            handle.addr(),
            STREAM,
            &json!({"content": {"sse_callback_id": progress_id().as_str(), "steps": 3}}),
        );
        assert_eq!(resp.status, 200, "{kind}");
        assert!(resp
            .header("content-type")
            .unwrap_or("")
            .starts_with("text/event-stream"));

        let message = concatenated(&resp.text());
        let mut reducer = StreamReducer::new(json!("stream"));
        let mut store = PropStore::new();
        assert_eq!(reducer.reduce(&message, &mut store), 0, "{kind}");
        assert_eq!(store.get(&json!("bar"), "value"), Some(&json!(3)));
        assert_eq!(store.get(&json!("stream"), "done"), Some(&json!(true)));
        handle.stop();
    }
}

#[test]
fn test_stream_frames_arrive_in_order() {
    let handle = start(BackendKind::AsyncA, |_| {});
    let resp = post_json(
        handle.addr(),
        STREAM,
        &json!({"content": {"sse_callback_id": progress_id().as_str(), "steps": 2}}),
    );
    let tokens: Vec<ControlToken> = concatenated(&resp.text())
        .split(backplane::sse::STREAM_SEPARATOR)
        .filter(|raw| !raw.is_empty())
        .map(|raw| StreamEntry::decode(raw).unwrap().token)
        .collect();
    assert_eq!(
        tokens,
        vec![
            ControlToken::Init,
            ControlToken::Running,
            ControlToken::Running,
            ControlToken::Done
        ]
    );
    handle.stop();
}

#[test]
fn test_async_stream_per_backend() {
    for kind in BackendKind::ALL {
        let handle = start(kind, |_| {});
        let resp = post_json(
            handle.addr(),
            STREAM,
            &json!({"content": {"sse_callback_id": ticker_id().as_str(), "steps": 4}}),
        );
        if kind.supports_async() {
            assert_eq!(resp.status, 200, "{kind}");
            let mut reducer = StreamReducer::new(json!("stream"));
            let mut store = PropStore::new();
            assert_eq!(reducer.reduce(&concatenated(&resp.text()), &mut store), 0);
            assert_eq!(store.get(&json!("bar"), "value"), Some(&json!(4)), "{kind}");
        } else {
            assert_eq!(resp.status, 500, "{kind}");
            assert!(resp.text().contains("app.ticker"), "{}", resp.text());
        }
        handle.stop();
    }
}

/// A stream that emits one update, then holds until the test releases it.
fn gated_stream(release: mpsc::Receiver<()>) -> StreamCallback {
    let release = Mutex::new(release);
    StreamCallback::new(
        "app.gated",
        &["Input(gate.n_clicks)"],
        &["steps"],
        Arc::new(move |_, emitter| {
            emitter.emit("bar", json!({"value": 1}))?;
            if let Ok(rx) = release.lock() {
                rx.recv_timeout(Duration::from_secs(10)).ok();
            }
            emitter.emit("bar", json!({"value": 2}))?;
            Ok(())
        }),
    )
}

#[test]
fn test_frames_flush_while_producer_runs() {
    for kind in [BackendKind::AsyncA, BackendKind::AsyncB] {
        let (release_tx, release_rx) = mpsc::channel();
        let gated = gated_stream(release_rx);
        let id = gated.id().clone();
        let handle = start_with_streams(kind, |_| {}, vec![gated]);

        let mut open = open_post_json(
            handle.addr(),
            STREAM,
            &json!({"content": {"sse_callback_id": id.as_str()}}),
        );
        assert!(
            open.read_until("[RUNNING]", Duration::from_secs(5)),
            "{kind}: first update not delivered: {}",
            open.text()
        );
        let early = open.text();
        assert!(early.contains("[INIT]"), "{kind}");
        assert!(!early.contains("\"value\":2"), "{kind}");
        assert!(!early.contains("[DONE]"), "{kind}");

        release_tx.send(()).unwrap();
        assert!(
            open.read_until("[DONE]", Duration::from_secs(5)),
            "{kind}: stream did not finish: {}",
            open.text()
        );
        assert!(open.text().contains("\"value\":2"), "{kind}");
        handle.stop();
    }
}

#[test]
fn test_unknown_stream_is_404() {
    for kind in BackendKind::ALL {
        let handle = start(kind, |_| {});
        let resp = post_json(
            handle.addr(),
            STREAM,
            &json!({"content": {"sse_callback_id": "not-registered"}}),
        );
        assert_eq!(resp.status, 404, "{kind}");
        handle.stop();
    }
}

#[test]
fn test_server_timing_headers() {
    for kind in BackendKind::ALL {
        let handle = start(kind, |c| c.dev_tools.serve_timing = true);
        let resp = post_json(
            handle.addr(),
            "/_backplane-update-component",
            &common::test_app::envelope("timed.children", "go", json!(1)),
        );
        assert_eq!(resp.status, 200, "{kind}");
        let timings = resp.header_all("server-timing");
        assert!(
            timings.iter().any(|t| t.starts_with("__server;dur=")),
            "{kind}: {timings:?}"
        );
        assert!(timings.contains(&"db;desc=\"query\";dur=4"), "{kind}: {timings:?}");
        handle.stop();
    }

    // Without the dev tool nothing is recorded on the response.
    let handle = start(BackendKind::AsyncB, |_| {});
    let resp = post_json(
        handle.addr(),
        "/_backplane-update-component",
        &common::test_app::envelope("greeting.children", "name", json!("Ada")),
    );
    assert!(resp.header("server-timing").is_none());
    handle.stop();
}

#[test]
fn test_background_callback_polling() {
    for kind in BackendKind::ALL {
        let handle = start(kind, |_| {});
        let body = common::test_app::envelope("report.children", "go", json!("q3"));
        let submitted = post_json(handle.addr(), "/_backplane-update-component", &body).json();
        let key = submitted["cacheKey"].as_str().unwrap().to_string();
        assert_eq!(submitted["job"], json!(key));

        let path = format!("/_backplane-update-component?cacheKey={key}");
        let mut last = Value::Null;
        for _ in 0..100 {
            last = post_json(handle.addr(), &path, &body).json();
            if last.get("running").is_none() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(
            last,
            json!({"response": {"report": {"children": "report for \"q3\""}}}),
            "{kind}"
        );

        // Results are handed out once.
        let gone = post_json(handle.addr(), &path, &body);
        assert_eq!(gone.status, 500, "{kind}");
        handle.stop();
    }
}
