use std::sync::Arc;
use std::time::Duration;

use jarvis::Hub;
use jarvis::config::HubSettings;
use protocol_runtime::{Envelope, Kind, ProtocolError, address};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

const PROTOCOL: &str = env!("CARGO_BIN_EXE_template_protocol");

async fn hub() -> (TempDir, Arc<Hub>) {
    // short prefix keeps the socket paths under the Unix limit
    let dir = tempfile::Builder::new().prefix("jv").tempdir().unwrap();
    let mut settings = HubSettings::with_root(dir.path());
    settings.activation_timeout = Duration::from_secs(10);
    settings.grace_period = Duration::from_millis(500);
    settings.request_timeout = Duration::from_secs(5);
    settings.comms_poll = Duration::from_millis(20);
    let hub = Hub::start(settings).await.unwrap();
    (dir, hub)
}

fn request(command: &str, input: Value, worker_id: &str) -> Envelope {
    Envelope::request(command, input, address::HUB, address::worker(worker_id))
}

#[tokio::test(flavor = "multi_thread")]
async fn start_request_is_answered_with_the_same_message_id() {
    let (_dir, hub) = hub().await;
    let worker_id = hub.activate(PROTOCOL, None, None).await.unwrap();
    assert!(hub.registry().is_ready(&worker_id));

    let rsp = hub
        .request(request("start", json!({}), &worker_id).with_message_id("abc"), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(rsp.kind, Kind::Response);
    assert_eq!(rsp.message_id, "abc");
    assert_eq!(rsp.input, json!({ "status": "ok" }));
    assert!(!rsp.is_failure());

    hub.shutdown().await;
    assert!(hub.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_command_comes_back_as_failure() {
    let (_dir, hub) = hub().await;
    let worker_id = hub.activate(PROTOCOL, None, None).await.unwrap();

    let rsp = hub
        .request(request("nope", json!({}), &worker_id), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(rsp.is_failure());
    assert_eq!(rsp.failure_reason(), Some("unknown command `nope`"));

    hub.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_protocol_times_out_the_request() {
    let (_dir, hub) = hub().await;
    let worker_id = hub.activate(PROTOCOL, None, None).await.unwrap();

    let err = hub
        .request(request("sleep", json!({ "ms": 1500 }), &worker_id), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::CorrelationTimeout { .. }), "{err:?}");
    assert!(hub.correlator().is_empty());

    hub.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn protocol_dying_mid_request_fails_the_waiter() {
    let (_dir, hub) = hub().await;
    let worker_id = hub.activate(PROTOCOL, None, None).await.unwrap();

    let pending = {
        let hub = hub.clone();
        let req = request("hang", json!({}), &worker_id);
        tokio::spawn(async move { hub.request(req, Duration::from_secs(10)).await })
    };
    sleep(Duration::from_millis(100)).await;
    let exit = hub
        .request(request("exit", json!({ "code": 3 }), &worker_id), Duration::from_secs(5))
        .await;
    assert!(matches!(exit, Err(ProtocolError::ChannelClosed { .. })), "{exit:?}");

    let err = timeout(Duration::from_secs(5), pending).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, ProtocolError::ChannelClosed { .. }), "{err:?}");

    // the disconnect is noticed and the record goes away
    for _ in 0..100 {
        if !hub.registry().contains(&worker_id) {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(!hub.registry().contains(&worker_id));
    hub.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn dependents_are_torn_down_before_their_mother() {
    let (_dir, hub) = hub().await;
    let mother = hub.activate(PROTOCOL, None, None).await.unwrap();
    let mut children = Vec::new();
    for _ in 0..3 {
        children.push(hub.activate(PROTOCOL, Some(mother.as_str()), None).await.unwrap());
    }
    let grandchild = hub.activate(PROTOCOL, Some(children[0].as_str()), None).await.unwrap();

    for row in hub.snapshot() {
        assert_eq!(row.root_id, mother);
        if let Some(m) = &row.mother_id {
            assert!(hub.registry().contains(m), "{} has a missing mother", row.worker_id);
        }
    }

    let terminated = hub.deactivate(&mother).await;
    assert_eq!(terminated.len(), 5);
    assert_eq!(terminated.last().unwrap().worker_id, mother);

    let stopped = |id: &str| terminated.iter().find(|t| t.worker_id == id).unwrap().stopped_at;
    for child in &children {
        assert!(stopped(child.as_str()) <= stopped(mother.as_str()));
    }
    assert!(stopped(grandchild.as_str()) <= stopped(children[0].as_str()));
    assert!(hub.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn protocol_can_ask_the_hub_for_a_child() {
    let (_dir, hub) = hub().await;
    let mother = hub.activate(PROTOCOL, None, None).await.unwrap();

    let rsp = hub
        .request(request("ask_hub", json!({ "script": PROTOCOL }), &mother), Duration::from_secs(15))
        .await
        .unwrap();
    assert!(!rsp.is_failure(), "{rsp:?}");
    let child = rsp.input["worker_id"].as_str().unwrap().to_string();

    let row = hub.registry().summary(&child).unwrap();
    assert_eq!(row.mother_id.as_deref(), Some(mother.as_str()));
    assert_eq!(row.root_id, mother);
    assert!(row.ready);

    assert_eq!(hub.registry().dependents(&mother), vec![child.clone()]);
    let ids: Vec<_> = hub.deactivate(&mother).await.into_iter().map(|t| t.worker_id).collect();
    assert_eq!(ids, vec![child, mother]);
}

#[tokio::test(flavor = "multi_thread")]
async fn protocol_runs_children_of_its_own() {
    let (_dir, hub) = hub().await;
    let mother = hub.activate(PROTOCOL, None, None).await.unwrap();

    let rsp = hub
        .request(request("spawn", json!({ "script": PROTOCOL }), &mother), Duration::from_secs(15))
        .await
        .unwrap();
    let child = rsp.input["worker_id"].as_str().unwrap().to_string();
    // owned by the protocol, invisible to the hub
    assert!(!hub.registry().contains(&child));

    let rsp = hub
        .request(request("children", json!({}), &mother), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(rsp.input["workers"], json!([child]));

    let terminated = hub.deactivate(&mother).await;
    assert_eq!(terminated.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn client_activates_a_protocol_through_the_comms_files() {
    let (_dir, hub) = hub().await;
    let mut tail = hub.comms().tail_outbound(0);

    let req = Envelope::request(
        "activate",
        json!({ "script_reference": PROTOCOL, "input": { "greeting": "hi" } }),
        address::CLIENT,
        address::HUB,
    );
    hub.comms().send_inbound(&req).await.unwrap();

    let rsp = timeout(Duration::from_secs(15), async {
        loop {
            for item in tail.poll().await.unwrap() {
                let env = item.unwrap();
                if env.message_id == req.message_id {
                    return env;
                }
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(rsp.receiver, address::CLIENT);
    let worker_id = rsp.input["worker_id"].as_str().unwrap();
    assert!(hub.registry().contains(worker_id));

    hub.shutdown().await;
    assert!(hub.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_script_is_a_spawn_error() {
    let (_dir, hub) = hub().await;
    let err = hub.activate("does_not_exist", None, None).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Spawn { .. }), "{err:?}");
    assert!(hub.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn connected_but_silent_protocol_is_killed_on_activation_timeout() {
    let dir = tempfile::Builder::new().prefix("jv").tempdir().unwrap();
    let mut settings = HubSettings::with_root(dir.path());
    settings.activation_timeout = Duration::from_millis(1500);
    settings.grace_period = Duration::from_millis(200);
    // run as the interpreter of `silent`, the template never reports loaded
    settings.interpreter = Some(PROTOCOL.into());
    let pid_file = settings.protocols_dir.join("silent.pid");
    let hub = Hub::start(settings).await.unwrap();

    let err = hub.activate("silent", None, None).await.unwrap_err();
    assert!(matches!(err, ProtocolError::ActivationTimeout { .. }), "{err:?}");
    assert!(hub.registry().is_empty());

    // it got as far as connecting, and it is gone now
    let pid = std::fs::read_to_string(&pid_file).unwrap();
    if cfg!(target_os = "linux") {
        assert!(!std::path::Path::new(&format!("/proc/{}", pid.trim())).exists());
    }
    hub.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn protocol_that_cannot_be_started_is_not_left_running() {
    let (_dir, hub) = hub().await;
    let worker_id = hub.activate(PROTOCOL, None, None).await.unwrap();
    hub.registry().channel(&worker_id).unwrap().close().await;

    let err = hub.start_protocol(&worker_id, json!({})).await.unwrap_err();
    assert!(matches!(err, ProtocolError::ChannelClosed { .. }), "{err:?}");
    for _ in 0..100 {
        if !hub.registry().contains(&worker_id) {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(!hub.registry().contains(&worker_id));
    hub.shutdown().await;
}
