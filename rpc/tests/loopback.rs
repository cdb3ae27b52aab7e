//! The transport pieces wired together against a real child process.
//!
//! `cat` echoes whatever it is sent, so writing a response frame to it is
//! the same as a server answering.

#![cfg(unix)]

use std::time::Duration;

use serde_json::{Value, json};

use qalam_rpc::{
    Correlator, LengthPrefixedDecoder, ProcessEvent, ProcessSpec, ProcessSupervisor, RpcError,
    encode_frame,
};

async fn pump_until_settled(
    events: &mut qalam_rpc::ProcessEvents,
    decoder: &mut LengthPrefixedDecoder,
    correlator: &Correlator<Value>,
    expected: usize,
) {
    let mut settled = 0;
    while settled < expected {
        match events.recv().await {
            Some(ProcessEvent::Stdout(chunk)) => {
                for frame in decoder.decode(&chunk) {
                    let frame = frame.unwrap();
                    let id = frame["id"].as_u64().unwrap();
                    if correlator.settle(id, Ok(frame["result"].clone())) {
                        settled += 1;
                    }
                }
            }
            Some(ProcessEvent::Stderr(_)) => {}
            other => panic!("process ended early: {other:?}"),
        }
    }
}

#[tokio::test]
async fn responses_through_cat_reach_their_callers_out_of_order() {
    let (process, mut events) = ProcessSupervisor::spawn(&ProcessSpec::new("cat")).unwrap();
    let correlator = Correlator::<Value>::new();
    let mut decoder = LengthPrefixedDecoder::new();

    let first = correlator.register("textDocument/hover", Duration::from_secs(5));
    let second = correlator.register("textDocument/definition", Duration::from_secs(5));
    let (first_id, second_id) = (first.id(), second.id());

    // Answer in reverse order, with a multi-byte payload split mid-frame.
    let mut wire =
        encode_frame(&json!({"jsonrpc": "2.0", "id": second_id, "result": "تعريف"})).unwrap();
    wire.extend(
        encode_frame(&json!({"jsonrpc": "2.0", "id": first_id, "result": {"contents": "نص"}}))
            .unwrap(),
    );
    let split = wire.len() / 2;
    assert!(process.write(wire[..split].to_vec()).await);
    assert!(process.write(wire[split..].to_vec()).await);

    pump_until_settled(&mut events, &mut decoder, &correlator, 2).await;

    assert_eq!(second.wait().await.unwrap(), json!("تعريف"));
    assert_eq!(first.wait().await.unwrap()["contents"], "نص");
    assert!(correlator.is_empty());

    process.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn exit_rejects_whatever_is_still_pending() {
    let (process, mut events) = ProcessSupervisor::spawn(&ProcessSpec::new("cat")).unwrap();
    let correlator = Correlator::<Value>::new();
    let pending = correlator.register("shutdown", Duration::from_secs(30));

    process.terminate();
    loop {
        match events.recv().await {
            Some(ProcessEvent::Exited(code)) => {
                let reason = qalam_rpc::StopReason::Exited(code);
                assert_eq!(correlator.reject_all(&RpcError::stopped(reason.to_string())), 1);
                break;
            }
            Some(_) => {}
            None => panic!("event stream closed without an exit"),
        }
    }

    assert!(matches!(
        pending.wait().await,
        Err(RpcError::SessionStopped { .. })
    ));
}
