//! Integration tests for the RPC multiplexer over a hostile transport.
//!
//! The relay between the two sides re-chunks every byte stream into small,
//! irregular pieces so frames never line up with transport chunks.

use std::time::Duration;

use futures_util::StreamExt;
use keet_worklet::rpc::{Any, Method, StreamMethod};
use keet_worklet::{Endpoint, Rpc, RpcError, StreamSink};
use tokio::sync::mpsc;

const SQUARE: Method<u64, u64> = Method::new("test.square", 0x20 << 8);
const ECHO_ANY: Method<Any, Any> = Method::new("test.echo_any", 0x21 << 8);
const TICKS: StreamMethod<u32, u32> = StreamMethod::new("test.ticks", 0x22 << 8);

/// Forward bytes from `rx` to `tx`, re-split into 1..=7 byte chunks.
fn spawn_rechunker(mut rx: mpsc::UnboundedReceiver<Vec<u8>>, tx: mpsc::UnboundedSender<Vec<u8>>) {
    tokio::spawn(async move {
        let mut state: u32 = 0x9e37_79b9;
        while let Some(bytes) = rx.recv().await {
            let mut rest = bytes.as_slice();
            while !rest.is_empty() {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                let n = (state % 7 + 1) as usize;
                let (chunk, tail) = rest.split_at(n.min(rest.len()));
                if tx.send(chunk.to_vec()).is_err() {
                    return;
                }
                rest = tail;
            }
        }
    });
}

/// Two multiplexers joined through re-chunking relays.
fn rechunked_pair() -> (Rpc, Rpc) {
    let (a_out, a_relay) = mpsc::unbounded_channel();
    let (relay_b, b_in) = mpsc::unbounded_channel();
    let (b_out, b_relay) = mpsc::unbounded_channel();
    let (relay_a, a_in) = mpsc::unbounded_channel();
    spawn_rechunker(a_relay, relay_b);
    spawn_rechunker(b_relay, relay_a);

    (
        Rpc::new(Endpoint::from_parts(a_out, a_in)),
        Rpc::new(Endpoint::from_parts(b_out, b_in)),
    )
}

async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

#[tokio::test]
async fn test_concurrent_requests_resolve_to_own_payload() {
    let (client, server) = rechunked_pair();
    server.register_request(SQUARE, |n: u64| async move {
        // Reverse completion order relative to issue order.
        tokio::time::sleep(Duration::from_millis(100 - n)).await;
        anyhow::Ok(n * n)
    });

    let calls = (0..100u64).map(|n| {
        let client = client.clone();
        async move { (n, client.request(SQUARE, &n).await) }
    });
    for (n, result) in within(futures_util::future::join_all(calls)).await {
        assert_eq!(result.unwrap(), n * n, "call {n} got someone else's response");
    }
}

#[tokio::test]
async fn test_stream_order_survives_rechunking() {
    let (client, server) = rechunked_pair();
    server.register_stream(TICKS, |count: u32, sink: StreamSink<u32>| async move {
        for i in 0..count {
            if !sink.write(&i) {
                break;
            }
        }
        sink.end();
        anyhow::Ok(())
    });

    let sub = client.subscribe(TICKS, &2000).unwrap();
    let events: Vec<u32> = within(sub.map(|e| e.unwrap()).collect()).await;
    assert_eq!(events, (0..2000).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_streams_and_requests_interleave() {
    let (client, server) = rechunked_pair();
    server.register_request(SQUARE, |n: u64| async move { anyhow::Ok(n * n) });
    server.register_stream(TICKS, |count: u32, sink: StreamSink<u32>| async move {
        for i in 0..count {
            sink.write(&i);
            tokio::task::yield_now().await;
        }
        sink.end();
        anyhow::Ok(())
    });

    let mut first = client.subscribe(TICKS, &300).unwrap();
    let mut second = client.subscribe(TICKS, &300).unwrap();
    let squares = futures_util::future::join_all((0..50u64).map(|n| {
        let client = client.clone();
        async move { client.request(SQUARE, &n).await.unwrap() }
    }));

    let (squares, a, b) = within(async {
        let squares = squares.await;
        let mut a = Vec::new();
        while let Some(e) = first.recv().await {
            a.push(e.unwrap());
        }
        let mut b = Vec::new();
        while let Some(e) = second.recv().await {
            b.push(e.unwrap());
        }
        (squares, a, b)
    })
    .await;

    assert_eq!(squares, (0..50u64).map(|n| n * n).collect::<Vec<_>>());
    assert_eq!(a, (0..300).collect::<Vec<_>>());
    assert_eq!(a, b);
}

#[tokio::test]
async fn test_any_escape_hatch_round_trips_json() {
    let (client, server) = rechunked_pair();
    server.register_request(ECHO_ANY, |value: Any| async move { anyhow::Ok(value) });

    let payload = serde_json::json!({"room": "lobby", "members": [1, 2, 3], "meta": null});
    let echoed = within(client.request(ECHO_ANY, &payload)).await.unwrap();
    assert_eq!(echoed, payload);
}

#[tokio::test]
async fn test_codec_mismatch_is_reported_by_remote() {
    let (client, server) = rechunked_pair();
    server.register_request(SQUARE, |n: u64| async move { anyhow::Ok(n * n) });

    // Same slot, incompatible request shape.
    const WRONG: Method<String, u64> = Method::new("test.square", 0x20 << 8);
    let err = within(client.request(WRONG, &"seven".to_string())).await.unwrap_err();
    assert!(matches!(err, RpcError::RemoteHandler(_)), "got {err:?}");
}

#[tokio::test]
async fn test_pending_calls_fail_when_peer_goes_away() {
    let (client, server) = rechunked_pair();
    server.register_request(SQUARE, |_n: u64| std::future::pending::<anyhow::Result<u64>>());

    let calls: Vec<_> = (0..5u64)
        .map(|n| {
            let client = client.clone();
            tokio::spawn(async move { client.request(SQUARE, &n).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.close();

    for call in calls {
        assert_eq!(within(call).await.unwrap().unwrap_err(), RpcError::TransportClosed);
    }
    assert!(client.subscribe(TICKS, &1).is_err());
}
