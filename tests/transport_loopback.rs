//! Integration coverage for the stream-socket Transport substrate (Module D)
//! against a real loopback TCP listener: connect, send a framed request,
//! and observe the response routed through the Task's response parser
//! rather than the driver's general `received` callback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use driver_core::queue::Queue;
use driver_core::task::{ParserOutcome, TaskInfo};
use driver_core::tokenizer::{Framing, Tokenizer};
use driver_core::transport::{QueueHandles, ReceivedFn, StreamSocketConfig, StreamSocketTransport, Transport};
use driver_core::{Priority, Task, TaskOutcome};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// A trivial newline-delimited echo server: whatever line it reads, it
/// writes back immediately, uppercased, so the test can tell request and
/// response apart.
async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            let reply: Vec<u8> = buf[..n].iter().map(|b| b.to_ascii_uppercase()).collect();
                            if socket.write_all(&reply).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

#[tokio::test]
async fn send_with_task_routes_reply_through_response_parser() {
    let port = spawn_echo_server().await;

    let unsolicited_count = Arc::new(AtomicUsize::new(0));
    let unsolicited_count2 = unsolicited_count.clone();
    let received: ReceivedFn = Arc::new(move |_bytes, _task: Option<TaskInfo>| {
        unsolicited_count2.fetch_add(1, Ordering::SeqCst);
    });

    let (send, mut dispatch_rx) =
        tokio::sync::mpsc::unbounded_channel::<(Bytes, TaskInfo, Option<driver_core::task::ResponseParser>)>();
    let send_fn: driver_core::queue::SendFn = Arc::new(move |bytes, info, parser| {
        let _ = send.send((bytes, info, parser));
    });
    let (queue, events_rx) = Queue::new(send_fn);
    queue.set_online(false).await;
    let runner = queue.clone();
    tokio::spawn(async move { runner.run(events_rx).await });

    let handles = QueueHandles {
        queue: Arc::downgrade(&queue),
        received,
    };
    let tokenizer = Tokenizer::new(Framing::Delimiter(Bytes::from_static(b"\n")));
    let transport = StreamSocketTransport::new(StreamSocketConfig::new("127.0.0.1", port), handles, Some(tokenizer));

    transport.connect(Duration::from_secs(2)).await.unwrap();

    let transport_for_bridge = transport.clone();
    tokio::spawn(async move {
        while let Some((bytes, info, parser)) = dispatch_rx.recv().await {
            transport_for_bridge.send_with_task(bytes, info, parser).await;
        }
    });
    queue.set_online(true).await;

    let (task, completion) = Task::with_payload(
        "echo",
        Priority::Normal,
        1,
        Duration::from_secs(3),
        None,
        false,
        Bytes::from_static(b"hello\n"),
        Some(Arc::new(|data: &[u8], _info| ParserOutcome::Success(Bytes::copy_from_slice(data)))),
    );
    queue.enqueue(task).await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), completion)
        .await
        .expect("task should complete")
        .unwrap();

    match outcome {
        TaskOutcome::Success(value) => assert_eq!(&value[..], b"HELLO\n"),
        other => panic!("expected Success(HELLO), got {other:?}"),
    }
    assert_eq!(unsolicited_count.load(Ordering::SeqCst), 0);

    transport.terminate().await;
}
