//! Smoke-test binary: wires one [`DriverModule`] against a loopback TCP
//! transport and pushes a single delimited task through it end to end.
//!
//! Expects a newline-delimited echo peer listening on `127.0.0.1:7878`
//! (run `ncat -lk 7878 -c 'xargs -I{} echo {}'` or similar before
//! invoking this binary). Not part of the crate's public surface; a
//! manual wiring exercise only.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use driver_core::config::Config;
use driver_core::driver::DriverModule;
use driver_core::logging::{init_logging, LoggingConfig};
use driver_core::task::{ParserOutcome, Priority, Task};
use driver_core::tokenizer::{Framing, Tokenizer};
use driver_core::transport::{QueueHandles, StreamSocketConfig, StreamSocketTransport};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = init_logging(LoggingConfig::default());

    let received: driver_core::transport::ReceivedFn = Arc::new(|bytes, task| {
        info!(task = ?task, len = bytes.len(), "unsolicited bytes");
    });

    let module = DriverModule::new("demo", Config::default(), received, |handles: QueueHandles| {
        let config = StreamSocketConfig::new("127.0.0.1", 7878);
        let tokenizer = Tokenizer::new(Framing::Delimiter(Bytes::from_static(b"\n")));
        StreamSocketTransport::new(config, handles, Some(tokenizer))
    })
    .await?;

    module.transport.connect(Duration::from_secs(5)).await?;
    info!("connected to loopback peer");

    let (task, completion) = Task::with_payload(
        "ping",
        Priority::Normal,
        2,
        Duration::from_secs(3),
        None,
        false,
        Bytes::from_static(b"ping\n"),
        Some(Arc::new(|data: &[u8], _info| {
            ParserOutcome::Success(Bytes::copy_from_slice(data))
        })),
    );
    module.send(task).await;

    match completion.await {
        Ok(outcome) => info!(?outcome, "task completed"),
        Err(_) => info!("task completion dropped"),
    }

    let _sub_id = module
        .subscribe_direct(
            module.module_id(),
            "power",
            Arc::new(|payload: &str| info!(payload, "power status update")),
        )
        .await?;
    module.set_status("power", r#"{"on":true}"#).await?;

    tokio::time::sleep(Duration::from_millis(200)).await;

    module.terminate().await;
    Ok(())
}
