//! Composes Queue + Transport + Storage + Subscriptions into one driver
//! module instance, wiring the non-owning handles the core specification
//! calls for so the pieces never form an ownership cycle (spec.md §9).

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::DriverCoreError;
use crate::queue::{Queue, SendFn};
use crate::storage::Storage;
use crate::subscriptions::{SubscriptionCallback, SubscriptionId, Subscriptions};
use crate::task::{ResponseParser, Task, TaskInfo};
use crate::transport::{QueueHandles, ReceivedFn, Transport};

/// One driver module: a Queue dispatching against a Transport, and a
/// Storage+Subscriptions pair for this module's status hash. Owns the
/// Queue and Transport outright; the Transport only ever holds a `Weak`
/// handle back to the Queue (see [`crate::transport::QueueHandles`]).
pub struct DriverModule {
    pub queue: Arc<Queue>,
    pub transport: Arc<dyn Transport>,
    pub storage: Storage,
    pub subscriptions: Arc<Subscriptions>,
    module_id: String,
}

impl DriverModule {
    /// Build a driver module. `build_transport` receives the
    /// [`QueueHandles`] the Transport needs (a non-owning handle to the
    /// Queue, plus the driver's general inbound callback) and constructs
    /// the concrete substrate; this indirection exists because the
    /// Transport cannot be built before the Queue it reports into exists,
    /// while the Queue's dispatch callback in turn needs the Transport —
    /// the two are connected through a bridging channel instead of a
    /// direct reference in either direction.
    pub async fn new(
        module_id: impl Into<String>,
        config: Config,
        received: ReceivedFn,
        build_transport: impl FnOnce(QueueHandles) -> Arc<dyn Transport>,
    ) -> Result<Arc<Self>, DriverCoreError> {
        let module_id = module_id.into();

        let (dispatch_tx, mut dispatch_rx) =
            mpsc::unbounded_channel::<(Bytes, TaskInfo, Option<ResponseParser>)>();
        let send: SendFn = Arc::new(move |bytes, info, parser| {
            let _ = dispatch_tx.send((bytes, info, parser));
        });
        let (queue, events_rx) = Queue::new(send);

        let handles = QueueHandles {
            queue: Arc::downgrade(&queue),
            received,
        };
        let transport = build_transport(handles);

        let bridge_transport = transport.clone();
        tokio::spawn(async move {
            while let Some((bytes, info, parser)) = dispatch_rx.recv().await {
                bridge_transport.send_with_task(bytes, info, parser).await;
            }
        });

        let queue_for_run = queue.clone();
        tokio::spawn(async move { queue_for_run.run(events_rx).await });

        let storage = Storage::connect(config.clone(), module_id.clone()).await?;
        let (subscriptions, cmd_rx) = Subscriptions::new(config).await?;
        let subs_for_run = subscriptions.clone();
        tokio::spawn(async move { subs_for_run.run(cmd_rx).await });

        Ok(Arc::new(Self {
            queue,
            transport,
            storage,
            subscriptions,
            module_id,
        }))
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    /// Enqueue a task for dispatch against this module's Transport.
    pub async fn send(&self, task: Task) {
        self.queue.enqueue(task).await;
    }

    /// Persist and publish a status value (spec.md §4.E `set`).
    pub async fn set_status(&self, status: &str, json: &str) -> Result<(), DriverCoreError> {
        self.storage.set(status, json).await.map_err(Into::into)
    }

    pub async fn subscribe_direct(
        &self,
        module_id: &str,
        status: &str,
        callback: SubscriptionCallback,
    ) -> Result<SubscriptionId, DriverCoreError> {
        self.subscriptions
            .subscribe_direct(module_id, status, callback)
            .await
            .map_err(Into::into)
    }

    pub async fn subscribe_indirect(
        &self,
        system_id: &str,
        role: &str,
        index: u32,
        status: &str,
        callback: SubscriptionCallback,
    ) -> Result<SubscriptionId, DriverCoreError> {
        self.subscriptions
            .subscribe_indirect(system_id, role, index, status, callback)
            .await
            .map_err(Into::into)
    }

    /// Shut down the Queue, Transport, and subscribe loop: aborts the
    /// in-flight task and every pending task as `Abort("terminated")`,
    /// stops reconnect, and closes the subscriptions' pub/sub session.
    pub async fn terminate(&self) {
        self.queue.terminate().await;
        self.transport.terminate().await;
        self.subscriptions.terminate().await;
    }
}
