//! Per-module status pub/sub registry (Module E, subscriptions half):
//! direct, indirect (role-indexed), and free-form channel subscriptions,
//! with remap-on-topology-change for indirect bindings (spec.md §3, §4.E).
//!
//! Both indices — `channel_name -> subscriptions` and `system_id ->
//! indirect subscriptions` — live behind one `tokio::sync::Mutex` so the
//! remap path and the subscribe-loop's post-reconnect resync can never
//! interleave (spec.md §9 open question, resolved: serialize under one
//! lock spanning both indices).
//!
//! Redis pub/sub requires a connection dedicated to subscribing — once a
//! connection issues `SUBSCRIBE` it cannot run ordinary commands. The
//! subscribe loop owns that connection exclusively; registration methods
//! only ever request subscribe/unsubscribe through a command channel the
//! loop drains alongside incoming messages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::{mpsc, Mutex};
use tracing::{trace, warn};

use crate::config::Config;
use crate::error::{StorageError, SubscriptionError};

const LOOKUP_CHANGE_CHANNEL: &str = "lookup-change";

/// A subscriber's callback: invoked with the raw message string published
/// on the subscription's channel.
pub type SubscriptionCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
enum Binding {
    Indirect { system_id: String, role: String, index: u32, status: String },
    Other,
}

struct Entry {
    id: SubscriptionId,
    binding: Binding,
    callback: SubscriptionCallback,
}

pub enum SubCommand {
    Subscribe(String),
    Unsubscribe(String),
    /// Issue `UNSUBSCRIBE` with no arguments and stop the loop for good
    /// (spec.md §4.E) — handled by `subscribe_session` returning `Ok(())`,
    /// which `run`'s outer loop treats as a deliberate exit rather than a
    /// reconnect-worthy error.
    Terminate,
}

#[derive(Default)]
struct Indices {
    by_channel: HashMap<String, Vec<Entry>>,
    by_system: HashMap<String, Vec<SubscriptionId>>,
}

/// Two-index registry of active subscriptions plus the store connections
/// needed to resolve indirect bindings and drive the subscribe loop.
pub struct Subscriptions {
    config: Config,
    conn: ConnectionManager,
    next_id: AtomicU64,
    inner: Mutex<Indices>,
    cmd_tx: mpsc::UnboundedSender<SubCommand>,
}

impl Subscriptions {
    /// Connect the registry's lookup connection and return it alongside
    /// the receiver end of its subscribe-command channel; the two-step
    /// split mirrors `Queue::new`/`Queue::run` — the caller must spawn
    /// [`Subscriptions::run`] with the returned receiver.
    pub async fn new(config: Config) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SubCommand>), SubscriptionError> {
        let client = redis::Client::open(config.redis_url.as_str()).map_err(StorageError::from)?;
        let conn = ConnectionManager::new(client).await.map_err(StorageError::from)?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            config,
            conn,
            next_id: AtomicU64::new(1),
            inner: Mutex::new(Indices::default()),
            cmd_tx,
        });
        Ok((registry, cmd_rx))
    }

    fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Subscribe directly to `module_id`'s `status`, delivering the
    /// current value (if any) immediately after registration.
    pub async fn subscribe_direct(
        &self,
        module_id: &str,
        status: &str,
        callback: SubscriptionCallback,
    ) -> Result<SubscriptionId, SubscriptionError> {
        let channel = self.config.status_channel(module_id, status);
        let id = self.register(channel.clone(), Binding::Other, callback).await;
        self.deliver_current(&channel).await?;
        Ok(id)
    }

    /// Subscribe to a system role's current module binding; remaps when
    /// `lookup-change` fires for `system_id`.
    pub async fn subscribe_indirect(
        &self,
        system_id: &str,
        role: &str,
        index: u32,
        status: &str,
        callback: SubscriptionCallback,
    ) -> Result<SubscriptionId, SubscriptionError> {
        let module_id = self.resolve_role(system_id, role, index).await?;
        let channel = self.config.status_channel(&module_id, status);
        let binding = Binding::Indirect {
            system_id: system_id.to_string(),
            role: role.to_string(),
            index,
            status: status.to_string(),
        };
        let id = self.register(channel.clone(), binding, callback).await;
        {
            let mut inner = self.inner.lock().await;
            inner.by_system.entry(system_id.to_string()).or_default().push(id);
        }
        self.deliver_current(&channel).await?;
        Ok(id)
    }

    /// Free-form subscription to a literal channel name.
    pub async fn channel(&self, name: &str, callback: SubscriptionCallback) -> Result<SubscriptionId, SubscriptionError> {
        Ok(self.register(name.to_string(), Binding::Other, callback).await)
    }

    /// Remove a subscription from every index it appears in; requests
    /// `UNSUBSCRIBE` from the subscribe loop if its channel has no
    /// subscribers left.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), SubscriptionError> {
        let mut inner = self.inner.lock().await;
        let mut emptied_channel = None;
        for (channel, entries) in inner.by_channel.iter_mut() {
            if let Some(pos) = entries.iter().position(|e| e.id == id) {
                entries.remove(pos);
                if entries.is_empty() {
                    emptied_channel = Some(channel.clone());
                }
                break;
            }
        }
        if let Some(channel) = &emptied_channel {
            inner.by_channel.remove(channel);
        }
        for subs in inner.by_system.values_mut() {
            subs.retain(|existing| *existing != id);
        }
        inner.by_system.retain(|_, subs| !subs.is_empty());
        drop(inner);

        if let Some(channel) = emptied_channel {
            let _ = self.cmd_tx.send(SubCommand::Unsubscribe(channel));
        }
        Ok(())
    }

    async fn register(&self, channel: String, binding: Binding, callback: SubscriptionCallback) -> SubscriptionId {
        let id = self.allocate_id();
        let mut inner = self.inner.lock().await;
        let entries = inner.by_channel.entry(channel.clone()).or_default();
        let first_subscriber = entries.is_empty();
        entries.push(Entry { id, binding, callback });
        drop(inner);

        if first_subscriber {
            let _ = self.cmd_tx.send(SubCommand::Subscribe(channel));
        }
        id
    }

    async fn deliver_current(&self, channel: &str) -> Result<(), SubscriptionError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(channel).await.map_err(StorageError::from)?;
        let payload = value.unwrap_or_else(|| "null".to_string());
        self.dispatch(channel, &payload).await;
        Ok(())
    }

    async fn resolve_role(&self, system_id: &str, role: &str, index: u32) -> Result<String, SubscriptionError> {
        let key = self.config.role_key(system_id, role, index);
        let mut conn = self.conn.clone();
        let module_id: Option<String> = conn.get(&key).await.map_err(StorageError::from)?;
        module_id.ok_or_else(|| SubscriptionError::UnresolvedRole {
            system_id: system_id.to_string(),
            role: role.to_string(),
            index,
        })
    }

    /// Invoke every subscriber's callback registered on `channel`; a
    /// channel with no subscribers yields a warning (benign race with a
    /// just-completed `unsubscribe`).
    async fn dispatch(&self, channel: &str, message: &str) {
        let callbacks: Vec<SubscriptionCallback> = {
            let inner = self.inner.lock().await;
            match inner.by_channel.get(channel) {
                Some(entries) => entries.iter().map(|e| e.callback.clone()).collect(),
                None => Vec::new(),
            }
        };
        if callbacks.is_empty() {
            warn!(channel, "message delivered to channel with no subscribers");
            return;
        }
        for callback in callbacks {
            callback(message);
        }
    }

    /// Re-resolve every IndirectSubscription registered under `system_id`;
    /// if the resolved channel changed, drop the old binding and
    /// subscribe to the new one, delivering its current value. Entered
    /// from the subscribe loop on a `lookup-change` message.
    async fn remap_system(&self, system_id: &str) {
        let candidates: Vec<SubscriptionId> = {
            let inner = self.inner.lock().await;
            inner.by_system.get(system_id).cloned().unwrap_or_default()
        };

        for id in candidates {
            let found = {
                let inner = self.inner.lock().await;
                inner.by_channel.iter().find_map(|(channel, entries)| {
                    entries
                        .iter()
                        .find(|e| e.id == id)
                        .map(|e| (channel.clone(), e.binding.clone(), e.callback.clone()))
                })
            };
            let Some((old_channel, binding, callback)) = found else { continue };
            let Binding::Indirect { system_id, role, index, status } = binding else { continue };

            let new_module_id = match self.resolve_role(&system_id, &role, index).await {
                Ok(module_id) => module_id,
                Err(err) => {
                    warn!(system_id, role, index, error = %err, "lookup-change remap failed to resolve role");
                    continue;
                }
            };
            let new_channel = self.config.status_channel(&new_module_id, &status);
            if new_channel == old_channel {
                continue;
            }

            if let Err(err) = self.unsubscribe(id).await {
                warn!(error = %err, "failed to unsubscribe during remap");
                continue;
            }

            let new_binding = Binding::Indirect {
                system_id: system_id.clone(),
                role,
                index,
                status,
            };
            let new_id = self.register(new_channel.clone(), new_binding, callback).await;
            {
                let mut inner = self.inner.lock().await;
                inner.by_system.entry(system_id).or_default().push(new_id);
            }
            if let Err(err) = self.deliver_current(&new_channel).await {
                warn!(error = %err, "failed to deliver current value after remap");
            }
        }
    }

    /// Close the pub/sub session and stop the subscribe loop. Pending
    /// subscriptions remain in the registry but receive nothing once the
    /// loop exits (spec.md §5 cancellation table).
    pub async fn terminate(&self) {
        let _ = self.cmd_tx.send(SubCommand::Terminate);
    }

    async fn active_channels(&self) -> Vec<String> {
        self.inner.lock().await.by_channel.keys().cloned().collect()
    }

    async fn active_systems(&self) -> Vec<String> {
        self.inner.lock().await.by_system.keys().cloned().collect()
    }

    /// Run the subscribe loop: hold a dedicated pub/sub connection to the
    /// store, issue the initial `lookup-change` subscription, and
    /// dispatch every incoming message and queued subscribe/unsubscribe
    /// request until the command channel closes (the owning
    /// `DriverModule` dropped its sender on shutdown).
    pub async fn run(self: Arc<Self>, mut cmd_rx: mpsc::UnboundedReceiver<SubCommand>) {
        loop {
            match self.subscribe_session(&mut cmd_rx).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(error = %err, "subscribe session ended, reconnecting");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn subscribe_session(&self, cmd_rx: &mut mpsc::UnboundedReceiver<SubCommand>) -> Result<(), SubscriptionError> {
        let client = redis::Client::open(self.config.redis_url.as_str()).map_err(StorageError::from)?;
        let conn = client.get_async_connection().await.map_err(StorageError::from)?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(LOOKUP_CHANGE_CHANNEL).await.map_err(StorageError::from)?;
        for channel in self.active_channels().await {
            pubsub.subscribe(&channel).await.map_err(StorageError::from)?;
        }
        for system_id in self.active_systems().await {
            self.remap_system(&system_id).await;
        }

        loop {
            let mut stream = pubsub.on_message();
            tokio::select! {
                message = stream.next() => {
                    drop(stream);
                    let Some(message) = message else { return Ok(()) };
                    let channel = message.get_channel_name().to_string();
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(err) => {
                            warn!(channel, error = %err, "failed to decode pubsub payload");
                            continue;
                        }
                    };
                    trace!(channel, "received pubsub message");
                    if channel == LOOKUP_CHANGE_CHANNEL {
                        self.remap_system(&payload).await;
                    } else {
                        self.dispatch(&channel, &payload).await;
                    }
                }
                command = cmd_rx.recv() => {
                    drop(stream);
                    match command {
                        Some(SubCommand::Subscribe(channel)) => {
                            if let Err(err) = pubsub.subscribe(&channel).await {
                                warn!(channel, error = %err, "failed to subscribe");
                            }
                        }
                        Some(SubCommand::Unsubscribe(channel)) => {
                            if let Err(err) = pubsub.unsubscribe(&channel).await {
                                warn!(channel, error = %err, "failed to unsubscribe");
                            }
                        }
                        Some(SubCommand::Terminate) => {
                            if let Err(err) = pubsub.unsubscribe(LOOKUP_CHANGE_CHANNEL).await {
                                warn!(error = %err, "failed to unsubscribe lookup-change on terminate");
                            }
                            for channel in self.active_channels().await {
                                if let Err(err) = pubsub.unsubscribe(&channel).await {
                                    warn!(channel, error = %err, "failed to unsubscribe on terminate");
                                }
                            }
                            return Ok(());
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}
