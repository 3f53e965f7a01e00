//! Redis pub/sub backplane
//!
//! Every connection has its own channel, `{prefix}:fanout:conn:{id}`. The
//! process hosting a connection subscribes to that channel on attach and
//! unsubscribes on detach, so a process only receives frames for the
//! connections it hosts. A group publish resolves the group's members from
//! the shared membership store and publishes the frame once per member.

use async_trait::async_trait;
use futures::StreamExt;
use groupcast_shared::{ConnectionId, Event, EventBody, Frame};
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, PubSub};
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use super::{Backplane, BackplaneKind};
use crate::realtime::{FrameSink, HostedConnections, MembershipStore, RealtimeResult, RedisMembership};

/// Subscription changes handed to the relay task
#[derive(Debug, Clone, PartialEq, Eq)]
enum RelayCommand {
    Subscribe(String),
    Unsubscribe(String),
}

/// Why the relay stopped reading from its current subscription
enum RelayExit {
    /// The backplane was dropped
    Stopped,
    /// The pub/sub connection failed
    Lost,
}

/// Channel naming shared by publishers and the relay
#[derive(Debug, Clone)]
struct Channels {
    stem: String,
}

impl Channels {
    fn new(prefix: &str) -> Self {
        Self {
            stem: format!("{}:fanout:conn:", prefix),
        }
    }

    fn connection(&self, id: &ConnectionId) -> String {
        format!("{}{}", self.stem, id)
    }

    fn connection_of(&self, channel: &str) -> Option<ConnectionId> {
        channel
            .strip_prefix(&self.stem)
            .filter(|id| !id.is_empty())
            .map(ConnectionId::from)
    }
}

pub struct RedisBackplane {
    conn: ConnectionManager,
    membership: RedisMembership,
    channels: Channels,
    hosted: Arc<HostedConnections>,
    commands: mpsc::UnboundedSender<RelayCommand>,
    relay: Mutex<Option<JoinHandle<()>>>,
}

impl RedisBackplane {
    /// Build the backplane and start this process's relay task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        client: redis::Client,
        conn: ConnectionManager,
        membership: RedisMembership,
        prefix: impl Into<String>,
    ) -> Self {
        let prefix = prefix.into();
        let channels = Channels::new(&prefix);
        let hosted = Arc::new(HostedConnections::new());
        let (commands, receiver) = mpsc::unbounded_channel();
        let relay = tokio::spawn(run_relay(
            client,
            channels.clone(),
            Arc::clone(&hosted),
            receiver,
        ));

        tracing::info!(prefix = %prefix, "Redis backplane started");

        Self {
            conn,
            membership,
            channels,
            hosted,
            commands,
            relay: Mutex::new(Some(relay)),
        }
    }

    fn command(&self, command: RelayCommand) {
        if self.commands.send(command).is_err() {
            tracing::warn!("Fanout relay is not running; subscription change dropped");
        }
    }
}

#[async_trait]
impl Backplane for RedisBackplane {
    fn kind(&self) -> BackplaneKind {
        BackplaneKind::Redis
    }

    fn attach(&self, id: &ConnectionId, sink: FrameSink) {
        self.hosted.attach(id, sink);
        self.command(RelayCommand::Subscribe(self.channels.connection(id)));
    }

    fn detach(&self, id: &ConnectionId) {
        if self.hosted.detach(id) {
            self.command(RelayCommand::Unsubscribe(self.channels.connection(id)));
        }
    }

    fn hosted_count(&self) -> usize {
        self.hosted.len()
    }

    async fn publish_to_group(&self, group: &str, body: &EventBody) -> RealtimeResult<usize> {
        let members = self.membership.members(group).await?;
        if members.is_empty() {
            tracing::debug!(
                group = %group,
                event_type = %body.event_type(),
                "No members in group - nothing to relay"
            );
            return Ok(0);
        }

        let payload = serde_json::to_string(&Frame::new(group, body.to_json()))?;
        let mut pipe = redis::pipe();
        for id in &members {
            pipe.publish(self.channels.connection(id), &payload);
        }

        let mut conn = self.conn.clone();
        let receivers: Vec<usize> = pipe.query_async(&mut conn).await?;
        let reached = receivers.iter().filter(|n| **n > 0).count();

        tracing::debug!(
            group = %group,
            event_type = %body.event_type(),
            recipients = members.len(),
            reached,
            "Relayed event to group"
        );

        Ok(members.len())
    }

    /// True when some process hosting `id` is subscribed to its channel
    async fn publish_to_connection(
        &self,
        id: &ConnectionId,
        body: &EventBody,
    ) -> RealtimeResult<bool> {
        let frame = Event::to_connection(id.clone(), body.clone()).frame();
        let payload = serde_json::to_string(&frame)?;

        let mut conn = self.conn.clone();
        let receivers: usize = conn.publish(self.channels.connection(id), payload).await?;

        tracing::debug!(
            connection_id = %id,
            event_type = %body.event_type(),
            delivered = receivers > 0,
            "Relayed event to connection"
        );

        Ok(receivers > 0)
    }

    async fn ready(&self) -> RealtimeResult<()> {
        self.membership.ping().await
    }

    async fn shutdown(&self) {
        if let Some(relay) = self.relay.lock().take() {
            relay.abort();
        }
        self.hosted.clear();
        tracing::info!("Redis backplane stopped");
    }
}

/// Keep this process subscribed to the channels of its hosted connections.
///
/// Connecting is retried with capped exponential backoff. After every
/// (re)connect the channels of all currently hosted connections are
/// subscribed again before queued changes are applied.
async fn run_relay(
    client: redis::Client,
    channels: Channels,
    hosted: Arc<HostedConnections>,
    mut commands: mpsc::UnboundedReceiver<RelayCommand>,
) {
    loop {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(50)
            .max_delay(Duration::from_secs(5))
            .map(jitter);

        let connected = Retry::spawn(strategy, || {
            let client = client.clone();
            let channels = channels.clone();
            let hosted = Arc::clone(&hosted);
            async move {
                connect(&client, &channels, &hosted).await.map_err(|e| {
                    tracing::warn!(error = %e, "Fanout subscription failed, retrying");
                    e
                })
            }
        })
        .await;

        let mut pubsub = match connected {
            Ok(pubsub) => pubsub,
            Err(e) => {
                tracing::error!(error = %e, "Giving up on fanout subscription");
                return;
            }
        };

        tracing::info!(hosted = hosted.len(), "Fanout relay subscribed");

        match relay(&mut pubsub, &channels, &hosted, &mut commands).await {
            RelayExit::Stopped => return,
            RelayExit::Lost => {
                tracing::warn!("Fanout subscription lost, resubscribing");
            }
        }
    }
}

async fn connect(
    client: &redis::Client,
    channels: &Channels,
    hosted: &HostedConnections,
) -> redis::RedisResult<PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    for id in hosted.ids() {
        pubsub.subscribe(channels.connection(&id)).await?;
    }
    Ok(pubsub)
}

async fn relay(
    pubsub: &mut PubSub,
    channels: &Channels,
    hosted: &HostedConnections,
    commands: &mut mpsc::UnboundedReceiver<RelayCommand>,
) -> RelayExit {
    loop {
        tokio::select! {
            command = commands.recv() => {
                let result = match command {
                    Some(RelayCommand::Subscribe(channel)) => pubsub.subscribe(channel).await,
                    Some(RelayCommand::Unsubscribe(channel)) => pubsub.unsubscribe(channel).await,
                    None => return RelayExit::Stopped,
                };
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Failed to change fanout subscription");
                    return RelayExit::Lost;
                }
            }
            message = next_message(pubsub) => {
                let Some(message) = message else {
                    return RelayExit::Lost;
                };
                deliver(channels, hosted, &message);
            }
        }
    }
}

async fn next_message(pubsub: &mut PubSub) -> Option<redis::Msg> {
    let mut messages = std::pin::pin!(pubsub.on_message());
    messages.next().await
}

fn deliver(channels: &Channels, hosted: &HostedConnections, message: &redis::Msg) {
    let channel = message.get_channel_name();
    let Some(id) = channels.connection_of(channel) else {
        tracing::warn!(channel = %channel, "Message on unexpected fanout channel");
        return;
    };

    let frame = message
        .get_payload::<String>()
        .map_err(|e| e.to_string())
        .and_then(|payload| serde_json::from_str::<Frame>(&payload).map_err(|e| e.to_string()));

    match frame {
        Ok(frame) => {
            hosted.deliver(&id, &frame);
        }
        Err(e) => {
            tracing::warn!(error = %e, channel = %channel, "Dropping malformed fanout message");
        }
    }
}
