//! Single-process backplane

use async_trait::async_trait;
use groupcast_shared::{ConnectionId, Event, EventBody, Frame};
use std::sync::Arc;

use super::{Backplane, BackplaneKind};
use crate::realtime::{FrameSink, HostedConnections, MembershipStore, RealtimeResult};

/// In-process fanout: resolves members from the store and writes straight
/// into their transport sinks. Valid only when every connection and every
/// publisher lives in this process.
pub struct LocalBackplane {
    membership: Arc<dyn MembershipStore>,
    hosted: HostedConnections,
}

impl LocalBackplane {
    pub fn new(membership: Arc<dyn MembershipStore>) -> Self {
        Self {
            membership,
            hosted: HostedConnections::new(),
        }
    }
}

#[async_trait]
impl Backplane for LocalBackplane {
    fn kind(&self) -> BackplaneKind {
        BackplaneKind::Local
    }

    fn attach(&self, id: &ConnectionId, sink: FrameSink) {
        self.hosted.attach(id, sink);
    }

    fn detach(&self, id: &ConnectionId) {
        self.hosted.detach(id);
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
                "No members in group - nothing to deliver"
            );
            return Ok(0);
        }

        let frame = Frame::new(group, body.to_json());
        let delivered = self.hosted.deliver_many(&members, &frame);

        tracing::debug!(
            group = %group,
            event_type = %body.event_type(),
            recipients = delivered,
            missed = members.len() - delivered,
            "Broadcast event to group"
        );

        Ok(members.len())
    }

    async fn publish_to_connection(
        &self,
        id: &ConnectionId,
        body: &EventBody,
    ) -> RealtimeResult<bool> {
        let frame = Event::to_connection(id.clone(), body.clone()).frame();
        let delivered = self.hosted.deliver(id, &frame);

        tracing::debug!(
            connection_id = %id,
            event_type = %body.event_type(),
            delivered,
            "Sent event to connection"
        );

        Ok(delivered)
    }

    async fn shutdown(&self) {
        self.hosted.clear();
    }
}
