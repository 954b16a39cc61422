//! Outbound sending through the protocol engine
//!
//! `EngineSender` encrypts one payload per recipient session and hands the
//! ciphertext to a [`MessageSink`]. Group sends fan out to every member
//! concurrently; each member succeeds or fails on its own.

use super::store::{Credentials, DeviceCredential};
use super::traits::*;
use crate::proto::{Content, DataMessage, GroupContextV2};
use async_trait::async_trait;
use futures::future::join_all;
use prost::Message;
use std::sync::Arc;
use tracing::{debug, warn};

fn text_content(text: &str, timestamp: u64, group: Option<&GroupId>) -> Vec<u8> {
    Content {
        data_message: Some(DataMessage {
            body: text.to_string(),
            timestamp,
            group_v2: group.map(|g| GroupContextV2 {
                master_key: g.0.clone(),
                revision: 0,
            }),
        }),
    }
    .encode_to_vec()
}

pub struct EngineSender {
    engine: Arc<dyn ProtocolEngine>,
    sink: Arc<dyn MessageSink>,
    groups: Arc<dyn GroupDirectory>,
}

impl EngineSender {
    pub fn new(
        engine: Arc<dyn ProtocolEngine>,
        sink: Arc<dyn MessageSink>,
        groups: Arc<dyn GroupDirectory>,
    ) -> Self {
        Self {
            engine,
            sink,
            groups,
        }
    }

    async fn send_content(
        &self,
        credentials: &Credentials,
        recipient: &ServiceId,
        content: &[u8],
        timestamp: u64,
    ) -> SignalResult<()> {
        let ciphertext = self.engine.encrypt_session(recipient, content)?;
        self.sink
            .deliver(credentials, recipient, &ciphertext, timestamp)
            .await
    }
}

#[async_trait]
impl SignalSender for EngineSender {
    async fn send_message(
        &self,
        account: &DeviceCredential,
        recipient: &ServiceId,
        text: &str,
        timestamp: u64,
    ) -> SignalResult<u64> {
        let content = text_content(text, timestamp, None);
        self.send_content(&account.credentials(), recipient, &content, timestamp)
            .await?;
        debug!("Sent message {} to {}", timestamp, recipient);
        Ok(timestamp)
    }

    async fn send_group_message(
        &self,
        account: &DeviceCredential,
        group: &GroupId,
        text: &str,
        timestamp: u64,
    ) -> SignalResult<GroupSendResult> {
        let own = ServiceId(account.account.aci.clone());
        let members: Vec<ServiceId> = self
            .groups
            .members(group)
            .await?
            .into_iter()
            .filter(|member| *member != own)
            .collect();

        let credentials = account.credentials();
        let content = text_content(text, timestamp, Some(group));
        let outcomes = join_all(members.iter().map(|member| {
            self.send_content(&credentials, member, &content, timestamp)
        }))
        .await;

        let mut result = GroupSendResult::default();
        for (member, outcome) in members.into_iter().zip(outcomes) {
            match outcome {
                Ok(()) => result.successfully_sent_to.push(member),
                Err(error) => {
                    warn!("Group {} send to {} failed: {}", group, member, error);
                    result.failed_to_send_to.push((member, error));
                }
            }
        }
        Ok(result)
    }
}
