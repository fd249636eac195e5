//! Kafka slot: binds bus handlers to consumer group subscriptions.

use async_trait::async_trait;
use tigerbalm_kernel::{
    BusError, BusResult, Handler, IntoBusReport, MatchArg, Slot, SlotType, string_matches,
};

use crate::consumer_group::ConsumerGroup;
use crate::error::KafkaError;

/// Match arguments are `[topic, group]`.
pub struct KafkaSlot {
    group: ConsumerGroup,
}

impl KafkaSlot {
    pub fn new(group: ConsumerGroup) -> Self {
        Self { group }
    }

    pub fn consumer_group(&self) -> &ConsumerGroup {
        &self.group
    }
}

#[async_trait]
impl Slot for KafkaSlot {
    fn slot_type(&self) -> SlotType {
        SlotType::Kafka
    }

    async fn add_handler(&self, handler: Handler, matches: &[MatchArg]) -> BusResult<()> {
        let Some([topic, group]) = string_matches::<2>(SlotType::Kafka, matches) else {
            return Ok(());
        };
        let added = self.group.add(topic, group, vec![handler]).await;
        added
            .map_err(|e| match e {
                KafkaError::TopicExisted(key) => BusError::duplicate(SlotType::Kafka, key.to_string()),
                other => BusError::slot_failure(SlotType::Kafka, other.to_string()),
            })
            .into_report()
    }

    async fn del_handler(&self, matches: &[MatchArg]) -> BusResult<()> {
        let Some([topic, group]) = string_matches::<2>(SlotType::Kafka, matches) else {
            return Ok(());
        };
        match self.group.del(topic, group).await {
            Ok(()) | Err(KafkaError::NotSubscribed(_)) => Ok(()),
            Err(e) => Err(BusError::slot_failure(SlotType::Kafka, e.to_string())).into_report(),
        }
    }
}
