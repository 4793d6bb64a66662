//! Per-connection traffic-type filtering
//!
//! Each client declares the message types it wants once after connecting;
//! the engine filters every outgoing message per connection before it is
//! written. A type absent from the subscription is silently skipped for
//! that client, never queued and never an error. The default subscription
//! is empty: a client that declares nothing receives nothing.

use std::collections::BTreeSet;

use crate::codec::{Message, MessageType};

/// The set of message types a connected client receives
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscription {
    types: BTreeSet<MessageType>,
}

impl Subscription {
    /// Empty subscription: no traffic delivered
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(types: BTreeSet<MessageType>) -> Self {
        Self { types }
    }

    /// Typical monitoring-role subscription: metering and topology, no
    /// control state
    pub fn monitoring() -> Self {
        Self::new(
            [
                MessageType::EnvironmentParameters,
                MessageType::ReinitIoCount,
                MessageType::AnalyzerParameters,
                MessageType::AudioBuffer,
            ]
            .into_iter()
            .collect(),
        )
    }

    /// Typical remote-control-role subscription: control state and
    /// topology, no audio (a fader surface should not pay its bandwidth)
    pub fn remote_control() -> Self {
        Self::new(
            [
                MessageType::EnvironmentParameters,
                MessageType::ReinitIoCount,
                MessageType::ControlParameters,
            ]
            .into_iter()
            .collect(),
        )
    }

    pub fn allows(&self, message_type: MessageType) -> bool {
        self.types.contains(&message_type)
    }

    pub fn allows_message(&self, message: &Message) -> bool {
        self.allows(message.message_type())
    }

    pub fn types(&self) -> &BTreeSet<MessageType> {
        &self.types
    }

    pub fn into_types(self) -> BTreeSet<MessageType> {
        self.types
    }
}

impl From<BTreeSet<MessageType>> for Subscription {
    fn from(types: BTreeSet<MessageType>) -> Self {
        Self::new(types)
    }
}
