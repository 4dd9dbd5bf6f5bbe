use serde::{Deserialize, Serialize};

use crate::ports::Qos;

/// Bridge-level topics, separate from the configured alert topics
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct MqttTopics {
    pub base: String,
}

impl MqttTopics {
    pub fn new(base: String) -> Self {
        Self { base }
    }

    pub fn availability(&self) -> String {
        format!("{}/availability", self.base)
    }

    /// Get the LWT for the bridge, sent by the broker if we disappear
    pub fn lwt(&self) -> MqttMessage {
        MqttMessage::new(self.availability(), Qos::AtLeastOnce, true, "offline")
    }

    /// Published after every (re)connection
    pub fn online(&self) -> MqttMessage {
        MqttMessage::new(self.availability(), Qos::AtLeastOnce, true, "online")
    }
}

impl Default for MqttTopics {
    fn default() -> Self {
        Self {
            base: "alert_sink".into(),
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub qos: Qos,
    pub retain: bool,
    pub payload: String,
}

impl MqttMessage {
    pub fn new(topic: String, qos: Qos, retain: bool, payload: impl Into<String>) -> Self {
        Self {
            topic,
            qos,
            retain,
            payload: payload.into(),
        }
    }
}

impl From<MqttMessage> for rumqttc::LastWill {
    fn from(m: MqttMessage) -> Self {
        rumqttc::LastWill::new(m.topic, m.payload, m.qos.into(), m.retain)
    }
}

impl From<Qos> for rumqttc::QoS {
    fn from(q: Qos) -> Self {
        use rumqttc::QoS;
        match q {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
            Qos::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}
