use super::{acks::Publisher, messages::MqttTopics};
use crate::{
    config::{ConfigMqtt, ConfigTls},
    ports::{MessageBroker, PortError, Qos},
};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, Key, MqttOptions, Transport};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use std::time::Duration;

const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Message broker port over MQTT. A publish completes once the broker acknowledges it. Until
/// then the rumqttc event loop keeps retransmitting it across reconnects.
pub struct MqttBroker {
    publisher: Publisher,
    connected: watch::Receiver<bool>,
    topics: MqttTopics,
    eventloop: JoinHandle<()>,
}

/// Connects to the broker and waits for the first ConnAck. Failing to reach the broker at
/// startup is a configuration problem, so no retry happens here.
pub async fn connect(config: &ConfigMqtt) -> Result<MqttBroker, String> {
    let topics = MqttTopics::new(config.base_topic.clone());

    let mut mqttoptions =
        MqttOptions::new(config.client_id.clone(), config.address.clone(), config.port);
    mqttoptions
        .set_keep_alive(Duration::from_secs(5))
        .set_pending_throttle(Duration::from_millis(10));
    if let Some(username) = &config.username {
        mqttoptions.set_credentials(
            username.clone(),
            config.password.clone().unwrap_or_default(),
        );
    }
    // Keep the session so QoS 1 publishes still in flight survive a broker restart
    mqttoptions.set_clean_session(false);
    mqttoptions.set_last_will(topics.lwt().into());
    if let Some(tls) = &config.tls {
        mqttoptions.set_transport(load_tls(tls).await?);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);
    let publisher = Publisher::new(client);
    let (connected_tx, mut connected) = watch::channel(false);

    // Launch the event loop as a task
    let announcer = publisher.clone();
    let online = topics.online();
    let eventloop = tokio::task::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("Connected to MQTT broker.");
                    let _ = connected_tx.send(true);
                    if let Err(e) = announcer.send(
                        &online.topic,
                        online.qos,
                        online.retain,
                        online.payload.clone(),
                    ) {
                        warn!("Unable to announce availability: {}", e);
                    }
                }
                Ok(event) => announcer.track(&event),
                Err(e) => {
                    let _ = connected_tx.send(false);
                    error!("MQTT Connection error encountered: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    let established = tokio::time::timeout(config.connect_timeout(), connected.wait_for(|up| *up))
        .await
        .map(|state| state.is_ok())
        .unwrap_or(false);
    if !established {
        eventloop.abort();
        return Err(format!(
            "MQTT broker {}:{} unreachable within {:?}",
            config.address,
            config.port,
            config.connect_timeout()
        ));
    }

    Ok(MqttBroker {
        publisher,
        connected,
        topics,
        eventloop,
    })
}

async fn load_tls(tls: &ConfigTls) -> Result<Transport, String> {
    let read = |path: std::path::PathBuf| async move {
        tokio::fs::read(&path)
            .await
            .map_err(|e| format!("Unable to read {:?}: {}", path, e))
    };
    let ca = read(tls.ca_path.clone()).await?;
    let cert = read(tls.cert_path.clone()).await?;
    let key = read(tls.key_path.clone()).await?;
    Ok(Transport::tls(ca, Some((cert, Key::RSA(key))), None))
}

impl MqttBroker {
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Marks the bridge offline and disconnects cleanly
    pub async fn close(&self) {
        let offline = self.topics.lwt();
        match self
            .publisher
            .send(&offline.topic, offline.qos, offline.retain, offline.payload)
        {
            Ok(ack) => {
                if tokio::time::timeout(CLOSE_ACK_TIMEOUT, ack).await.is_err() {
                    debug!("Offline status not acknowledged before disconnect");
                }
            }
            Err(e) => debug!("Unable to publish offline status: {}", e),
        }
        if let Err(e) = self.publisher.client().disconnect().await {
            debug!("MQTT disconnect failed: {}", e);
        }
        // Give the event loop a moment to flush the disconnect before stopping it
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.eventloop.abort();
    }
}

#[async_trait]
impl MessageBroker for MqttBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), PortError> {
        if !self.is_connected() {
            return Err(PortError::Transient("MQTT broker connection is down".into()));
        }
        let ack = self
            .publisher
            .send(topic, qos, false, payload)
            .map_err(|e| PortError::Transient(format!("MQTT publish failed: {}", e)))?;
        // Bounded by the caller's phase timeout
        ack.await.map_err(|_| {
            PortError::Transient("MQTT event loop stopped before the broker acknowledged".into())
        })
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, Outgoing, PubAck};
    use tokio::sync::watch;

    use super::{MqttBroker, MqttTopics, Publisher};
    use crate::ports::{MessageBroker, PortError, Qos};

    fn broker(connected: bool) -> (Arc<MqttBroker>, rumqttc::EventLoop) {
        let (client, eventloop) =
            AsyncClient::new(MqttOptions::new("broker-test", "localhost", 1883), 10);
        let (_tx, rx) = watch::channel(connected);
        let broker = MqttBroker {
            publisher: Publisher::new(client),
            connected: rx,
            topics: MqttTopics::default(),
            eventloop: tokio::spawn(async {}),
        };
        (Arc::new(broker), eventloop)
    }

    #[tokio::test]
    async fn test_publish_waits_for_puback() {
        let (broker, _eventloop) = broker(true);
        let publishing = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .publish("alerts", b"{}".to_vec(), Qos::AtLeastOnce)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.publisher.track(&Event::Outgoing(Outgoing::Publish(1)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!publishing.is_finished());

        broker
            .publisher
            .track(&Event::Incoming(Incoming::PubAck(PubAck::new(1))));
        let result = tokio::time::timeout(Duration::from_secs(1), publishing)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_publish_while_disconnected() {
        let (broker, _eventloop) = broker(false);
        assert!(matches!(
            broker.publish("alerts", b"{}".to_vec(), Qos::AtLeastOnce).await,
            Err(PortError::Transient(_))
        ));
    }
}
