//! Completes publishes only once the broker has taken ownership of them.
//!
//! rumqttc hands back no packet id for a publish request, so waiters are queued in request order
//! and pick up their id when the event loop reports the packet leaving.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use rumqttc::{AsyncClient, ClientError, Event, Incoming, Outgoing};
use tokio::sync::oneshot;

use crate::ports::Qos;

type Waiter = oneshot::Sender<()>;

#[derive(Default)]
struct PendingAcks {
    /// Requested, not yet written by the event loop
    queued: VecDeque<Waiter>,
    /// Held back by rumqttc until the previous packet with this id is acknowledged
    colliding: Option<(u16, Waiter)>,
    inflight: HashMap<u16, Waiter>,
}

impl PendingAcks {
    fn track(&mut self, event: &Event) {
        match event {
            Event::Outgoing(Outgoing::Publish(pkid)) => self.sent(*pkid),
            Event::Outgoing(Outgoing::AwaitAck(pkid)) => {
                if let Some(waiter) = self.queued.pop_front() {
                    self.colliding = Some((*pkid, waiter));
                }
            }
            Event::Incoming(Incoming::PubAck(ack)) => {
                self.acked(ack.pkid);
                self.release_collision(ack.pkid);
            }
            Event::Incoming(Incoming::PubRec(rec)) => self.acked(rec.pkid),
            Event::Incoming(Incoming::PubComp(comp)) => self.release_collision(comp.pkid),
            _ => {}
        }
    }

    fn sent(&mut self, pkid: u16) {
        // QoS 0 has nothing to wait for
        if pkid == 0 {
            if let Some(waiter) = self.queued.pop_front() {
                let _ = waiter.send(());
            }
            return;
        }
        // Either a retransmission after reconnect, or the held-back packet going out ahead of
        // the ack that freed its id
        let colliding = matches!(&self.colliding, Some((id, _)) if *id == pkid);
        if colliding || self.inflight.contains_key(&pkid) {
            return;
        }
        if let Some(waiter) = self.queued.pop_front() {
            self.inflight.insert(pkid, waiter);
        }
    }

    fn acked(&mut self, pkid: u16) {
        if let Some(waiter) = self.inflight.remove(&pkid) {
            let _ = waiter.send(());
        }
    }

    fn release_collision(&mut self, pkid: u16) {
        match self.colliding.take() {
            Some((id, waiter)) if id == pkid => {
                self.inflight.insert(pkid, waiter);
            }
            other => self.colliding = other,
        }
    }
}

/// Publishing side of the MQTT client. Every publish goes through here so request order and
/// waiter order stay the same.
#[derive(Clone)]
pub struct Publisher {
    client: AsyncClient,
    acks: Arc<Mutex<PendingAcks>>,
}

impl Publisher {
    pub fn new(client: AsyncClient) -> Self {
        Self {
            client,
            acks: Arc::default(),
        }
    }

    /// Queues a publish. The receiver completes when the broker acknowledges it, or right after
    /// sending for QoS 0. A full request channel is reported instead of waited on, since the
    /// event loop that drains it also calls this.
    pub fn send(
        &self,
        topic: &str,
        qos: Qos,
        retain: bool,
        payload: impl Into<Vec<u8>>,
    ) -> Result<oneshot::Receiver<()>, ClientError> {
        let (tx, rx) = oneshot::channel();
        let mut acks = self.lock();
        acks.queued.push_back(tx);
        if let Err(e) = self.client.try_publish(topic, qos.into(), retain, payload) {
            acks.queued.pop_back();
            return Err(e);
        }
        Ok(rx)
    }

    /// Feeds an event loop notification to the waiting publishes
    pub fn track(&self, event: &Event) {
        self.lock().track(event);
    }

    pub fn client(&self) -> &AsyncClient {
        &self.client
    }

    fn lock(&self) -> MutexGuard<'_, PendingAcks> {
        match self.acks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
