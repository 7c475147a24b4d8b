//! Topic bus: the registry of named, bounded, in-process channels that is the
//! only transport between actors.
//!
//! Topics are created lazily on first use and carry exactly one message type,
//! fixed by the [`TopicName`] used to reach them. Each topic has a single
//! consumer which takes the receiving half with [`TopicBus::subscribe`]; any
//! number of producers clone [`Topic`] handles.
//!
//! Sends wait while a topic is full. That backpressure is how a flood of
//! client commands is throttled, so producers must never spawn their way
//! around it.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use log::{debug, info};
use tokio::sync::mpsc;

use crate::error::BusError;

pub const DEFAULT_TOPIC_CAPACITY: usize = 20;

/// Typed name of a topic
pub struct TopicName<T> {
    name: &'static str,
    _message: PhantomData<fn() -> T>,
}

impl<T> TopicName<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _message: PhantomData,
        }
    }
}

impl<T> Clone for TopicName<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TopicName<T> {}

struct Slot<T> {
    sender: mpsc::Sender<T>,
    receiver: Option<mpsc::Receiver<T>>,
}

/// Producer handle for one topic
pub struct Topic<T> {
    name: &'static str,
    sender: mpsc::Sender<T>,
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            sender: self.sender.clone(),
        }
    }
}

impl<T: Send + 'static> Topic<T> {
    /// Pushes a message, waiting while the topic is full.
    pub async fn send(&self, message: T) -> Result<(), BusError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| BusError::Closed(self.name))
    }
}

pub struct TopicBus {
    capacity: usize,
    topics: DashMap<&'static str, Box<dyn Any + Send + Sync>>,
    closed: AtomicBool,
}

impl TopicBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Runs `f` against the topic's slot, creating the topic first if needed.
    /// Creation and lookup happen under the same shard lock.
    fn with_slot<T, R>(
        &self,
        topic: &TopicName<T>,
        f: impl FnOnce(&mut Slot<T>) -> R,
    ) -> Result<R, BusError>
    where
        T: Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed(topic.name));
        }

        let mut entry = self.topics.entry(topic.name).or_insert_with(|| {
            debug!("Creating topic {} (capacity {})", topic.name, self.capacity);
            let (sender, receiver) = mpsc::channel::<T>(self.capacity);
            Box::new(Slot {
                sender,
                receiver: Some(receiver),
            }) as Box<dyn Any + Send + Sync>
        });

        let slot = entry
            .value_mut()
            .downcast_mut::<Slot<T>>()
            .ok_or(BusError::TypeMismatch(topic.name))?;
        Ok(f(slot))
    }

    /// Returns a producer handle, creating the topic on first use.
    pub fn topic<T: Send + 'static>(&self, name: &TopicName<T>) -> Result<Topic<T>, BusError> {
        self.with_slot(name, |slot| Topic {
            name: name.name,
            sender: slot.sender.clone(),
        })
    }

    /// Takes the receiving half of a topic. Each topic has exactly one consumer.
    pub fn subscribe<T: Send + 'static>(
        &self,
        name: &TopicName<T>,
    ) -> Result<mpsc::Receiver<T>, BusError> {
        self.with_slot(name, |slot| slot.receiver.take())?
            .ok_or(BusError::AlreadySubscribed(name.name))
    }

    #[cfg(test)]
    pub async fn send<T: Send + 'static>(
        &self,
        name: &TopicName<T>,
        message: T,
    ) -> Result<(), BusError> {
        self.topic(name)?.send(message).await
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Drops every known topic. Only called once all actor loops have exited.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let count = self.topics.len();
        self.topics.clear();
        info!("Topic bus closed ({} topics)", count);
    }
}

impl Default for TopicBus {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_test::{assert_err, assert_ok};

    const NUMBERS: TopicName<u32> = TopicName::new("numbers");
    const NUMBERS_AS_TEXT: TopicName<String> = TopicName::new("numbers");

    #[tokio::test]
    async fn test_topic_is_created_once() {
        let bus = TopicBus::new(4);
        let first = bus.topic(&NUMBERS).unwrap();
        let second = bus.topic(&NUMBERS).unwrap();
        let mut rx = bus.subscribe(&NUMBERS).unwrap();

        assert_ok!(first.send(1).await);
        assert_ok!(second.send(2).await);
        assert_ok!(bus.send(&NUMBERS, 3).await);

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
        assert_eq!(bus.topic_count(), 1);
    }

    #[test]
    fn test_single_consumer() {
        let bus = TopicBus::default();
        assert_ok!(bus.subscribe(&NUMBERS));
        assert_eq!(
            bus.subscribe(&NUMBERS).unwrap_err(),
            BusError::AlreadySubscribed("numbers")
        );
    }

    #[test]
    fn test_type_mismatch() {
        let bus = TopicBus::default();
        assert_ok!(bus.topic(&NUMBERS));
        assert_eq!(
            bus.topic(&NUMBERS_AS_TEXT).err(),
            Some(BusError::TypeMismatch("numbers"))
        );
    }

    #[tokio::test]
    async fn test_full_topic_applies_backpressure() {
        let bus = TopicBus::new(1);
        let topic = bus.topic(&NUMBERS).unwrap();
        let mut rx = bus.subscribe(&NUMBERS).unwrap();

        assert_ok!(topic.send(1).await);
        assert_err!(timeout(Duration::from_millis(50), topic.send(2)).await);

        assert_eq!(rx.recv().await, Some(1));
        assert_ok!(assert_ok!(timeout(Duration::from_millis(50), topic.send(3)).await));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn test_close() {
        let bus = TopicBus::default();
        let topic = bus.topic(&NUMBERS).unwrap();
        let rx = bus.subscribe(&NUMBERS).unwrap();

        drop(rx);
        bus.close();

        assert_eq!(bus.topic_count(), 0);
        assert_eq!(bus.topic(&NUMBERS).err(), Some(BusError::Closed("numbers")));
        assert_eq!(topic.send(5).await, Err(BusError::Closed("numbers")));
    }
}
