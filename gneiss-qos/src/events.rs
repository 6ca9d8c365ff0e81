/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Event fan-out primitives.

Two ways to notify a list of asynchronous listeners:
 * [`ParallelEventSender`] starts every listener at once and waits for all of them.
 * [`SequentialEventSender`] runs listeners one at a time, in registration order, waiting for each
   before starting the next.

[`EventHub`] pairs one of each: sequential listeners run first, then the parallel ones.
 */

use crate::error::GneissError;
use crate::mqtt::QualityOfService;
use crate::connection::ConnectionState;
use crate::session::ConnectionWill;

use futures::future::join_all;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

/// Future returned by an event listener
pub type EventListenerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// An asynchronous event listener
pub type EventListener<T> = Arc<dyn Fn(Arc<T>) -> EventListenerFuture + Send + Sync>;

/// Opaque identifier for a registered listener; used to remove it again.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ListenerHandle {
    id: u64
}

struct ListenerList<T> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, EventListener<T>)>>,
}

impl<T> ListenerList<T> {
    fn new() -> Self {
        ListenerList {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, listener: EventListener<T>) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push((id, listener));
        }

        ListenerHandle { id }
    }

    fn remove(&self, handle: ListenerHandle) -> bool {
        match self.listeners.lock() {
            Ok(mut listeners) => {
                let count = listeners.len();
                listeners.retain(|(id, _)| *id != handle.id);
                count != listeners.len()
            }
            Err(_) => { false }
        }
    }

    fn len(&self) -> usize {
        self.listeners.lock().map_or(0, |listeners| listeners.len())
    }

    // listeners may add or remove listeners while being notified
    fn snapshot(&self) -> Vec<EventListener<T>> {
        self.listeners.lock().map_or(Vec::new(), |listeners| {
            listeners.iter().map(|(_, listener)| listener.clone()).collect()
        })
    }
}

/// "Notify all, wait for all" fan-out
pub struct ParallelEventSender<T> {
    listeners: ListenerList<T>,
}

impl<T: Send + Sync + 'static> ParallelEventSender<T> {

    /// Creates a sender with no listeners
    pub fn new() -> Self {
        ParallelEventSender {
            listeners: ListenerList::new(),
        }
    }

    /// Registers a listener
    pub fn add_listener(&self, listener: EventListener<T>) -> ListenerHandle {
        self.listeners.add(listener)
    }

    /// Removes a listener; returns false if it was not registered
    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        self.listeners.remove(handle)
    }

    /// Returns the number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Starts every listener concurrently and resolves once all of them have finished
    pub async fn raise(&self, event: Arc<T>) {
        let pending = self.listeners.snapshot().into_iter().map(|listener| listener(event.clone()));
        join_all(pending).await;
    }
}

impl<T: Send + Sync + 'static> Default for ParallelEventSender<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// "Notify each in turn, wait for each" fan-out
pub struct SequentialEventSender<T> {
    listeners: ListenerList<T>,
}

impl<T: Send + Sync + 'static> SequentialEventSender<T> {

    /// Creates a sender with no listeners
    pub fn new() -> Self {
        SequentialEventSender {
            listeners: ListenerList::new(),
        }
    }

    /// Registers a listener.  Listeners run in registration order.
    pub fn add_listener(&self, listener: EventListener<T>) -> ListenerHandle {
        self.listeners.add(listener)
    }

    /// Removes a listener; returns false if it was not registered
    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        self.listeners.remove(handle)
    }

    /// Returns the number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Runs each listener to completion before starting the next
    pub async fn raise(&self, event: Arc<T>) {
        for listener in self.listeners.snapshot() {
            listener(event.clone()).await;
        }
    }
}

impl<T: Send + Sync + 'static> Default for SequentialEventSender<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A sequential and a parallel sender for the same event type
pub struct EventHub<T> {

    /// Listeners that must observe events one at a time, in order
    pub sequential: SequentialEventSender<T>,

    /// Listeners that may observe events concurrently
    pub parallel: ParallelEventSender<T>,
}

impl<T: Send + Sync + 'static> EventHub<T> {

    /// Creates a hub with no listeners
    pub fn new() -> Self {
        EventHub {
            sequential: SequentialEventSender::new(),
            parallel: ParallelEventSender::new(),
        }
    }

    /// Notifies sequential listeners, then parallel listeners
    pub async fn raise(&self, event: T) {
        let event = Arc::new(event);
        self.sequential.raise(event.clone()).await;
        self.parallel.raise(event).await;
    }
}

impl<T: Send + Sync + 'static> Default for EventHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// An application message received from the peer of a connection
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReceivedMessage {

    /// Client id of the connection the message arrived on
    pub client_id: String,

    /// Topic the message was published to
    pub topic: String,

    /// Message body
    pub payload: Vec<u8>,

    /// Quality of service the message was delivered with
    pub qos: QualityOfService,

    /// Retain flag of the publish
    pub retain: bool,
}

/// Final notification for a connection that reached a terminal state
#[derive(Debug)]
pub struct ConnectionTerminated {

    /// Endpoint-local identifier of the connection
    pub connection_id: u64,

    /// Client id bound to the connection, if it got that far
    pub client_id: Option<String>,

    /// Terminal state reached
    pub state: ConnectionState,

    /// Error that faulted the connection, if any
    pub error: Option<GneissError>,
}

/// Listener registrations for everything an endpoint reports
#[derive(Default)]
pub struct EndpointEvents {

    /// Application messages delivered by receiver flows
    pub message_received: EventHub<ReceivedMessage>,

    /// Connections reaching a terminal state
    pub connection_terminated: EventHub<ConnectionTerminated>,

    /// Wills released by abnormal disconnects; consumed by an external last-will dispatcher
    pub will_published: EventHub<ConnectionWill>,
}

/// Wraps an async closure as an [`EventListener`]
pub fn listener<T, F, Fut>(f: F) -> EventListener<T>
    where F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
          Fut: Future<Output = ()> + Send + 'static {
    Arc::new(move |event| Box::pin(f(event)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sequential_runs_in_registration_order() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let sender = SequentialEventSender::<u32>::new();
            let log = Arc::new(Mutex::new(Vec::new()));

            for (index, delay_ms) in [(1u32, 30u64), (2, 0), (3, 10)] {
                let log = log.clone();
                sender.add_listener(listener(move |event: Arc<u32>| {
                    let log = log.clone();
                    async move {
                        log.lock().unwrap().push((index, *event, "start"));
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        log.lock().unwrap().push((index, *event, "end"));
                    }
                }));
            }

            sender.raise(Arc::new(7)).await;

            let log = log.lock().unwrap().clone();
            assert_eq!(vec![(1, 7, "start"), (1, 7, "end"), (2, 7, "start"), (2, 7, "end"), (3, 7, "start"), (3, 7, "end")], log);
        });
    }

    #[test]
    fn parallel_starts_all_then_waits_for_all() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let sender = ParallelEventSender::<u32>::new();
            let log = Arc::new(Mutex::new(Vec::new()));

            for (index, delay_ms) in [(1u32, 40u64), (2, 0)] {
                let log = log.clone();
                sender.add_listener(listener(move |_event: Arc<u32>| {
                    let log = log.clone();
                    async move {
                        log.lock().unwrap().push(format!("start {}", index));
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        log.lock().unwrap().push(format!("end {}", index));
                    }
                }));
            }

            sender.raise(Arc::new(1)).await;

            let log = log.lock().unwrap().clone();
            assert_eq!(vec!["start 1", "start 2", "end 2", "end 1"], log);
        });
    }

    #[test]
    fn remove_listener() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let hub = EventHub::<u32>::new();
            let counter = Arc::new(AtomicU64::new(0));

            let sequential_counter = counter.clone();
            let handle = hub.sequential.add_listener(listener(move |_| {
                let counter = sequential_counter.clone();
                async move { counter.fetch_add(1, Ordering::SeqCst); }
            }));

            let parallel_counter = counter.clone();
            hub.parallel.add_listener(listener(move |_| {
                let counter = parallel_counter.clone();
                async move { counter.fetch_add(10, Ordering::SeqCst); }
            }));

            hub.raise(1).await;
            assert_eq!(11, counter.load(Ordering::SeqCst));

            assert!(hub.sequential.remove_listener(handle));
            assert!(!hub.sequential.remove_listener(handle));
            assert_eq!(0, hub.sequential.listener_count());

            hub.raise(2).await;
            assert_eq!(21, counter.load(Ordering::SeqCst));
        });
    }
}
