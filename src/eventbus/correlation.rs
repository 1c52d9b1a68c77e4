//! Awaiting events and request/response correlation on top of the bus.
//!
//! Waiters register a transient subscription under a private module id and
//! complete a oneshot channel from inside the synchronous handler. The
//! subscription is removed when the wait finishes, times out or is dropped.

use super::{EmitOutcome, Event, EventBus};
use crate::types::{Error, RequestId, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::oneshot;

/// Payload key carrying the correlation id.
pub const REQUEST_ID_FIELD: &str = "requestId";

pub const WAITER_PREFIX: &str = "__waiter:";

/// Removes the waiter's subscriptions on every exit path.
struct WaiterGuard<'a> {
    bus: &'a EventBus,
    module_id: String,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.bus.unsubscribe_all(&self.module_id);
    }
}

/// Name of the response event paired with `request_event`.
pub fn response_event(request_event: &str) -> String {
    format!("{request_event}:response")
}

impl EventBus {
    /// Wait for the next `event` accepted by `predicate`.
    ///
    /// Fails with [`Error::Timeout`] when nothing matches within `timeout`.
    pub async fn wait_for_event<P>(&self, event: &str, timeout: Duration, predicate: P) -> Result<Event>
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let module_id = format!("{WAITER_PREFIX}{}", uuid::Uuid::new_v4());
        let rx = self.arm_waiter(&module_id, event, predicate);
        let _guard = WaiterGuard {
            bus: self,
            module_id,
        };
        await_waiter(rx, event, timeout).await
    }

    /// Emit `name` with a fresh `requestId` and await the matching
    /// `<name>:response` event.
    ///
    /// The response subscription is in place before the request is emitted,
    /// so responders that answer synchronously are observed.
    pub async fn request(&self, source: &str, name: &str, payload: Value, timeout: Duration) -> Result<Event> {
        let request_id = RequestId::new();
        let mut payload = match payload {
            Value::Object(map) => Value::Object(map),
            Value::Null => json!({}),
            other => json!({ "data": other }),
        };
        if let Value::Object(map) = &mut payload {
            map.insert(REQUEST_ID_FIELD.to_string(), json!(request_id.as_str()));
        }

        let response = response_event(name);
        let module_id = format!("{WAITER_PREFIX}{}", request_id.as_str());
        let expected = request_id.as_str().to_string();
        let rx = self.arm_waiter(&module_id, &response, move |event| {
            event.str_field(REQUEST_ID_FIELD) == Some(expected.as_str())
        });
        let _guard = WaiterGuard {
            bus: self,
            module_id,
        };

        if let EmitOutcome::Blocked(trip) = self.emit_from(source, name, payload) {
            return Err(Error::cancelled(format!(
                "request {name} blocked by protection: {trip:?}"
            )));
        }
        await_waiter(rx, &response, timeout).await
    }

    /// Answer a request event, copying its `requestId` into the response.
    pub fn respond(&self, module_id: &str, request: &Event, payload: Value) -> Result<EmitOutcome> {
        let request_id = request
            .str_field(REQUEST_ID_FIELD)
            .ok_or_else(|| {
                Error::validation(format!("event {} carries no {REQUEST_ID_FIELD}", request.name))
            })?
            .to_string();
        let mut payload = match payload {
            Value::Object(map) => Value::Object(map),
            Value::Null => json!({}),
            other => json!({ "data": other }),
        };
        if let Value::Object(map) = &mut payload {
            map.insert(REQUEST_ID_FIELD.to_string(), json!(request_id));
        }
        Ok(self.emit_from(module_id, &response_event(&request.name), payload))
    }

    fn arm_waiter<P>(&self, module_id: &str, event: &str, predicate: P) -> oneshot::Receiver<Event>
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        self.subscribe(module_id, event, move |_, event| {
            if predicate(event) {
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(event.clone());
                }
            }
            Ok(())
        });
        rx
    }
}

async fn await_waiter(rx: oneshot::Receiver<Event>, event: &str, timeout: Duration) -> Result<Event> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(event)) => Ok(event),
        Ok(Err(_)) => Err(Error::cancelled(format!("waiter for {event} dropped"))),
        Err(_) => Err(Error::timeout(format!("no {event} within {timeout:?}"))),
    }
}
