//! Client-side request routing across several connections to one service.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tonic::transport::Channel;
use tracing::debug;

use crate::config::TransportOptions;

/// One connection to one serving app.
#[derive(Debug)]
pub struct Target {
    app: String,
    uri: String,
    address: String,
    channel: Channel,
    options: TransportOptions,
    shut_down: AtomicBool,
}

impl Target {
    pub fn new(
        app: impl Into<String>,
        uri: impl Into<String>,
        address: impl Into<String>,
        channel: Channel,
        options: TransportOptions,
    ) -> Self {
        Self {
            app: app.into(),
            uri: uri.into(),
            address: address.into(),
            channel,
            options,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Resolved address, e.g. `localhost:4000`.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Exclude this target from routing.
    pub fn shut_down(&self) {
        self.shut_down.store(true, Ordering::Release);
    }
}

/// Selects one of several targets per call.
///
/// Selection order for a call:
/// 1. no route value: round robin over live targets
/// 2. route equals a live address: that address
/// 3. route equals an app name or uri whose address is live: that address
/// 4. otherwise: `string_hash(route) % live.len()`
#[derive(Debug)]
pub struct RequestRouter {
    service: String,
    targets: RwLock<Vec<Arc<Target>>>,
    counter: AtomicU64,
}

impl RequestRouter {
    pub fn new(service: impl Into<String>, targets: Vec<Arc<Target>>) -> Self {
        Self {
            service: service.into(),
            targets: RwLock::new(targets),
            counter: AtomicU64::new(0),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// All targets, live or not.
    pub fn targets(&self) -> Vec<Arc<Target>> {
        self.targets.read().map(|t| t.clone()).unwrap_or_default()
    }

    /// Addresses of targets not marked shut down, in insertion order.
    pub fn live_addresses(&self) -> Vec<String> {
        self.live().iter().map(|t| t.address.clone()).collect()
    }

    fn live(&self) -> Vec<Arc<Target>> {
        self.targets()
            .into_iter()
            .filter(|t| !t.is_shut_down())
            .collect()
    }

    /// Add a target at runtime.
    pub fn add_target(&self, target: Arc<Target>) {
        debug!(service = %self.service, address = %target.address, "Adding target");
        if let Ok(mut targets) = self.targets.write() {
            targets.push(target);
        }
    }

    /// Shut down and drop every target at the given address.
    ///
    /// Returns whether any target matched.
    pub fn remove_target(&self, address: &str) -> bool {
        let Ok(mut targets) = self.targets.write() else {
            return false;
        };
        let before = targets.len();
        targets.retain(|t| {
            if t.address == address {
                t.shut_down();
                false
            } else {
                true
            }
        });
        before != targets.len()
    }

    /// Pick the target for a call.
    pub fn select(&self, route: Option<&str>) -> Option<Arc<Target>> {
        let live = self.live();
        if live.is_empty() {
            return None;
        }

        let index = match route {
            None => {
                let n = self.counter.fetch_add(1, Ordering::Relaxed);
                (n % live.len() as u64) as usize
            }
            Some(route) => {
                if let Some(i) = live.iter().position(|t| t.address == route) {
                    i
                } else if let Some(i) = live.iter().position(|t| t.app == route || t.uri == route) {
                    i
                } else {
                    string_hash(route) as usize % live.len()
                }
            }
        };

        live.get(index).cloned()
    }

    /// Shut down every target.
    pub fn close(&self) {
        for target in self.targets() {
            target.shut_down();
        }
    }
}

/// Extract the routing key from a call payload.
///
/// A string payload routes by itself; an object routes by its string
/// `route` field.
pub fn route_of(payload: &Value) -> Option<&str> {
    match payload {
        Value::String(route) => Some(route),
        Value::Object(map) => map.get("route").and_then(Value::as_str),
        _ => None,
    }
}

/// djb2 string hash (xor variant) over UTF-16 code units, last unit first.
pub fn string_hash(s: &str) -> u32 {
    let units: Vec<u16> = s.encode_utf16().collect();
    units
        .iter()
        .rev()
        .fold(5381u32, |hash, &unit| hash.wrapping_mul(33) ^ u32::from(unit))
}
