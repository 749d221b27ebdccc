//! Routing from exchanges to queues.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::utils::BrokerError;

pub const DEFAULT_EXCHANGE: &str = "";

/// Direct exchange that receives dead-lettered messages.
pub const DEAD_LETTER_EXCHANGE: &str = "amq.dlx";

/// Queue bound to [`DEAD_LETTER_EXCHANGE`] under its own name.
pub const DEAD_LETTER_QUEUE: &str = "amq.dlq";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    /// Routes on exact routing key match.
    Direct,
    /// Routes to every bound queue.
    Fanout,
}

impl FromStr for ExchangeType {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(ExchangeType::Direct),
            "fanout" => Ok(ExchangeType::Fanout),
            other => Err(BrokerError::validation(format!("unknown exchange type {other}"))),
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeType::Direct => f.write_str("direct"),
            ExchangeType::Fanout => f.write_str("fanout"),
        }
    }
}

#[derive(Debug)]
pub struct Exchange {
    name: String,
    kind: ExchangeType,
    durable: bool,
    /// routing key -> bound queues
    bindings: RwLock<BTreeMap<String, BTreeSet<String>>>,
}

impl Exchange {
    pub fn new(name: &str, kind: ExchangeType, durable: bool) -> Self {
        Self {
            name: name.to_string(),
            kind,
            durable,
            bindings: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ExchangeType {
        self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn bind(&self, queue: &str, routing_key: &str) -> bool {
        self.bindings
            .write()
            .entry(routing_key.to_string())
            .or_default()
            .insert(queue.to_string())
    }

    pub fn unbind(&self, queue: &str, routing_key: &str) -> bool {
        let mut bindings = self.bindings.write();
        let Some(queues) = bindings.get_mut(routing_key) else {
            return false;
        };
        let removed = queues.remove(queue);
        if queues.is_empty() {
            bindings.remove(routing_key);
        }
        removed
    }

    /// Drops every binding of `queue`.
    pub fn unbind_queue(&self, queue: &str) {
        let mut bindings = self.bindings.write();
        bindings.retain(|_, queues| {
            queues.remove(queue);
            !queues.is_empty()
        });
    }

    /// Queues a message with `routing_key` goes to, each once.
    pub fn route(&self, routing_key: &str) -> BTreeSet<String> {
        let bindings = self.bindings.read();
        match self.kind {
            ExchangeType::Direct => bindings.get(routing_key).cloned().unwrap_or_default(),
            ExchangeType::Fanout => bindings.values().flatten().cloned().collect(),
        }
    }

    pub fn is_unused(&self) -> bool {
        self.bindings.read().is_empty()
    }
}

/// Exchanges declared by the broker itself. They cannot be deleted and are
/// never written to storage.
pub fn is_builtin(name: &str) -> bool {
    name == DEFAULT_EXCHANGE || name.starts_with("amq.")
}

pub struct ExchangeRegistry {
    exchanges: RwLock<HashMap<String, Arc<Exchange>>>,
}

impl ExchangeRegistry {
    /// Registry with the default exchange and the `amq.direct`,
    /// `amq.fanout` and `amq.dlx` built-ins.
    pub fn new() -> Self {
        let builtins = [
            (DEFAULT_EXCHANGE, ExchangeType::Direct),
            ("amq.direct", ExchangeType::Direct),
            ("amq.fanout", ExchangeType::Fanout),
            (DEAD_LETTER_EXCHANGE, ExchangeType::Direct),
        ];
        let exchanges = builtins
            .into_iter()
            .map(|(name, kind)| (name.to_string(), Arc::new(Exchange::new(name, kind, true))))
            .collect();
        Self {
            exchanges: RwLock::new(exchanges),
        }
    }

    /// Returns the existing exchange when name and type match.
    pub fn declare(&self, name: &str, kind: ExchangeType, durable: bool) -> Result<Arc<Exchange>, BrokerError> {
        let mut exchanges = self.exchanges.write();
        if let Some(existing) = exchanges.get(name) {
            if existing.kind() != kind {
                return Err(BrokerError::validation(format!(
                    "exchange {name} already exists with type {}",
                    existing.kind()
                )));
            }
            return Ok(existing.clone());
        }

        let exchange = Arc::new(Exchange::new(name, kind, durable));
        exchanges.insert(name.to_string(), exchange.clone());
        Ok(exchange)
    }

    pub fn delete(&self, name: &str, if_unused: bool) -> Result<(), BrokerError> {
        if is_builtin(name) {
            return Err(BrokerError::validation(format!("cannot delete built-in exchange {name:?}")));
        }

        let mut exchanges = self.exchanges.write();
        let exchange = exchanges
            .get(name)
            .ok_or_else(|| BrokerError::UnknownExchange(name.to_string()))?;
        if if_unused && !exchange.is_unused() {
            return Err(BrokerError::validation(format!("exchange {name} still has bindings")));
        }
        exchanges.remove(name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Exchange>> {
        self.exchanges.read().get(name).cloned()
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<Exchange>, BrokerError> {
        self.get(name)
            .ok_or_else(|| BrokerError::UnknownExchange(name.to_string()))
    }

    /// Removes `queue` from every exchange.
    pub fn unbind_queue(&self, queue: &str) {
        for exchange in self.exchanges.read().values() {
            exchange.unbind_queue(queue);
        }
    }
}

impl Default for ExchangeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
