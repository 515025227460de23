//! Capability registry.
//!
//! Every operation a session can invoke is a [`Capability`]: a name, a description, a JSON
//! Schema for its arguments, a remote-safety flag and an async handler. The registry is
//! built once at startup and shared by every session.

pub mod admin;
pub mod graph;
pub mod recall;
pub mod records;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{MemoryError, MemoryResult};
use crate::memory::coordinator::MemoryCoordinator;
use crate::protocol::permissions::{classify, is_remote_allowed, Decision, TrustContext};

/// Everything a handler knows about the call it is serving.
#[derive(Clone)]
pub struct CallContext {
    pub owner: String,
    pub session_id: String,
    pub trust: TrustContext,
    pub coordinator: Arc<MemoryCoordinator>,
    /// Cancelled when the call times out or its session goes away.
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;
    /// Must agree with the remote allow-list; the registry refuses mismatches.
    fn remote_safe(&self) -> bool;
    async fn invoke(&self, ctx: &CallContext, args: Value) -> MemoryResult<Value>;
}

/// Advertised form of a capability (`capabilities/list`).
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub remote_safe: bool,
}

#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    caps: BTreeMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in memory capability.
    pub fn builtin() -> anyhow::Result<Self> {
        let mut registry = Self::new();
        records::register(&mut registry)?;
        recall::register(&mut registry)?;
        graph::register(&mut registry)?;
        admin::register(&mut registry)?;
        Ok(registry)
    }

    pub fn register(&mut self, cap: Arc<dyn Capability>) -> anyhow::Result<()> {
        let name = cap.name().to_string();
        if self.caps.contains_key(&name) {
            bail!("capability '{name}' is already registered");
        }
        if cap.remote_safe() != is_remote_allowed(&name) {
            bail!(
                "capability '{name}' declares remote_safe = {} but the remote allow-list says {}",
                cap.remote_safe(),
                is_remote_allowed(&name)
            );
        }
        self.caps.insert(name, cap);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.caps.get(name).cloned()
    }

    /// Capabilities visible under `trust`, in name order.
    pub fn advertise(&self, trust: TrustContext) -> Vec<CapabilityInfo> {
        self.caps
            .values()
            .filter(|c| classify(c.name(), trust) == Decision::Allow)
            .map(|c| CapabilityInfo {
                name: c.name().to_string(),
                description: c.description().to_string(),
                input_schema: c.input_schema(),
                remote_safe: c.remote_safe(),
            })
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.caps.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.caps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }
}

/// Decode call arguments. A missing argument object is treated as `{}`.
pub fn parse_args<T: DeserializeOwned>(args: Value) -> MemoryResult<T> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    serde_json::from_value(args)
        .map_err(|e| MemoryError::validation(format!("invalid arguments: {e}")))
}

pub fn schema_of<T: JsonSchema>() -> Value {
    schemars::schema_for!(T).to_value()
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> MemoryResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| MemoryError::Internal(anyhow::anyhow!("failed to encode result: {e}")))
}

/// Declare a unit-struct capability whose arguments are `$params`.
macro_rules! capability {
    ($ty:ident, $name:literal, $params:ty, remote_safe = $safe:literal, $desc:literal, $handler:path) => {
        pub struct $ty;

        #[async_trait::async_trait]
        impl $crate::tools::Capability for $ty {
            fn name(&self) -> &str {
                $name
            }

            fn description(&self) -> &str {
                $desc
            }

            fn input_schema(&self) -> serde_json::Value {
                $crate::tools::schema_of::<$params>()
            }

            fn remote_safe(&self) -> bool {
                $safe
            }

            async fn invoke(
                &self,
                ctx: &$crate::tools::CallContext,
                args: serde_json::Value,
            ) -> $crate::error::MemoryResult<serde_json::Value> {
                let params: $params = $crate::tools::parse_args(args)?;
                $handler(ctx, params).await
            }
        }
    };
}
pub(crate) use capability;
