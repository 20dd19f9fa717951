//! Dispatcher (spec.md §4.12). Adapters are opaque, named, dispatchable
//! units — the controller never inspects payload structure beyond what the
//! schema already validated (spec.md §9 "implicit interfaces").
//!
//! No concrete adapter ships with this crate (spec.md §1 Non-goals); tests
//! use a minimal in-test stub.

use std::collections::HashMap;

use crate::error::Reason;
use crate::model::{Proposal, RequesterPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterResult {
    pub exit_code: i32,
    pub message: String,
}

impl AdapterResult {
    pub fn success(message: impl Into<String>) -> Self {
        AdapterResult {
            exit_code: 0,
            message: message.into(),
        }
    }

    pub fn failure(exit_code: i32, message: impl Into<String>) -> Self {
        AdapterResult {
            exit_code,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Named, registered executor invoked after approval. Adapters share no
/// common type beyond "name → function producing a structured result"
/// (spec.md §9); this trait is that minimal common surface.
pub trait Adapter: Send + Sync {
    fn invoke(&self, proposal: &Proposal, requester_policy: &RequesterPolicy) -> AdapterResult;
}

#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Box<dyn Adapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        AdapterRegistry {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, adapter: Box<dyn Adapter>) {
        self.adapters.insert(name.into(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Adapter> {
        self.adapters.get(name).map(|b| b.as_ref())
    }
}

pub struct DispatchOutcome {
    pub adapter: String,
    pub result: AdapterResult,
}

/// Only called after `Decision.valid` is true. Looks up `payload.adapter`
/// in the registry; absence is a deployment fault (`ADAPTER_NOT_REGISTERED`),
/// not a policy fault.
pub fn dispatch(
    proposal: &Proposal,
    requester_policy: &RequesterPolicy,
    registry: &AdapterRegistry,
) -> Result<DispatchOutcome, Reason> {
    let adapter_name = proposal.adapter().ok_or(Reason::AdapterNotRegistered)?;
    let adapter = registry
        .get(adapter_name)
        .ok_or(Reason::AdapterNotRegistered)?;
    let result = adapter.invoke(proposal, requester_policy);
    Ok(DispatchOutcome {
        adapter: adapter_name.to_string(),
        result,
    })
}
