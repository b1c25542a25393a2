//! Test doubles shared by the module tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::adapter::{
    CapabilityRequest, CapabilityResponse, CapabilityTransport, ProviderError, TransportFailure,
};
use crate::capability::CapabilityDescriptor;
use crate::store::{content_hash, encode_payload, ResultRef, ResultStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, String), (Value, String)>>,
}

impl MemoryStore {
    pub fn entry_count(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn put(
        &self,
        run_id: &str,
        payload: &Value,
        content_type: &str,
    ) -> Result<ResultRef, StoreError> {
        let bytes = encode_payload(payload)?;
        let hash = content_hash(run_id, &bytes);
        let mut entries = self.entries.lock().expect("lock");
        entries.insert(
            (run_id.to_string(), hash.clone()),
            (payload.clone(), content_type.to_string()),
        );
        Ok(ResultRef {
            location: format!("memory://{}/{}", run_id, hash),
            ref_id: hash,
            run_id: run_id.to_string(),
            size_bytes: bytes.len() as u64,
            content_type: content_type.to_string(),
        })
    }

    async fn get(&self, reference: &ResultRef) -> Result<Value, StoreError> {
        let entries = self.entries.lock().expect("lock");
        entries
            .get(&(reference.run_id.clone(), reference.ref_id.clone()))
            .map(|(value, _)| value.clone())
            .ok_or_else(|| StoreError::ReferenceNotFound(reference.ref_id.clone()))
    }

    async fn delete(&self, reference: &ResultRef) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().expect("lock");
        entries.remove(&(reference.run_id.clone(), reference.ref_id.clone()));
        Ok(())
    }

    async fn purge_run(&self, run_id: &str) -> Result<usize, StoreError> {
        let mut entries = self.entries.lock().expect("lock");
        let before = entries.len();
        entries.retain(|(run, _), _| run != run_id);
        Ok(before - entries.len())
    }
}

/// One scripted provider reaction.
#[derive(Clone)]
pub enum Step {
    Ok(Value),
    Fail(ProviderError),
    Transport(TransportFailure),
    Delay(Duration, Value),
}

#[derive(Debug, Clone)]
pub struct CallRecord {
    pub capability: String,
    pub arguments: Value,
    pub started: Instant,
    pub finished: Instant,
}

/// Transport that replays a script per capability; the last step repeats.
pub struct ScriptedTransport {
    name: String,
    descriptors: Vec<CapabilityDescriptor>,
    scripts: Mutex<HashMap<String, Vec<Step>>>,
    log: Mutex<Vec<CallRecord>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            descriptors: Vec::new(),
            scripts: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with_script(self, capability: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .expect("lock")
            .insert(capability.to_string(), steps);
        self
    }

    pub fn with_descriptor(mut self, descriptor: CapabilityDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn calls(&self, capability: &str) -> usize {
        self.log
            .lock()
            .expect("lock")
            .iter()
            .filter(|record| record.capability == capability)
            .count()
    }

    pub fn records(&self) -> Vec<CallRecord> {
        self.log.lock().expect("lock").clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_step(&self, capability: &str) -> Step {
        let mut scripts = self.scripts.lock().expect("lock");
        match scripts.get_mut(capability) {
            Some(steps) if steps.len() > 1 => steps.remove(0),
            Some(steps) if steps.len() == 1 => steps[0].clone(),
            _ => Step::Ok(serde_json::json!({"capability": capability})),
        }
    }
}

#[async_trait]
impl CapabilityTransport for ScriptedTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discover(&self) -> Result<Vec<CapabilityDescriptor>, TransportFailure> {
        Ok(self.descriptors.clone())
    }

    async fn call(
        &self,
        descriptor: &CapabilityDescriptor,
        request: CapabilityRequest,
    ) -> Result<CapabilityResponse, TransportFailure> {
        let started = Instant::now();
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        let step = self.next_step(&descriptor.name);
        let outcome = match step {
            Step::Ok(value) => Ok(CapabilityResponse::ok(value)),
            Step::Fail(error) => Ok(CapabilityResponse::failed(error)),
            Step::Transport(failure) => Err(failure),
            Step::Delay(delay, value) => {
                tokio::time::sleep(delay).await;
                Ok(CapabilityResponse::ok(value))
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.log.lock().expect("lock").push(CallRecord {
            capability: descriptor.name.clone(),
            arguments: request.arguments,
            started,
            finished: Instant::now(),
        });
        outcome
    }
}
