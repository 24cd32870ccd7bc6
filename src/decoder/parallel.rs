//! Parallel whole-document decoder.
//!
//! Workers pop entity ids from a shared counter and decode bodies with
//! reference tags left in place; every worker holds its own cursor into the
//! read-only map, so the only shared state is the counter and the result
//! map, each behind its own mutex. A final pass on the calling thread
//! splices referenced entities into the root.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::thread;

use tracing::{debug, warn};

use crate::encoder::default_workers;
use crate::error::{acquire_lock, ChaosError, Result};
use crate::model::Value;

use super::MappedDocument;

pub struct ParallelDecoder {
    custom_sizes: HashMap<u8, usize>,
    workers: Option<usize>,
}

impl Default for ParallelDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ParallelDecoder {
    pub fn new() -> Self {
        Self {
            custom_sizes: HashMap::new(),
            workers: None,
        }
    }

    pub fn with_workers(workers: usize) -> Self {
        Self {
            custom_sizes: HashMap::new(),
            workers: Some(workers),
        }
    }

    pub fn register_custom_size(&mut self, id: u8, size: usize) {
        self.custom_sizes.insert(id, size);
    }

    pub fn decode(&self, path: impl AsRef<Path>) -> Result<Value> {
        let doc = MappedDocument::open(path.as_ref(), self.custom_sizes.clone())?;
        let total = doc.entity_count() as u64;
        if total == 0 {
            return Err(ChaosError::Malformed("document has no entities".into()));
        }
        let workers = self
            .workers
            .unwrap_or_else(default_workers)
            .clamp(1, total as usize);

        let next_id = Mutex::new(0u64);
        let entities: Mutex<HashMap<u64, Value>> = Mutex::new(HashMap::new());
        let doc_ref = &doc;

        thread::scope(|scope| -> Result<()> {
            let mut handles = Vec::with_capacity(workers);
            for _ in 0..workers {
                handles.push(scope.spawn(|| -> Result<()> {
                    loop {
                        let id = {
                            let mut counter = acquire_lock(&next_id)?;
                            if *counter >= total {
                                return Ok(());
                            }
                            let id = *counter;
                            *counter += 1;
                            id
                        };
                        let value = doc_ref.decode_entity_raw(id)?;
                        acquire_lock(&entities)?.insert(id, value);
                    }
                }));
            }
            for handle in handles {
                handle
                    .join()
                    .map_err(|_| ChaosError::Malformed("decoder worker panicked".into()))??;
            }
            Ok(())
        })?;

        let entities = entities
            .into_inner()
            .map_err(|_| ChaosError::Malformed("decoder state poisoned".into()))?;
        let mut root = entities
            .get(&0)
            .cloned()
            .ok_or_else(|| ChaosError::Malformed("root entity missing after decode".into()))?;

        let mut visited = HashSet::new();
        resolve_references(&mut root, &entities, &mut visited);
        debug!(entities = entities.len(), workers, "decoded document in parallel");
        Ok(root)
    }
}

/// Splices referenced entities in place of their reference slots. Ids stay
/// in `visited` only while their expansion is on the stack, so a diamond
/// materializes both arms while a true cycle collapses to `Null`.
fn resolve_references(
    value: &mut Value,
    entities: &HashMap<u64, Value>,
    visited: &mut HashSet<u64>,
) {
    match value {
        Value::Reference(id) => {
            let id = *id;
            if !visited.insert(id) {
                warn!(entity = id, "cyclic reference; substituting null");
                *value = Value::Null;
                return;
            }
            match entities.get(&id) {
                Some(entity) => {
                    let mut spliced = entity.clone();
                    resolve_references(&mut spliced, entities, visited);
                    *value = spliced;
                }
                None => *value = Value::Null,
            }
            visited.remove(&id);
        }
        Value::Object(obj) => {
            for field in obj.values_mut() {
                resolve_references(field, entities, visited);
            }
        }
        Value::List(list) => {
            for element in list.iter_mut() {
                resolve_references(element, entities, visited);
            }
        }
        _ => {}
    }
}
