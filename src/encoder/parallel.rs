//! Parallel encoder.
//!
//! A serial pre-pass walks the tree once, assigning entity ids and interning
//! every object key, so the dictionary and id assignments are frozen before
//! any worker runs. Body synthesis then fans out over a pool: each task
//! encodes one entity from the immutable job table, and chunks are stitched
//! together in id order.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

use tracing::debug;

use crate::error::{acquire_lock, ChaosError, Result};
use crate::format::Dictionary;
use crate::model::Value;

use super::{
    build_header, default_workers, encode_entity, write_file, EncodeCx, EncoderConfig,
};

struct EntityJob<'a> {
    value: &'a Value,
    /// Ids of this entity's container children, in field/element order.
    child_ids: Vec<u64>,
}

pub struct ParallelEncoder {
    config: EncoderConfig,
}

impl Default for ParallelEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ParallelEncoder {
    pub fn new() -> Self {
        Self::with_config(EncoderConfig::default())
    }

    pub fn with_config(config: EncoderConfig) -> Self {
        Self { config }
    }

    pub fn encode(&self, root: &Value, path: impl AsRef<Path>) -> Result<()> {
        if !root.is_container() {
            return Err(ChaosError::InvalidArgument(
                "document root must be an object or a list".into(),
            ));
        }

        let mut dict = Dictionary::new();
        let jobs = assign_entities(root, &mut dict);
        let total = jobs.len();
        let workers = self
            .config
            .workers
            .unwrap_or_else(default_workers)
            .clamp(1, total);

        let chunks = Mutex::new(vec![None::<Vec<u8>>; total]);
        let next = AtomicUsize::new(0);
        let wide_floats = self.config.wide_floats;
        let dict_ref = &dict;
        let jobs_ref = &jobs;

        thread::scope(|scope| -> Result<()> {
            let mut handles = Vec::with_capacity(workers);
            for _ in 0..workers {
                handles.push(scope.spawn(|| -> Result<()> {
                    loop {
                        let id = next.fetch_add(1, Ordering::Relaxed);
                        if id >= total {
                            return Ok(());
                        }
                        let job = &jobs_ref[id];
                        let mut out = Vec::new();
                        let mut cx = PooledCx {
                            dict: dict_ref,
                            child_ids: job.child_ids.iter(),
                        };
                        encode_entity(&mut cx, job.value, wide_floats, &mut out)?;
                        acquire_lock(&chunks)?[id] = Some(out);
                    }
                }));
            }
            for handle in handles {
                handle
                    .join()
                    .map_err(|_| ChaosError::Malformed("encoder worker panicked".into()))??;
            }
            Ok(())
        })?;

        let chunks = chunks
            .into_inner()
            .map_err(|_| ChaosError::Malformed("encoder state poisoned".into()))?;
        let mut body = Vec::with_capacity(1024 * 1024);
        let mut offsets = Vec::with_capacity(total);
        for chunk in chunks {
            let chunk = chunk
                .ok_or_else(|| ChaosError::Malformed("entity chunk missing after encode".into()))?;
            offsets.push(body.len() as u64);
            body.extend_from_slice(&chunk);
        }

        let header = build_header(&dict, &offsets, body.len());
        write_file(path.as_ref(), &header, &body)?;
        debug!(
            entities = total,
            workers,
            body_bytes = body.len(),
            "encoded document in parallel"
        );
        Ok(())
    }
}

/// Depth-first id assignment. Every container gets an id in pop order; the
/// slot each child occupies in its parent's job is backpatched once the
/// child's id is known.
fn assign_entities<'a>(root: &'a Value, dict: &mut Dictionary) -> Vec<EntityJob<'a>> {
    let mut jobs: Vec<EntityJob<'a>> = Vec::new();
    let mut stack: Vec<(&'a Value, Option<(usize, usize)>)> = vec![(root, None)];

    while let Some((value, origin)) = stack.pop() {
        let id = jobs.len();
        if let Some((parent, slot)) = origin {
            jobs[parent].child_ids[slot] = id as u64;
        }

        let mut container_children = 0;
        match value {
            Value::Object(obj) => {
                for (key, child) in obj.iter() {
                    dict.intern(key);
                    if child.is_container() {
                        container_children += 1;
                    }
                }
            }
            Value::List(list) => {
                for child in list.iter() {
                    if child.is_container() {
                        container_children += 1;
                    }
                }
            }
            _ => {}
        }
        jobs.push(EntityJob {
            value,
            child_ids: vec![0; container_children],
        });

        let mut slot = container_children;
        match value {
            Value::Object(obj) => {
                for (_, child) in obj.iter().collect::<Vec<_>>().into_iter().rev() {
                    if child.is_container() {
                        slot -= 1;
                        stack.push((child, Some((id, slot))));
                    }
                }
            }
            Value::List(list) => {
                for child in list.iter().collect::<Vec<_>>().into_iter().rev() {
                    if child.is_container() {
                        slot -= 1;
                        stack.push((child, Some((id, slot))));
                    }
                }
            }
            _ => {}
        }
    }
    jobs
}

struct PooledCx<'b> {
    dict: &'b Dictionary,
    child_ids: std::slice::Iter<'b, u64>,
}

impl<'a, 'b> EncodeCx<'a> for PooledCx<'b> {
    fn key_index(&mut self, key: &str) -> Result<u64> {
        self.dict.lookup(key).ok_or_else(|| {
            ChaosError::InvalidArgument(format!("key {key:?} missing from dictionary"))
        })
    }

    fn child_id(&mut self, _child: &'a Value) -> Result<u64> {
        self.child_ids.next().copied().ok_or_else(|| {
            ChaosError::InvalidArgument("child id table out of sync with entity".into())
        })
    }
}
