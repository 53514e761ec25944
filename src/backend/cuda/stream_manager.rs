// src/backend/cuda/stream_manager.rs
use crate::error::{GraphError, Result};
use cudarc::driver::{CudaContext, CudaStream};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Name of the stream every kernel and copy of a context is queued on. Using one
/// stream keeps copies ordered after the kernels that produced the data.
pub const COMPUTE_STREAM: &str = "compute";

/// Named CUDA streams of one context. Does not own the context.
#[derive(Default)]
pub struct StreamManager {
    streams: Mutex<HashMap<String, Arc<CudaStream>>>,
}

impl StreamManager {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Arc<CudaStream>>>> {
        self.streams
            .lock()
            .map_err(|_| GraphError::device("stream table poisoned"))
    }

    /// Creates the stream if it does not exist yet and returns it.
    pub fn create_stream(&self, ctx: &Arc<CudaContext>, name: &str) -> Result<Arc<CudaStream>> {
        let mut streams = self.lock()?;
        if let Some(stream) = streams.get(name) {
            return Ok(stream.clone());
        }
        let stream = ctx
            .new_stream()
            .map_err(|e| GraphError::device(format!("failed to create stream '{name}': {e}")))?;
        streams.insert(name.to_string(), stream.clone());
        Ok(stream)
    }

    pub fn get_stream(&self, name: &str) -> Option<Arc<CudaStream>> {
        self.lock().ok()?.get(name).cloned()
    }

    /// Blocks until every operation queued on `name` has completed.
    pub fn sync_stream(&self, name: &str) -> Result<()> {
        let stream = self
            .get_stream(name)
            .ok_or_else(|| GraphError::device(format!("stream '{name}' not found")))?;
        stream
            .synchronize()
            .map_err(|e| GraphError::device(format!("failed to sync stream '{name}': {e}")))
    }
}
