//! Background disk cache writer
//!
//! Moves program persistence off the render thread. All writes go through a
//! single worker, which is the only writer of the stores while it runs.

use crate::program_store::ProgramStore;
use crate::types::CachedShaderProgram;
use crossbeam::channel::{self, Sender};
use oc_core::{Result, ShaderCacheError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

enum WriterJob {
    AddShader {
        program: Arc<CachedShaderProgram>,
        host_code: Vec<u8>,
    },
}

/// Single-threaded queue of pending disk writes
pub struct BackgroundDiskCacheWriter {
    sender: Option<Sender<WriterJob>>,
    worker: Option<JoinHandle<()>>,
    /// First write error, reported by `shutdown`
    error: Arc<Mutex<Option<ShaderCacheError>>>,
}

impl BackgroundDiskCacheWriter {
    pub fn new(store: Arc<ProgramStore>) -> Result<Self> {
        let (sender, receiver) = channel::unbounded::<WriterJob>();
        let error = Arc::new(Mutex::new(None));
        let worker_error = error.clone();

        let worker = thread::Builder::new()
            .name("shader-cache-writer".to_string())
            .spawn(move || {
                for job in receiver {
                    match job {
                        WriterJob::AddShader { program, host_code } => {
                            if let Err(e) = store.add_shader(&program, &host_code) {
                                tracing::error!("Failed to write shader to disk cache: {}", e);
                                worker_error.lock().get_or_insert(e);
                            }
                        }
                    }
                }
                tracing::debug!("Shader cache writer stopped");
            })?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            error,
        })
    }

    /// Queue a program for persistence and return immediately
    pub fn add_shader(&self, program: Arc<CachedShaderProgram>, host_code: Vec<u8>) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(ShaderCacheError::WriterStopped)?;
        sender
            .send(WriterJob::AddShader { program, host_code })
            .map_err(|_| ShaderCacheError::WriterStopped)
    }

    /// Finish every queued write and stop the worker
    pub fn shutdown(mut self) -> Result<()> {
        self.stop();
        match self.error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn stop(&mut self) {
        self.sender = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Shader cache writer thread panicked");
            }
        }
    }
}

impl Drop for BackgroundDiskCacheWriter {
    fn drop(&mut self) {
        self.stop();
    }
}
