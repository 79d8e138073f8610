// Copyright (c) 2026 Lansend
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Host-facing transfer events.
//!
//! Both callbacks run inside request handlers; implementations must not
//! block for long. A host wanting a queue can forward into a channel.

use std::path::PathBuf;
use std::sync::Arc;

use crate::core::types::{DeviceInfo, FileInfo};

/// Final accounting delivered once per completed file.
#[derive(Clone, Debug)]
pub struct CompletionInfo {
    /// Where the file was written.
    pub file_path: PathBuf,
    /// Wall-clock seconds from first byte to completion.
    pub total_time_seconds: f64,
    /// Bytes per second over the whole file (0 when elapsed time is 0).
    pub average_speed: f64,
}

/// Periodic progress for one file of one session.
#[derive(Clone, Debug)]
pub struct ProgressUpdate {
    /// File id within the session.
    pub file_id: String,
    /// File name from the transfer descriptor (may carry a relative
    /// subpath; the file on disk is its sanitized basename).
    pub file_name: String,
    /// Bytes received so far.
    pub bytes_received: u64,
    /// Descriptor size.
    pub total_bytes: u64,
    /// Current transfer rate in bytes per second.
    pub bytes_per_second: f64,
    /// Set once, on the terminal chunk.
    pub finished: bool,
    /// Present iff `finished`.
    pub completion: Option<CompletionInfo>,
}

/// Decides whether an inbound prepare-upload is accepted. Not consulted when
/// a PIN is required (the PIN replaces interactive confirmation).
pub type TransferRequestFn = dyn Fn(&DeviceInfo, &[FileInfo]) -> bool + Send + Sync;

/// Receives progress updates, throttled to at most one per 100 ms per chunk
/// plus one per chunk end.
pub type TransferProgressFn = dyn Fn(&ProgressUpdate) + Send + Sync;

/// Host-supplied callbacks, both optional.
#[derive(Clone, Default)]
pub struct TransferObserver {
    /// Invoked once per prepare-upload when no PIN is required.
    pub on_request: Option<Arc<TransferRequestFn>>,
    /// Invoked during streaming and on completion.
    pub on_progress: Option<Arc<TransferProgressFn>>,
}

impl TransferObserver {
    /// Observer that accepts every transfer and discards progress.
    pub fn accept_all() -> Self {
        Self {
            on_request: Some(Arc::new(|_, _| true)),
            on_progress: None,
        }
    }

    /// Consult the request callback; absent callback means accept.
    pub fn request(&self, sender: &DeviceInfo, files: &[FileInfo]) -> bool {
        match &self.on_request {
            Some(f) => f(sender, files),
            None => true,
        }
    }

    /// Deliver a progress update, if anyone listens.
    pub fn progress(&self, update: &ProgressUpdate) {
        if let Some(f) = &self.on_progress {
            f(update);
        }
    }
}
