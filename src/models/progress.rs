//! Upload progress for a single chunked file.

use serde::Serialize;

/// How many chunks of one file are on disk versus how many the client
/// announced.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct UploadProgress {
    pub received: u32,
    pub total: u32,
}

impl UploadProgress {
    pub fn new(received: u32, total: u32) -> Self {
        Self { received, total }
    }

    pub fn is_complete(&self) -> bool {
        is_complete(self.received, self.total)
    }
}

/// A file is complete once every announced chunk has arrived.
/// A file that announces zero chunks is never complete.
pub fn is_complete(received: u32, total: u32) -> bool {
    total > 0 && received >= total
}
