use std::fmt;
use std::path::PathBuf;

use super::chunk::{ChunkArena, split_into_chunks};
use super::negotiate::SessionDescriptor;
use crate::error::{Result, TransferError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Pending,
    Negotiating,
    Initializing,
    Uploading,
    Merging,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Forward-only lifecycle; any live state may fail.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Completed | Failed, _) => false,
            (_, Failed) => true,
            (Pending, Negotiating)
            | (Negotiating, Initializing)
            | (Initializing, Uploading)
            | (Uploading, Merging)
            | (Merging, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Negotiating => "negotiating",
            Self::Initializing => "initializing",
            Self::Uploading => "uploading",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// State of one upload, from negotiation to merge.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub file_path: PathBuf,
    pub file_name: String,
    pub total_size: u64,
    pub chunk_size: u64,
    /// Absolute object URL.
    pub endpoint_url: String,
    pub auth_token: String,
    pub biz_id: u64,
    /// Set by a successful init.
    pub upload_id: Option<String>,
    pub status: SessionStatus,
    pub chunks: ChunkArena,
    descriptor: Option<SessionDescriptor>,
}

impl TransferSession {
    pub fn new(file_path: impl Into<PathBuf>, file_name: impl Into<String>, total_size: u64) -> Self {
        Self {
            file_path: file_path.into(),
            file_name: file_name.into(),
            total_size,
            chunk_size: 0,
            endpoint_url: String::new(),
            auth_token: String::new(),
            biz_id: 0,
            upload_id: None,
            status: SessionStatus::Pending,
            chunks: ChunkArena::default(),
            descriptor: None,
        }
    }

    /// Session for `file_path` bound to an already negotiated descriptor.
    ///
    /// Starts in `Negotiating`, ready to be initialized.
    pub fn from_descriptor(
        file_path: impl Into<PathBuf>,
        file_name: impl Into<String>,
        total_size: u64,
        descriptor: SessionDescriptor,
    ) -> Self {
        let mut session = Self::new(file_path, file_name, total_size);
        session.status = SessionStatus::Negotiating;
        session.apply_descriptor(descriptor);
        session
    }

    pub(crate) fn apply_descriptor(&mut self, descriptor: SessionDescriptor) {
        self.chunk_size = descriptor.chunk_size;
        self.endpoint_url = descriptor.object_url();
        self.auth_token = descriptor.auth.clone();
        self.biz_id = descriptor.biz_id;
        self.descriptor = Some(descriptor);
    }

    pub fn descriptor(&self) -> Option<&SessionDescriptor> {
        self.descriptor.as_ref()
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: SessionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(TransferError::invalid_state(
                match next {
                    SessionStatus::Negotiating => "negotiate",
                    SessionStatus::Initializing => "initialize",
                    SessionStatus::Uploading => "upload parts",
                    SessionStatus::Merging => "merge",
                    SessionStatus::Completed => "complete",
                    SessionStatus::Failed => "fail",
                    SessionStatus::Pending => "reset",
                },
                self.status,
            ));
        }
        self.status = next;
        Ok(())
    }

    /// Mark the session failed unless it already ended.
    pub fn fail(&mut self) {
        if !self.status.is_terminal() {
            self.status = SessionStatus::Failed;
        }
    }

    /// Build the chunk arena from `total_size` and `chunk_size`.
    pub fn split(&mut self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(TransferError::configuration("chunk size must be positive"));
        }
        self.chunks = ChunkArena::new(split_into_chunks(self.total_size, self.chunk_size));
        Ok(())
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunks.len() as u32
    }
}
