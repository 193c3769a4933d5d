use std::collections::BTreeMap;
use std::fmt;

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Pending,
    /// In flight, retries included.
    Uploading,
    Completed,
    Failed,
}

/// One part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkTask {
    /// 1-based, unique within a session.
    pub part_number: u32,
    pub range: ByteRange,
    pub status: ChunkStatus,
    /// Retries used so far (attempts - 1).
    pub retry_count: u32,
}

impl ChunkTask {
    fn new(part_number: u32, range: ByteRange) -> Self {
        Self {
            part_number,
            range,
            status: ChunkStatus::Pending,
            retry_count: 0,
        }
    }

    /// Zero-based index of the part.
    pub fn index(&self) -> u32 {
        self.part_number - 1
    }
}

/// Split `total_size` bytes into parts of `chunk_size` bytes.
///
/// Part `i` (1-based) covers `[(i-1)*chunk_size, min(i*chunk_size, total_size))`.
/// An empty file has no parts; a zero chunk size yields nothing either and
/// is rejected by the engine before it gets here.
pub fn split_into_chunks(total_size: u64, chunk_size: u64) -> Vec<ChunkTask> {
    if chunk_size == 0 {
        return Vec::new();
    }
    let count = total_size.div_ceil(chunk_size);
    (0..count)
        .map(|i| {
            let start = i * chunk_size;
            let end = (start + chunk_size).min(total_size);
            ChunkTask::new(i as u32 + 1, ByteRange { start, end })
        })
        .collect()
}

/// Chunk tasks of one session, ordered by part number.
#[derive(Debug, Clone, Default)]
pub struct ChunkArena {
    tasks: BTreeMap<u32, ChunkTask>,
}

impl ChunkArena {
    pub fn new(tasks: Vec<ChunkTask>) -> Self {
        Self {
            tasks: tasks.into_iter().map(|t| (t.part_number, t)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, part_number: u32) -> Option<&ChunkTask> {
        self.tasks.get(&part_number)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChunkTask> {
        self.tasks.values()
    }

    /// Put a task back after its worker is done with it.
    pub fn store(&mut self, task: ChunkTask) {
        self.tasks.insert(task.part_number, task);
    }

    /// Mark every unfinished task as in flight and hand out copies, in part order.
    pub(crate) fn dispatch_pending(&mut self) -> Vec<ChunkTask> {
        self.tasks
            .values_mut()
            .filter(|t| t.status != ChunkStatus::Completed)
            .map(|t| {
                t.status = ChunkStatus::Uploading;
                t.clone()
            })
            .collect()
    }

    /// Tasks whose worker was aborted go back to `Pending`.
    pub(crate) fn reset_in_flight(&mut self) {
        for task in self.tasks.values_mut() {
            if task.status == ChunkStatus::Uploading {
                task.status = ChunkStatus::Pending;
            }
        }
    }

    pub fn all_completed(&self) -> bool {
        self.tasks.values().all(|t| t.status == ChunkStatus::Completed)
    }

    pub fn completed_bytes(&self) -> u64 {
        self.tasks
            .values()
            .filter(|t| t.status == ChunkStatus::Completed)
            .map(|t| t.range.len())
            .sum()
    }
}
