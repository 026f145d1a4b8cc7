/// Identifies one synchronized widget model within a document session.
pub type ModelId = String;

/// Per-model monotonic sequence number used for last-writer-wins conflict
/// resolution. This is a counter, not wall-clock time, so it is robust to
/// clock skew between clients.
pub type SequenceNumber = u64;

/// Identity of a comm channel. A model's channel reuses the model's id.
pub type CommId = String;
