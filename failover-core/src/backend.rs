use crate::data::{SyntheticRecord, TransactionCountSnapshot};
use crate::error::BackendError;

/// The only database surface the engine depends on.
///
/// Implementations own their connection handling: [`Backend::insert_record`] draws from a bounded
/// pool, while [`Backend::probe`] must use a dedicated connection that is never shared with the
/// workers, so a saturated pool cannot starve outage detection.
#[trait_variant::make(Send)]
pub trait Backend: Send + Sync + 'static {
    /// Verify connectivity and make sure the record table exists. Any error here is fatal.
    async fn prepare(&self) -> Result<(), BackendError>;

    /// Number of synthetic records currently stored.
    async fn count_records(&self) -> Result<u64, BackendError>;

    /// Insert exactly one durable record.
    async fn insert_record(&self, record: &SyntheticRecord) -> Result<(), BackendError>;

    /// Trivial liveness read over a dedicated connection.
    async fn probe(&self) -> Result<(), BackendError>;
}

pub async fn capture_count<B: Backend>(backend: &B) -> Result<TransactionCountSnapshot, BackendError> {
    let count = backend.count_records().await?;
    Ok(TransactionCountSnapshot::new(count))
}
