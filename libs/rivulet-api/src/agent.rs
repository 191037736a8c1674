use std::future::Future;
use std::pin::Pin;

use crate::error::HandlerError;
use crate::record::Record;

/// User-supplied asynchronous handler bound to one or more topics.
///
/// The runtime feeds each agent from a bounded per-partition queue and
/// awaits `on_record` for every delivered record, which realizes the
/// "lazy, unbounded, restartable sequence" of records: handlers see one
/// record at a time, in offset order per partition, resuming after the
/// committed cursor on reconnect.
///
/// Returning `Err` triggers the agent's restart policy; the record's
/// offset is not committed until `on_record` returns `Ok`.
pub trait Agent: Send + Sync {
    fn on_record(
        &self,
        record: &Record,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>>;
}
