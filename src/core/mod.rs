pub mod clock;
pub mod error;
pub mod record;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BackendError, IdempotencyError, Result};
pub use record::{ErrorInfo, IdempotencyRecord, RecordStatus, Revision};
