pub mod error;
pub mod frame;
pub mod timestamp;

pub use error::{ConfigError, RecordingsError, RecordingsResult, RelayError};
pub use frame::{ConsumerId, Frame};
