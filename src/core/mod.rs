// Core modules implementing cycle storage, framing, indexing, locking and appends.
pub mod appender;
pub mod clock;
pub mod error;
pub mod format;
pub mod header;
pub mod index;
pub mod lock;
pub mod pretouch;
pub mod queue;
pub mod region;
pub mod roll;
pub mod store;
pub mod validate;
