//! Saga journal adapters.

pub mod postgres;

pub use self::postgres::PostgresSagaJournal;
