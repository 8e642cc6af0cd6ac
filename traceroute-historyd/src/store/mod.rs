pub mod db;

pub use db::{timestamp_now, HistoryDb, HistoryFilter, Key, NewEntry, Page};
