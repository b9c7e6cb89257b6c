pub mod event_types;
pub mod ndjson;
