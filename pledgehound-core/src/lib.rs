pub mod collect;
pub mod contacts;
pub mod data;
pub mod enrich;
pub mod error;
pub mod export;
pub mod model;
pub mod sync;
