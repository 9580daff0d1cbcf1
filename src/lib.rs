#[macro_use]
extern crate tracing;

pub mod badge;
pub mod classify;
pub mod context;
pub mod dns;
pub mod events;
pub mod export;
pub mod ledger;
pub mod record;
pub mod router;
pub mod settings;
pub mod storage;
