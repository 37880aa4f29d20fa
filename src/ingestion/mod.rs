//! Ingestion front end: the bounded gateway and the HTTP receiver that feeds
//! it.

pub mod gateway;
pub mod server;

pub use gateway::{
    decode_payload, IngestionGateway, PollResult, ShutdownReport, SubmissionReceipt,
    RECEIVED_AT_KEY, REQUEST_ID_KEY,
};
pub use server::{HttpReceiver, IngestResponse};
