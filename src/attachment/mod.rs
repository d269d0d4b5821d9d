pub mod handler;

pub use handler::{AttachmentError, AttachmentHandler, AttachmentOutcome};
