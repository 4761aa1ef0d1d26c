//! Domain events and their recorded (persisted) form.

pub mod event;
pub mod handler;
pub mod record;

pub use event::Event;
pub use handler::execute;
pub use record::{RecordedEvent, validate_stream};
