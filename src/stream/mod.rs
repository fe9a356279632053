pub mod events;
pub mod frames;

pub use events::AgentEvent;
pub use frames::{event_stream, FrameParser};
