mod events;
mod properties;
mod runs;

pub use events::EventRepository;
pub use properties::PropertyRepository;
pub use runs::RunRepository;
