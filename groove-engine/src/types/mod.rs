//! Shared types for the attribution and strategy subsystems

mod ids;
mod learning;
mod params;
mod session;
mod signals;

pub use ids::{EventId, LearningId, SessionId};
pub use learning::{Learning, LearningCategory, LearningContent, LearningStatus};
pub use params::AdaptiveParam;
pub use session::{ContextType, Outcome, SessionClosed};
pub use signals::{LightweightEvent, LightweightSignal, SignalPolarity};
