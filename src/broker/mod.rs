pub mod engine;
pub mod manager;
pub mod message;
pub mod topic;
pub mod visitor;

pub use engine::{Server, Subscription};
pub use manager::{ManagerStats, UserManager};
pub use message::{Event, Message, SinceMarker};
pub use topic::Topic;
pub use visitor::Visitor;
