pub mod feed;
pub mod icons;
pub mod progress;
pub mod render;

pub use feed::{ActivityFeed, FeedItem};
pub use progress::CiSpinner;
