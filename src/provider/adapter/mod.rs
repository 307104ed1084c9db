pub mod cumulative;
pub mod unified;

pub use cumulative::CumulativeTextProvider;
pub use unified::UnifiedChatProvider;
