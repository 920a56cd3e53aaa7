pub mod events;
pub mod param;
pub mod tally;
