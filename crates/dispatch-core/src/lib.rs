pub mod collector;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod governor;
pub mod outcome;
pub mod report;
pub mod shaper;
pub mod sink;
pub mod stats;
pub mod task;
pub mod time_box;

pub use collector::*;
pub use config::*;
pub use dispatcher::*;
pub use error::*;
pub use executor::*;
pub use governor::*;
pub use outcome::*;
pub use report::*;
pub use shaper::*;
pub use sink::*;
pub use stats::*;
pub use task::*;
pub use time_box::*;
