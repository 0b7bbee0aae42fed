mod defaults;
mod resolve;
mod types;

pub use self::defaults::parse_human_duration;
pub use self::resolve::{load_config, parse_config};
pub use self::types::*;
