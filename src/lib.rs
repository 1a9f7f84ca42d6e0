pub mod config;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod reputation;
pub mod waf;

pub use config::*;
pub use error::*;
pub use metrics::*;
pub use proxy::*;
pub use reputation::*;
pub use waf::*;
