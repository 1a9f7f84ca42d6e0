pub mod body_inspector;
pub mod classifier;
pub mod obfuscation;
pub mod rules;

pub use body_inspector::*;
pub use classifier::*;
pub use obfuscation::*;
pub use rules::*;
