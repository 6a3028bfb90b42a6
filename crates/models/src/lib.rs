pub mod error;
pub mod market;
pub mod trading;
pub mod features;

pub use error::*;
pub use market::*;
pub use trading::*;
pub use features::*;
