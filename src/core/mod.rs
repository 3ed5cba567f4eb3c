pub mod alert;
pub mod channel;
pub mod error;
pub mod time;

pub use alert::*;
pub use channel::*;
pub use error::*;
pub use time::*;
