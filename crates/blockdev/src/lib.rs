mod blockdev;
pub use blockdev::*;
